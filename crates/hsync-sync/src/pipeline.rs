use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hsync_adapters::{build_adapter, AdapterContext, SourceAdapter, SourceBatch, SourceError};
use hsync_core::{Listing, WriteOperation};
use hsync_storage::{
    HttpClientConfig, HttpFetcher, ListingStore, StoreError, StoreGateway, TokenBucketConfig,
    WriteResult,
};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ConfigError, SourceRegistry, SyncConfig};
use crate::dedup::{DedupConfig, DedupEngine, DedupOutcome};
use crate::normalize::normalize;
use crate::reconcile::{reconcile, ReconcilePolicy};

pub const LEASE_NAME: &str = "hackathon-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("another run holds the {name} lease")]
    LeaseHeld { name: String },
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("scheduler: {0}")]
    Scheduler(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Apply,
    /// Reconcile against the store but write nothing. Takes no lease, so it
    /// never blocks a scheduled run.
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreFailure {
    pub identity_key: String,
    pub operation: WriteOperation,
    pub error: String,
}

/// Outcome of one pipeline execution. Category counts reflect applied writes
/// (or planned writes on a dry run).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub dry_run: bool,
    pub sources_attempted: usize,
    pub sources_succeeded: usize,
    pub fetched: usize,
    pub skipped_malformed: usize,
    pub normalization_failed: usize,
    pub duplicates_collapsed: usize,
    pub new: usize,
    pub changed: usize,
    pub reactivated: usize,
    pub unchanged: usize,
    pub absent: usize,
    pub stale: usize,
    pub failed: usize,
    pub source_errors: Vec<SourceError>,
    pub store_failures: Vec<StoreFailure>,
}

impl RunResult {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, mode: RunMode) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            duration_ms: 0,
            dry_run: mode == RunMode::DryRun,
            sources_attempted: 0,
            sources_succeeded: 0,
            fetched: 0,
            skipped_malformed: 0,
            normalization_failed: 0,
            duplicates_collapsed: 0,
            new: 0,
            changed: 0,
            reactivated: 0,
            unchanged: 0,
            absent: 0,
            stale: 0,
            failed: 0,
            source_errors: Vec::new(),
            store_failures: Vec::new(),
        }
    }

    pub fn all_sources_failed(&self) -> bool {
        self.sources_attempted > 0 && self.sources_succeeded == 0
    }

    fn record_write(&mut self, result: &WriteResult) {
        match &result.outcome {
            Ok(()) => self.count(result.operation),
            Err(err) => {
                self.failed += 1;
                self.store_failures.push(StoreFailure {
                    identity_key: result.identity_key.clone(),
                    operation: result.operation,
                    error: err.to_string(),
                });
            }
        }
    }

    fn count(&mut self, operation: WriteOperation) {
        match operation {
            WriteOperation::Create => self.new += 1,
            WriteOperation::Update => self.changed += 1,
            WriteOperation::Reactivate => self.reactivated += 1,
            WriteOperation::Touch => self.unchanged += 1,
            WriteOperation::RecordAbsence => self.absent += 1,
            WriteOperation::MarkStale => self.stale += 1,
        }
    }
}

pub struct ConfiguredSource {
    pub adapter: Arc<dyn SourceAdapter>,
    pub timeout: Duration,
}

pub struct SyncPipeline {
    sources: Vec<ConfiguredSource>,
    http: Arc<HttpFetcher>,
    gateway: StoreGateway,
    dedup: DedupEngine,
    policy: ReconcilePolicy,
    lease_ttl: Duration,
}

impl SyncPipeline {
    pub fn new(
        sources: Vec<ConfiguredSource>,
        http: Arc<HttpFetcher>,
        store: Arc<dyn ListingStore>,
        policy: ReconcilePolicy,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            sources,
            http,
            gateway: StoreGateway::new(store),
            dedup: DedupEngine::new(DedupConfig::default()),
            policy,
            lease_ttl,
        }
    }

    /// Builds one adapter per enabled registry entry and a shared fetcher with
    /// per-source pacing.
    pub async fn from_registry(
        config: &SyncConfig,
        registry: &SourceRegistry,
        store: Arc<dyn ListingStore>,
    ) -> Result<Self, ConfigError> {
        let http = HttpFetcher::new(HttpClientConfig {
            request_timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })
        .map_err(|e| ConfigError::HttpClient(format!("{e:#}")))?;

        let mut sources = Vec::new();
        for source in registry.enabled() {
            let adapter = build_adapter(&source.adapter).map_err(|e| ConfigError::InvalidSource {
                name: source.name().to_string(),
                reason: e.to_string(),
            })?;
            if let Some(interval) = source.request_interval() {
                http.set_source_pacing(source.name(), TokenBucketConfig::min_interval(interval))
                    .await;
            }
            sources.push(ConfiguredSource {
                adapter: Arc::from(adapter),
                timeout: source
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(config.source_timeout),
            });
        }

        Ok(Self::new(
            sources,
            Arc::new(http),
            store,
            ReconcilePolicy {
                stale_after_absences: config.stale_after_runs,
            },
            config.lease_ttl,
        ))
    }

    pub async fn run_once(&self) -> Result<RunResult, SyncError> {
        self.run(RunMode::Apply).await
    }

    /// Fetches every source, then normalizes, dedupes and reconciles under the
    /// run lease (applying runs only). Only snapshot and lease failures abort
    /// the run.
    pub async fn run(&self, mode: RunMode) -> Result<RunResult, SyncError> {
        let run_id = Uuid::new_v4();
        let clock = Instant::now();
        let mut result = RunResult::new(run_id, Utc::now(), mode);
        let span = info_span!("sync_run", %run_id, dry_run = result.dry_run);
        self.execute(run_id, mode, &mut result)
            .instrument(span)
            .await?;

        result.finished_at = Utc::now();
        result.duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            %run_id,
            new = result.new,
            changed = result.changed,
            reactivated = result.reactivated,
            unchanged = result.unchanged,
            absent = result.absent,
            stale = result.stale,
            failed = result.failed,
            source_errors = result.source_errors.len(),
            duration_ms = result.duration_ms,
            "sync run finished"
        );
        Ok(result)
    }

    async fn execute(
        &self,
        run_id: Uuid,
        mode: RunMode,
        result: &mut RunResult,
    ) -> Result<(), SyncError> {
        let listings = self.collect(run_id, result).await;
        let deduped = self.dedup.dedupe(listings);
        result.duplicates_collapsed = deduped.collapsed;
        info!(
            listings = deduped.listings.len(),
            collapsed = deduped.collapsed,
            "deduplicated listings"
        );

        if mode == RunMode::DryRun {
            return self.reconcile_and_apply(deduped, mode, result).await;
        }

        let store = self.gateway.store();
        if !store
            .try_acquire_lease(LEASE_NAME, run_id, self.lease_ttl)
            .await?
        {
            warn!(lease = LEASE_NAME, "another run holds the lease; skipping");
            return Err(SyncError::LeaseHeld {
                name: LEASE_NAME.to_string(),
            });
        }

        let outcome = self.reconcile_and_apply(deduped, mode, result).await;
        if let Err(err) = store.release_lease(LEASE_NAME, run_id).await {
            warn!(error = %err, "failed to release run lease");
        }
        outcome
    }

    async fn collect(&self, run_id: Uuid, result: &mut RunResult) -> Vec<Listing> {
        result.sources_attempted = self.sources.len();
        let mut listings = Vec::new();
        for outcome in self.fetch_all(run_id).await {
            let batch = match outcome {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(source = %err.source_name, cause = %err.cause, "source failed");
                    result.source_errors.push(err);
                    continue;
                }
            };
            result.sources_succeeded += 1;
            result.fetched += batch.records.len();
            result.skipped_malformed += batch.skipped;
            info!(
                source = %batch.source_name,
                records = batch.records.len(),
                skipped = batch.skipped,
                pages = batch.pages,
                "source fetched"
            );

            for record in &batch.records {
                match normalize(record) {
                    Ok(listing) => listings.push(listing),
                    Err(err) => {
                        warn!(error = %err, "dropping record");
                        result.normalization_failed += 1;
                    }
                }
            }
        }
        listings
    }

    /// Runs every adapter concurrently, each under its own timeout. Results come
    /// back in source order.
    async fn fetch_all(&self, run_id: Uuid) -> Vec<Result<SourceBatch, SourceError>> {
        let mut handles = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let adapter = Arc::clone(&source.adapter);
            let http = Arc::clone(&self.http);
            let timeout = source.timeout;
            let name = adapter.source_name().to_string();
            let span = info_span!("source_fetch", %run_id, source = %name, kind = ?adapter.kind());
            let task_name = name.clone();
            let handle = tokio::spawn(
                async move {
                    let ctx = AdapterContext::new(run_id);
                    match tokio::time::timeout(timeout, adapter.fetch(&http, &ctx)).await {
                        Ok(Ok(batch)) => Ok(batch),
                        Ok(Err(err)) => Err(SourceError::new(&task_name, err)),
                        Err(_) => Err(SourceError::new(
                            &task_name,
                            format!("timed out after {timeout:?}"),
                        )),
                    }
                }
                .instrument(span),
            );
            handles.push((name, handle));
        }

        let mut out = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            out.push(match handle.await {
                Ok(outcome) => outcome,
                Err(err) => Err(SourceError::new(name, format!("fetch task failed: {err}"))),
            });
        }
        out
    }

    async fn reconcile_and_apply(
        &self,
        deduped: DedupOutcome,
        mode: RunMode,
        result: &mut RunResult,
    ) -> Result<(), SyncError> {
        if result.sources_succeeded == 0 {
            warn!("no source succeeded; leaving absence counters untouched");
            return Ok(());
        }

        let incoming: Vec<String> = deduped
            .seen_keys()
            .into_iter()
            .map(str::to_owned)
            .collect();
        let snapshot = self.gateway.load_snapshot(&incoming).await?;
        let anchored = self.dedup.anchor(deduped, &snapshot);
        let plan = reconcile(&anchored, &snapshot, Utc::now(), self.policy);
        info!(
            writes = plan.writes.len(),
            new = plan.counts.new,
            changed = plan.counts.changed,
            reactivated = plan.counts.reactivated,
            unchanged = plan.counts.unchanged,
            absent = plan.counts.absent,
            stale = plan.counts.stale,
            "reconciled against store"
        );

        if mode == RunMode::DryRun {
            for write in &plan.writes {
                debug!(identity_key = %write.identity_key, operation = ?write.operation, "planned write");
                result.count(write.operation);
            }
            return Ok(());
        }

        for write in self.gateway.apply(&plan.writes).await {
            result.record_write(&write);
        }
        Ok(())
    }
}

/// Registers a job that runs the pipeline on `cron` (six fields, seconds
/// first). The caller starts and shuts down the scheduler.
pub async fn build_scheduler(
    pipeline: Arc<SyncPipeline>,
    cron: &str,
) -> Result<JobScheduler, SyncError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| SyncError::Scheduler(format!("creating scheduler: {e}")))?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(result) => debug!(run_id = %result.run_id, "scheduled run completed"),
                Err(SyncError::LeaseHeld { .. }) => {
                    info!("scheduled run skipped; previous run still holds the lease")
                }
                Err(err) => warn!(error = %err, "scheduled run failed"),
            }
        })
    })
    .map_err(|e| SyncError::Scheduler(format!("creating job for cron {cron:?}: {e}")))?;
    sched
        .add(job)
        .await
        .map_err(|e| SyncError::Scheduler(format!("adding job: {e}")))?;
    Ok(sched)
}
