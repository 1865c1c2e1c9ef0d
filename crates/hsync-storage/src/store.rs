//! Listing document store contract, an in-process implementation, and the
//! gateway that applies a write-set one record at a time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hsync_core::{ListingRecord, ListingStatus, WriteOp, WriteOperation, WritePayload};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no stored listing for key {0}")]
    MissingKey(String),
    #[error("write rejected for key {key}: {reason}")]
    Rejected { key: String, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub active: usize,
    pub stale: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.active + self.stale
    }
}

/// Document store addressed by `identity_key`. Each call is atomic for the
/// single key it touches.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn get(&self, identity_key: &str) -> Result<Option<ListingRecord>, StoreError>;

    async fn get_many(&self, identity_keys: &[String]) -> Result<Vec<ListingRecord>, StoreError> {
        let mut out = Vec::with_capacity(identity_keys.len());
        for key in identity_keys {
            if let Some(record) = self.get(key).await? {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn upsert(&self, record: &ListingRecord) -> Result<(), StoreError>;

    /// Applies a field patch to an existing document. Document payloads are
    /// routed through [`ListingStore::upsert`].
    async fn patch(&self, identity_key: &str, payload: &WritePayload) -> Result<(), StoreError>;

    async fn list_active_keys(&self) -> Result<Vec<String>, StoreError>;

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError>;

    /// Takes the named advisory lease for `holder` unless another holder owns an
    /// unexpired one.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn release_lease(&self, name: &str, holder: Uuid) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    docs: BTreeMap<String, ListingRecord>,
    leases: HashMap<String, (Uuid, DateTime<Utc>)>,
    failing_keys: HashSet<String>,
    writes: usize,
}

/// In-process store with write-failure injection. Backs the pipeline tests;
/// the CLI always runs against [`crate::PgListingStore`].
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, records: impl IntoIterator<Item = ListingRecord>) {
        let mut state = self.state.lock().await;
        for record in records {
            state.docs.insert(record.listing.identity_key.clone(), record);
        }
    }

    /// Makes every write to `identity_key` fail until cleared.
    pub async fn fail_writes_for(&self, identity_key: &str) {
        self.state
            .lock()
            .await
            .failing_keys
            .insert(identity_key.to_string());
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failing_keys.clear();
    }

    pub async fn records(&self) -> Vec<ListingRecord> {
        self.state.lock().await.docs.values().cloned().collect()
    }

    /// Number of successful writes since creation.
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }

    fn check_writable(state: &MemoryState, key: &str) -> Result<(), StoreError> {
        if state.failing_keys.contains(key) {
            return Err(StoreError::Rejected {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn get(&self, identity_key: &str) -> Result<Option<ListingRecord>, StoreError> {
        Ok(self.state.lock().await.docs.get(identity_key).cloned())
    }

    async fn upsert(&self, record: &ListingRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        Self::check_writable(&state, record.identity_key())?;
        state
            .docs
            .insert(record.identity_key().to_string(), record.clone());
        state.writes += 1;
        Ok(())
    }

    async fn patch(&self, identity_key: &str, payload: &WritePayload) -> Result<(), StoreError> {
        if let WritePayload::Document(record) = payload {
            return self.upsert(record).await;
        }
        let mut state = self.state.lock().await;
        Self::check_writable(&state, identity_key)?;
        let existing = state.docs.get(identity_key).cloned();
        let updated = payload
            .apply_to(existing)
            .ok_or_else(|| StoreError::MissingKey(identity_key.to_string()))?;
        state.docs.insert(identity_key.to_string(), updated);
        state.writes += 1;
        Ok(())
    }

    async fn list_active_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .docs
            .values()
            .filter(|r| r.status == ListingStatus::Active)
            .map(|r| r.listing.identity_key.clone())
            .collect())
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for record in state.docs.values() {
            match record.status {
                ListingStatus::Active => counts.active += 1,
                ListingStatus::Stale => counts.stale += 1,
            }
        }
        Ok(counts)
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        if let Some((current, expires_at)) = state.leases.get(name) {
            if *current != holder && *expires_at > now {
                return Ok(false);
            }
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        state.leases.insert(name.to_string(), (holder, expires_at));
        Ok(true)
    }

    async fn release_lease(&self, name: &str, holder: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if matches!(state.leases.get(name), Some((current, _)) if *current == holder) {
            state.leases.remove(name);
        }
        Ok(())
    }
}

/// Outcome for one write-set entry.
#[derive(Debug)]
pub struct WriteResult {
    pub identity_key: String,
    pub operation: WriteOperation,
    pub outcome: Result<(), StoreError>,
}

impl WriteResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Clone)]
pub struct StoreGateway {
    store: Arc<dyn ListingStore>,
}

impl StoreGateway {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    /// Reads every stored record that is either active or named in
    /// `incoming_keys`, keyed by identity.
    pub async fn load_snapshot(
        &self,
        incoming_keys: &[String],
    ) -> Result<HashMap<String, ListingRecord>, StoreError> {
        let mut keys: Vec<String> = self.store.list_active_keys().await?;
        keys.extend(incoming_keys.iter().cloned());
        keys.sort();
        keys.dedup();

        let records = self.store.get_many(&keys).await?;
        debug!(requested = keys.len(), found = records.len(), "loaded store snapshot");
        Ok(records
            .into_iter()
            .map(|r| (r.listing.identity_key.clone(), r))
            .collect())
    }

    /// Applies each entry as an independent upsert or patch. A failed entry never
    /// stops the remaining ones.
    pub async fn apply(&self, writes: &[WriteOp]) -> Vec<WriteResult> {
        let mut results = Vec::with_capacity(writes.len());
        for write in writes {
            let outcome = match &write.payload {
                WritePayload::Document(record) => self.store.upsert(record).await,
                payload => self.store.patch(&write.identity_key, payload).await,
            };
            if let Err(err) = &outcome {
                warn!(
                    identity_key = %write.identity_key,
                    operation = ?write.operation,
                    error = %err,
                    "store write failed"
                );
            }
            results.push(WriteResult {
                identity_key: write.identity_key.clone(),
                operation: write.operation,
                outcome,
            });
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hsync_core::{identity_key, Listing, Location};

    fn record(title: &str) -> ListingRecord {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).single().unwrap();
        let mut listing = Listing {
            identity_key: identity_key(title, &start),
            title: title.to_string(),
            description: None,
            start_date: start,
            end_date: None,
            location: Location::Remote,
            url: format!("https://example.test/{}", title.replace(' ', "-")),
            source_name: "feed".into(),
            organizer: None,
            source_ref: None,
            tags: Default::default(),
            source_status: None,
            application_deadline: None,
            engagement: None,
            content_hash: String::new(),
        };
        listing.refresh_content_hash();
        ListingRecord {
            listing,
            first_seen_at: start,
            last_seen_at: start,
            status: ListingStatus::Active,
            absence_count: 0,
            aliases: Default::default(),
        }
    }

    fn create(record: &ListingRecord) -> WriteOp {
        WriteOp {
            identity_key: record.listing.identity_key.clone(),
            operation: WriteOperation::Create,
            payload: WritePayload::Document(Box::new(record.clone())),
        }
    }

    #[tokio::test]
    async fn reapplying_a_write_set_is_idempotent() {
        let store = MemoryStore::new();
        let gateway = StoreGateway::new(Arc::new(store.clone()));
        let a = record("Alpha Hack");
        let writes = vec![
            create(&a),
            WriteOp {
                identity_key: a.listing.identity_key.clone(),
                operation: WriteOperation::RecordAbsence,
                payload: WritePayload::Absent { absence_count: 2 },
            },
        ];

        let first = gateway.apply(&writes).await;
        let after_first = store.records().await;
        let second = gateway.apply(&writes).await;
        let after_second = store.records().await;

        assert!(first.iter().chain(second.iter()).all(WriteResult::is_ok));
        assert_eq!(after_first, after_second);
        assert_eq!(after_second.len(), 1);
        assert_eq!(after_second[0].absence_count, 2);
    }

    #[tokio::test]
    async fn one_failed_write_does_not_abort_the_batch() {
        let store = MemoryStore::new();
        let gateway = StoreGateway::new(Arc::new(store.clone()));
        let a = record("Alpha Hack");
        let b = record("Beta Hack");
        store.fail_writes_for(a.identity_key()).await;

        let results = gateway.apply(&[create(&a), create(&b)]).await;
        assert!(results[0].outcome.is_err());
        assert!(results[1].is_ok());
        assert_eq!(store.records().await, vec![b.clone()]);

        store.clear_failures().await;
        let retry = gateway.apply(&[create(&a)]).await;
        assert!(retry[0].is_ok());
        assert_eq!(store.records().await.len(), 2);
    }

    #[tokio::test]
    async fn patching_a_missing_key_is_a_per_record_error() {
        let store = MemoryStore::new();
        let gateway = StoreGateway::new(Arc::new(store.clone()));
        let results = gateway
            .apply(&[WriteOp {
                identity_key: "missing".into(),
                operation: WriteOperation::Touch,
                payload: WritePayload::Seen {
                    last_seen_at: Utc::now(),
                    engagement: None,
                    aliases: Default::default(),
                },
            }])
            .await;
        assert!(matches!(results[0].outcome, Err(StoreError::MissingKey(_))));
    }

    #[tokio::test]
    async fn snapshot_includes_active_and_requested_keys() {
        let store = MemoryStore::new();
        let active = record("Alpha Hack");
        let mut stale = record("Beta Hack");
        stale.status = ListingStatus::Stale;
        let untouched_stale = {
            let mut r = record("Gamma Hack");
            r.status = ListingStatus::Stale;
            r
        };
        store
            .seed([active.clone(), stale.clone(), untouched_stale.clone()])
            .await;

        let gateway = StoreGateway::new(Arc::new(store));
        let snapshot = gateway
            .load_snapshot(&[stale.listing.identity_key.clone(), "unknown".into()])
            .await
            .unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains_key(active.identity_key()));
        assert!(snapshot.contains_key(stale.identity_key()));
        assert!(!snapshot.contains_key(untouched_stale.identity_key()));
    }

    #[tokio::test]
    async fn lease_excludes_other_holders_until_released() {
        let store = MemoryStore::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let ttl = Duration::from_secs(60);

        assert!(store.try_acquire_lease("sync", first, ttl).await.unwrap());
        assert!(!store.try_acquire_lease("sync", second, ttl).await.unwrap());
        assert!(store.try_acquire_lease("sync", first, ttl).await.unwrap());

        store.release_lease("sync", second).await.unwrap();
        assert!(!store.try_acquire_lease("sync", second, ttl).await.unwrap());

        store.release_lease("sync", first).await.unwrap();
        assert!(store.try_acquire_lease("sync", second, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let store = MemoryStore::new();
        assert!(store
            .try_acquire_lease("sync", Uuid::new_v4(), Duration::ZERO)
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store
            .try_acquire_lease("sync", Uuid::new_v4(), Duration::from_secs(60))
            .await
            .unwrap());
    }
}
