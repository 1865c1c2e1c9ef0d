//! Run pipeline for hackathon listing sync: adapters → normalize → dedupe →
//! reconcile → store.

pub mod config;
pub mod dedup;
pub mod normalize;
pub mod pipeline;
pub mod reconcile;

pub use config::{ConfigError, SourceConfig, SourceRegistry, SyncConfig};
pub use dedup::{DedupConfig, DedupEngine, DedupOutcome};
pub use normalize::{normalize, NormalizationError};
pub use pipeline::{
    build_scheduler, ConfiguredSource, RunMode, RunResult, StoreFailure, SyncError, SyncPipeline,
    LEASE_NAME,
};
pub use reconcile::{reconcile, ReconcileCounts, ReconcilePolicy, Reconciliation};

