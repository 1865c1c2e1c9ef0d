//! Source adapter contracts and the concrete hackathon listing sources.

use chrono::{DateTime, Utc};
use hsync_core::RawRecord;
use hsync_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod devpost;
pub mod feed;
pub mod mlh;
pub mod unstop;

pub use devpost::DevpostAdapter;
pub use feed::FeedAdapter;
pub use mlh::MlhAdapter;
pub use unstop::UnstopAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Unstop,
    Devpost,
    Mlh,
    Feed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

/// Records gathered from one source in one run. Items that could not be read
/// at all are counted in `skipped` instead of failing the source.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceBatch {
    pub source_name: String,
    pub records: Vec<RawRecord>,
    pub skipped: usize,
    pub pages: usize,
}

impl SourceBatch {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            ..Default::default()
        }
    }

    pub fn absorb(&mut self, page: ParsedPage) {
        self.records.extend(page.records);
        self.skipped += page.skipped;
        self.pages += 1;
    }
}

/// Result of parsing one fetched document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedPage {
    pub records: Vec<RawRecord>,
    pub skipped: usize,
}

impl ParsedPage {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.skipped == 0
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed document: {0}")]
    Document(#[from] serde_json::Error),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A source that could not be fetched as a whole. Recovered by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("source {source_name} failed: {cause}")]
pub struct SourceError {
    pub source_name: String,
    pub cause: String,
}

impl SourceError {
    pub fn new(source_name: impl Into<String>, cause: impl ToString) -> Self {
        Self {
            source_name: source_name.into(),
            cause: cause.to_string(),
        }
    }
}

#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &str;
    fn kind(&self) -> SourceKind;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<SourceBatch, AdapterError>;
}

/// Kind-specific knobs shared by every adapter constructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterSettings {
    pub name: String,
    pub kind: SourceKind,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub statuses: Vec<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default)]
    pub path: Option<String>,
}

pub fn build_adapter(settings: &AdapterSettings) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match settings.kind {
        SourceKind::Unstop => Ok(Box::new(UnstopAdapter::from_settings(settings))),
        SourceKind::Devpost => Ok(Box::new(DevpostAdapter::from_settings(settings))),
        SourceKind::Mlh => {
            if settings.urls.is_empty() {
                return Err(AdapterError::Message(format!(
                    "mlh source {} needs at least one url",
                    settings.name
                )));
            }
            Ok(Box::new(MlhAdapter::new(&settings.name, settings.urls.clone())))
        }
        SourceKind::Feed => Ok(Box::new(FeedAdapter::from_settings(settings)?)),
    }
}

/// Trims and drops blank or placeholder values.
pub(crate) fn text_or_none(value: impl AsRef<str>) -> Option<String> {
    let trimmed = value.as_ref().split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("n/a") {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn opt_text(value: Option<String>) -> Option<String> {
    value.and_then(text_or_none)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_values_are_dropped() {
        assert_eq!(text_or_none("  N/A "), None);
        assert_eq!(text_or_none("   "), None);
        assert_eq!(text_or_none(" Hack \n Day "), Some("Hack Day".to_string()));
    }

    #[test]
    fn mlh_without_urls_is_rejected() {
        let settings = AdapterSettings {
            name: "mlh".into(),
            kind: SourceKind::Mlh,
            urls: vec![],
            statuses: vec![],
            page_size: None,
            max_pages: None,
            path: None,
        };
        assert!(build_adapter(&settings).is_err());
    }

    #[test]
    fn builds_each_kind_with_its_name() {
        for (kind, urls, path) in [
            (SourceKind::Unstop, vec![], None),
            (SourceKind::Devpost, vec![], None),
            (SourceKind::Mlh, vec!["https://mlh.example/events".to_string()], None),
            (SourceKind::Feed, vec![], Some("listings.json".to_string())),
        ] {
            let settings = AdapterSettings {
                name: format!("{kind:?}").to_lowercase(),
                kind,
                urls,
                statuses: vec![],
                page_size: None,
                max_pages: None,
                path,
            };
            let adapter = build_adapter(&settings).unwrap();
            assert_eq!(adapter.kind(), kind);
            assert_eq!(adapter.source_name(), settings.name);
        }
    }
}
