//! Generic JSON listing feed, read from a local file or a URL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hsync_core::{FeedItem, RawPayload, RawRecord};
use hsync_storage::{FetchRequest, HttpFetcher};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    AdapterContext, AdapterError, AdapterSettings, ParsedPage, SourceAdapter, SourceBatch,
    SourceKind,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedLocation {
    File(String),
    Url(String),
}

#[derive(Debug, Clone)]
pub struct FeedAdapter {
    source_name: String,
    location: FeedLocation,
}

impl FeedAdapter {
    pub fn new(source_name: impl Into<String>, location: FeedLocation) -> Self {
        Self {
            source_name: source_name.into(),
            location,
        }
    }

    pub fn from_settings(settings: &AdapterSettings) -> Result<Self, AdapterError> {
        let location = match (&settings.path, settings.urls.first()) {
            (Some(path), _) => FeedLocation::File(path.clone()),
            (None, Some(url)) => FeedLocation::Url(url.clone()),
            (None, None) => {
                return Err(AdapterError::Message(format!(
                    "feed source {} needs a path or a url",
                    settings.name
                )))
            }
        };
        Ok(Self::new(&settings.name, location))
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Feed
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<SourceBatch, AdapterError> {
        let body = match &self.location {
            FeedLocation::File(path) => {
                tokio::fs::read(path)
                    .await
                    .map_err(|source| AdapterError::Io {
                        path: path.clone(),
                        source,
                    })?
            }
            FeedLocation::Url(url) => {
                let request = FetchRequest::get(url).header("Accept", "application/json");
                http.fetch(ctx.run_id, &self.source_name, &request).await?.body
            }
        };
        let mut batch = SourceBatch::new(&self.source_name);
        batch.absorb(parse_feed(&self.source_name, &body, ctx.fetched_at)?);
        Ok(batch)
    }
}

/// Parses a JSON array of listing objects. Entries that are not objects of
/// the expected shape are skipped.
pub fn parse_feed(
    source_name: &str,
    body: &[u8],
    fetched_at: DateTime<Utc>,
) -> Result<ParsedPage, AdapterError> {
    let value: JsonValue = serde_json::from_slice(body)?;
    let items = value
        .as_array()
        .ok_or_else(|| AdapterError::Message("feed must be a JSON array".to_string()))?;

    let mut page = ParsedPage::default();
    for item in items {
        if !item.is_object() {
            page.skipped += 1;
            continue;
        }
        match serde_json::from_value::<FeedItem>(item.clone()) {
            Ok(feed_item) => page.records.push(RawRecord::new(
                source_name,
                fetched_at,
                RawPayload::Feed(feed_item),
            )),
            Err(err) => {
                debug!(source = source_name, error = %err, "skipping malformed feed item");
                page.skipped += 1;
            }
        }
    }
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsync_storage::HttpClientConfig;
    use std::io::Write;
    use uuid::Uuid;

    #[test]
    fn skips_non_objects_and_bad_shapes() {
        let body = br#"[
            {"title": "AI Hack Day", "start_date": "2024-05-01", "url": "https://a.example"},
            "just a string",
            {"title": ["wrong"]}
        ]"#;
        let page = parse_feed("feed", body, Utc::now()).unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.skipped, 2);
    }

    #[test]
    fn non_array_feed_is_an_error() {
        assert!(parse_feed("feed", br#"{"items": []}"#, Utc::now()).is_err());
    }

    #[tokio::test]
    async fn reads_feed_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"title": "Local Jam", "start_date": "2024-06-01", "url": "https://jam.example"}}]"#
        )
        .unwrap();

        let adapter = FeedAdapter::new(
            "local",
            FeedLocation::File(file.path().display().to_string()),
        );
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let batch = adapter
            .fetch(&http, &AdapterContext::new(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(batch.source_name, "local");
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.pages, 1);
    }

    #[tokio::test]
    async fn missing_file_fails_the_source() {
        let adapter = FeedAdapter::new("local", FeedLocation::File("/nonexistent/feed.json".into()));
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = adapter
            .fetch(&http, &AdapterContext::new(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Io { .. }));
    }
}
