//! Devpost hackathon directory JSON API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hsync_core::{DevpostItem, RawPayload, RawRecord};
use hsync_storage::{FetchRequest, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    opt_text, AdapterContext, AdapterError, AdapterSettings, ParsedPage, SourceAdapter,
    SourceBatch, SourceKind,
};

pub const DEFAULT_API_URL: &str = "https://devpost.com/api/hackathons";
pub const DEFAULT_MAX_PAGES: usize = 10;

#[derive(Debug, Clone)]
pub struct DevpostAdapter {
    source_name: String,
    api_url: String,
    statuses: Vec<String>,
    max_pages: usize,
}

impl DevpostAdapter {
    pub fn from_settings(settings: &AdapterSettings) -> Self {
        Self {
            source_name: settings.name.clone(),
            api_url: settings
                .urls
                .first()
                .cloned()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            statuses: if settings.statuses.is_empty() {
                vec!["upcoming".to_string(), "open".to_string()]
            } else {
                settings.statuses.clone()
            },
            max_pages: settings.max_pages.unwrap_or(DEFAULT_MAX_PAGES).max(1),
        }
    }

    fn page_request(&self, page: usize) -> FetchRequest {
        let mut req = FetchRequest::get(&self.api_url)
            .query("page", page)
            .header("Accept", "application/json");
        for status in &self.statuses {
            req = req.query("status[]", status);
        }
        req
    }
}

#[async_trait]
impl SourceAdapter for DevpostAdapter {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Devpost
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<SourceBatch, AdapterError> {
        let mut batch = SourceBatch::new(&self.source_name);
        for page in 1..=self.max_pages {
            let response = http
                .fetch(ctx.run_id, &self.source_name, &self.page_request(page))
                .await?;
            let parsed = parse_hackathons_page(&self.source_name, &response.body, ctx.fetched_at)?;
            if parsed.is_empty() {
                break;
            }
            batch.absorb(parsed);
        }
        Ok(batch)
    }
}

#[derive(Debug, Deserialize)]
struct ApiHackathon {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    submission_period_dates: Option<String>,
    #[serde(default)]
    displayed_location: Option<ApiLocation>,
    #[serde(default)]
    organization_name: Option<String>,
    #[serde(default)]
    open_state: Option<String>,
    #[serde(default)]
    themes: Vec<ApiTheme>,
}

#[derive(Debug, Deserialize)]
struct ApiLocation {
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiTheme {
    #[serde(default)]
    name: Option<String>,
}

pub fn parse_hackathons_page(
    source_name: &str,
    body: &[u8],
    fetched_at: DateTime<Utc>,
) -> Result<ParsedPage, AdapterError> {
    let value: JsonValue = serde_json::from_slice(body)?;
    let items = value
        .get("hackathons")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::Message("devpost response is missing hackathons".into()))?;

    let mut page = ParsedPage::default();
    for item in items {
        match serde_json::from_value::<ApiHackathon>(item.clone()) {
            Ok(h) => page.records.push(RawRecord::new(
                source_name,
                fetched_at,
                RawPayload::Devpost(DevpostItem {
                    id: h.id,
                    title: opt_text(h.title),
                    url: opt_text(h.url),
                    submission_period_dates: opt_text(h.submission_period_dates),
                    location: h.displayed_location.and_then(|l| opt_text(l.location)),
                    organization_name: opt_text(h.organization_name),
                    open_state: opt_text(h.open_state),
                    themes: h.themes.into_iter().filter_map(|t| opt_text(t.name)).collect(),
                }),
            )),
            Err(err) => {
                debug!(source = source_name, error = %err, "skipping malformed devpost item");
                page.skipped += 1;
            }
        }
    }
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hackathon_entries() {
        let body = br#"{"hackathons":[
            {"id": 1, "title": "AI Hack Day", "url": "https://ai-hack-day.devpost.com/",
             "submission_period_dates": "May 01 - 03, 2024",
             "displayed_location": {"icon": "globe", "location": "Online"},
             "organization_name": "Hack Club", "open_state": "open",
             "themes": [{"id": 1, "name": "Machine Learning/AI"}]},
            {"id": 2, "themes": "not-a-list"}
        ], "meta": {"total_count": 2, "per_page": 9}}"#;
        let page = parse_hackathons_page("devpost", body, Utc::now()).unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.skipped, 1);
        let RawPayload::Devpost(item) = &page.records[0].payload else {
            panic!("expected devpost payload");
        };
        assert_eq!(item.location.as_deref(), Some("Online"));
        assert_eq!(item.themes, vec!["Machine Learning/AI".to_string()]);
    }

    #[test]
    fn status_filters_become_repeated_query_params() {
        let adapter = DevpostAdapter::from_settings(&AdapterSettings {
            name: "devpost".into(),
            kind: SourceKind::Devpost,
            urls: vec![],
            statuses: vec![],
            page_size: None,
            max_pages: None,
            path: None,
        });
        let req = adapter.page_request(3);
        let statuses = req
            .query
            .iter()
            .filter(|(k, _)| k == "status[]")
            .count();
        assert_eq!(statuses, 2);
        assert_eq!(req.url, DEFAULT_API_URL);
    }
}
