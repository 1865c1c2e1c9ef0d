//! Unstop public opportunity search API, paginated per listing status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hsync_core::{RawPayload, RawRecord, UnstopItem};
use hsync_storage::{FetchRequest, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::{
    opt_text, text_or_none, AdapterContext, AdapterError, AdapterSettings, ParsedPage, SourceAdapter,
    SourceBatch, SourceKind,
};

pub const DEFAULT_SEARCH_URL: &str = "https://unstop.com/api/public/opportunity/search-result";
pub const DEFAULT_PAGE_SIZE: usize = 30;
pub const DEFAULT_MAX_PAGES: usize = 20;

#[derive(Debug, Clone)]
pub struct UnstopAdapter {
    source_name: String,
    search_url: String,
    statuses: Vec<String>,
    page_size: usize,
    max_pages: usize,
}

impl UnstopAdapter {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            search_url: DEFAULT_SEARCH_URL.to_string(),
            statuses: vec!["open".to_string(), "recent".to_string()],
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn from_settings(settings: &AdapterSettings) -> Self {
        let mut adapter = Self::new(&settings.name);
        if let Some(url) = settings.urls.first() {
            adapter.search_url = url.clone();
        }
        if !settings.statuses.is_empty() {
            adapter.statuses = settings.statuses.clone();
        }
        adapter.page_size = settings.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        adapter.max_pages = settings.max_pages.unwrap_or(DEFAULT_MAX_PAGES).max(1);
        adapter
    }

    fn page_request(&self, status: &str, page: usize) -> FetchRequest {
        FetchRequest::get(&self.search_url)
            .query("opportunity", "hackathons")
            .query("oppstatus", status)
            .query("page", page)
            .query("size", self.page_size)
            .header("Accept", "application/json, text/javascript, */*; q=0.01")
            .header("Accept-Language", "en-GB,en;q=0.8")
            .header("X-Requested-With", "XMLHttpRequest")
            .header(
                "Referer",
                format!(
                    "{}?opportunity=hackathons&oppstatus={status}",
                    self.search_url
                ),
            )
    }
}

#[async_trait]
impl SourceAdapter for UnstopAdapter {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Unstop
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<SourceBatch, AdapterError> {
        let mut batch = SourceBatch::new(&self.source_name);
        for status in &self.statuses {
            for page in 1..=self.max_pages {
                let response = http
                    .fetch(ctx.run_id, &self.source_name, &self.page_request(status, page))
                    .await?;
                let parsed =
                    parse_search_page(&self.source_name, status, &response.body, ctx.fetched_at)?;
                if parsed.is_empty() {
                    debug!(status = %status, page, "no more unstop results");
                    break;
                }
                batch.absorb(parsed);
            }
            info!(
                source = %self.source_name,
                status = %status,
                records = batch.records.len(),
                "unstop status scraped"
            );
        }
        Ok(batch)
    }
}

#[derive(Debug, Deserialize)]
struct ApiItem {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    organisation: Option<ApiOrganisation>,
    #[serde(default)]
    public_url: Option<String>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default, rename = "type")]
    opportunity_type: Option<String>,
    #[serde(default)]
    filters: Vec<ApiFilter>,
    #[serde(default)]
    address_with_country_logo: Option<ApiAddress>,
    #[serde(default, rename = "registerCount")]
    register_count: Option<JsonValue>,
    #[serde(default, rename = "viewsCount")]
    views_count: Option<JsonValue>,
    #[serde(default, rename = "regnRequirements")]
    regn_requirements: Option<JsonValue>,
}

/// Counters arrive as numbers or numeric strings.
fn json_count(value: Option<&JsonValue>) -> Option<u64> {
    match value? {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct ApiOrganisation {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiFilter {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiAddress {
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    country: Option<ApiCountry>,
}

#[derive(Debug, Deserialize)]
struct ApiCountry {
    #[serde(default)]
    name: Option<String>,
}

impl ApiItem {
    fn into_payload(self, listing_status: &str) -> UnstopItem {
        let remaining = self
            .regn_requirements
            .as_ref()
            .and_then(|r| r.get("remainingDaysArray"));
        let registration_remaining = json_count(remaining.and_then(|r| r.get("durations")))
            .and_then(|n| u32::try_from(n).ok());
        let registration_remaining_unit = remaining
            .and_then(|r| r.get("text"))
            .and_then(JsonValue::as_str)
            .and_then(text_or_none);
        let (city, state, country) = match self.address_with_country_logo {
            Some(addr) => (
                opt_text(addr.city),
                opt_text(addr.state),
                addr.country.and_then(|c| opt_text(c.name)),
            ),
            None => (None, None, None),
        };
        UnstopItem {
            id: self.id,
            title: opt_text(self.title),
            organisation: self.organisation.and_then(|o| opt_text(o.name)),
            public_url: opt_text(self.public_url),
            start_date: opt_text(self.start_date),
            end_date: opt_text(self.end_date),
            region: opt_text(self.region),
            city,
            state,
            country,
            opportunity_type: opt_text(self.opportunity_type),
            listing_status: Some(listing_status.to_string()),
            eligibility: self
                .filters
                .into_iter()
                .filter_map(|f| opt_text(f.name))
                .collect(),
            register_count: json_count(self.register_count.as_ref()),
            views_count: json_count(self.views_count.as_ref()),
            registration_remaining,
            registration_remaining_unit,
        }
    }
}

/// Parses one search-result page (`data.data[]`). Items that do not match the
/// expected shape are skipped.
pub fn parse_search_page(
    source_name: &str,
    listing_status: &str,
    body: &[u8],
    fetched_at: DateTime<Utc>,
) -> Result<ParsedPage, AdapterError> {
    let value: JsonValue = serde_json::from_slice(body)?;
    let items = value
        .get("data")
        .and_then(|d| d.get("data"))
        .and_then(JsonValue::as_array)
        .ok_or_else(|| {
            AdapterError::Message("unstop response is missing data.data".to_string())
        })?;

    let mut page = ParsedPage::default();
    for item in items {
        match serde_json::from_value::<ApiItem>(item.clone()) {
            Ok(api_item) => page.records.push(RawRecord::new(
                source_name,
                fetched_at,
                RawPayload::Unstop(api_item.into_payload(listing_status)),
            )),
            Err(err) => {
                debug!(source = source_name, error = %err, "skipping malformed unstop item");
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
    fn parses_items_and_skips_malformed_ones() {
        let body = br#"{"data":{"data":[
            {"id": 7, "title": "Code Sprint", "organisation": {"name": "IIT"},
             "public_url": "hackathons/code-sprint-7", "start_date": "2024-05-01T10:00:00+05:30",
             "region": "online", "type": "hackathons",
             "filters": [{"name": "Engineering Students"}, {"name": "N/A"}],
             "registerCount": "87", "viewsCount": 1500,
             "regnRequirements": {"remainingDaysArray": {"durations": 2, "text": "months left"}}},
            {"id": "not-a-number", "title": 42},
            {"title": "Bare"}
        ]}}"#;
        let page = parse_search_page("unstop", "open", body, Utc::now()).unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.skipped, 1);

        let RawPayload::Unstop(item) = &page.records[0].payload else {
            panic!("expected unstop payload");
        };
        assert_eq!(item.id, Some(7));
        assert_eq!(item.organisation.as_deref(), Some("IIT"));
        assert_eq!(item.listing_status.as_deref(), Some("open"));
        assert_eq!(item.eligibility, vec!["Engineering Students".to_string()]);
        assert_eq!(item.register_count, Some(87));
        assert_eq!(item.views_count, Some(1500));
        assert_eq!(item.registration_remaining, Some(2));
        assert_eq!(item.registration_remaining_unit.as_deref(), Some("months left"));

        let RawPayload::Unstop(bare) = &page.records[1].payload else {
            panic!("expected unstop payload");
        };
        assert_eq!(bare.register_count, None);
        assert_eq!(bare.registration_remaining, None);
    }

    #[test]
    fn empty_page_is_detected() {
        let page = parse_search_page("unstop", "open", br#"{"data":{"data":[]}}"#, Utc::now())
            .unwrap();
        assert!(page.is_empty());
    }

    #[test]
    fn unexpected_structure_is_an_error() {
        assert!(parse_search_page("unstop", "open", br#"{"error":"nope"}"#, Utc::now()).is_err());
        assert!(parse_search_page("unstop", "open", b"<html>", Utc::now()).is_err());
    }

    #[test]
    fn settings_override_defaults() {
        let adapter = UnstopAdapter::from_settings(&AdapterSettings {
            name: "unstop".into(),
            kind: SourceKind::Unstop,
            urls: vec![],
            statuses: vec!["open".into()],
            page_size: Some(10),
            max_pages: Some(2),
            path: None,
        });
        assert_eq!(adapter.statuses, vec!["open".to_string()]);
        assert_eq!(adapter.page_size, 10);
        assert_eq!(adapter.max_pages, 2);
        let req = adapter.page_request("open", 2);
        assert!(req.query.contains(&("page".to_string(), "2".to_string())));
        assert!(req.headers.iter().any(|(k, _)| k == "Referer"));
    }
}
