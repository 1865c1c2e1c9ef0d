//! MLH season event pages, read through their schema.org microdata.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hsync_core::{MlhEvent, RawPayload, RawRecord};
use hsync_storage::{FetchRequest, HttpFetcher};
use scraper::{ElementRef, Html, Selector};

use crate::{
    text_or_none, AdapterContext, AdapterError, ParsedPage, SourceAdapter, SourceBatch,
    SourceKind,
};

#[derive(Debug, Clone)]
pub struct MlhAdapter {
    source_name: String,
    urls: Vec<String>,
}

impl MlhAdapter {
    pub fn new(source_name: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            source_name: source_name.into(),
            urls,
        }
    }
}

#[async_trait]
impl SourceAdapter for MlhAdapter {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Mlh
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<SourceBatch, AdapterError> {
        let mut batch = SourceBatch::new(&self.source_name);
        for url in &self.urls {
            let request = FetchRequest::get(url).header("Accept", "text/html");
            let response = http.fetch(ctx.run_id, &self.source_name, &request).await?;
            let html = String::from_utf8_lossy(&response.body);
            batch.absorb(parse_events_page(&self.source_name, &html, ctx.fetched_at)?);
        }
        Ok(batch)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn first_text(element: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    element
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn first_attr(element: &ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    element
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(text_or_none)
}

/// Extracts one raw event per `.event` block. Blocks without a name are
/// counted as skipped.
pub fn parse_events_page(
    source_name: &str,
    html: &str,
    fetched_at: DateTime<Utc>,
) -> Result<ParsedPage, AdapterError> {
    let document = Html::parse_document(html);
    let event_sel = selector(".event")?;
    let name_sel = selector(".event-name")?;
    let link_sel = selector("a.event-link")?;
    let start_sel = selector("meta[itemprop='startDate']")?;
    let end_sel = selector("meta[itemprop='endDate']")?;
    let city_sel = selector("[itemprop='city'], [itemprop='addressLocality']")?;
    let state_sel = selector("[itemprop='state'], [itemprop='addressRegion']")?;
    let format_sel = selector(".event-hybrid-notes")?;

    let mut page = ParsedPage::default();
    for event in document.select(&event_sel) {
        let Some(name) = first_text(&event, &name_sel) else {
            page.skipped += 1;
            continue;
        };
        page.records.push(RawRecord::new(
            source_name,
            fetched_at,
            RawPayload::Mlh(MlhEvent {
                name: Some(name),
                url: first_attr(&event, &link_sel, "href"),
                start_date: first_attr(&event, &start_sel, "content"),
                end_date: first_attr(&event, &end_sel, "content"),
                city: first_text(&event, &city_sel),
                state: first_text(&event, &state_sel),
                format_note: first_text(&event, &format_sel),
            }),
        ));
    }
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <div class="row">
          <div class="event" itemscope itemtype="http://schema.org/Event">
            <a class="event-link" href="https://hackthenorth.example/" title="Hack the North">
              <h3 class="event-name" itemprop="name">Hack the North</h3>
              <p class="event-date">Sep 13th - 15th</p>
              <meta itemprop="startDate" content="2024-09-13">
              <meta itemprop="endDate" content="2024-09-15">
              <div class="event-location" itemprop="location">
                <span itemprop="city">Waterloo</span>, <span itemprop="state">ON</span>
              </div>
              <div class="event-hybrid-notes"><span>In-Person Only</span></div>
            </a>
          </div>
          <div class="event"><p>Broken card</p></div>
        </div>"#;

    #[test]
    fn parses_event_microdata() {
        let page = parse_events_page("mlh", PAGE, Utc::now()).unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.skipped, 1);
        let RawPayload::Mlh(event) = &page.records[0].payload else {
            panic!("expected mlh payload");
        };
        assert_eq!(event.name.as_deref(), Some("Hack the North"));
        assert_eq!(event.url.as_deref(), Some("https://hackthenorth.example/"));
        assert_eq!(event.start_date.as_deref(), Some("2024-09-13"));
        assert_eq!(event.city.as_deref(), Some("Waterloo"));
        assert_eq!(event.state.as_deref(), Some("ON"));
        assert_eq!(event.format_note.as_deref(), Some("In-Person Only"));
    }
}
