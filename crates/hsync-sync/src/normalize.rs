//! Raw record → canonical listing. One branch per payload tag; the identity
//! key and content hash are computed here and nowhere else.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, Utc};
use hsync_core::{
    identity_key, DevpostItem, Engagement, FeedItem, Listing, Location, MlhEvent, RawPayload,
    RawRecord, UnstopItem,
};
use regex::Regex;
use thiserror::Error;

const UNSTOP_BASE_URL: &str = "https://unstop.com/";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("{source_name}: record has no title")]
    MissingTitle { source_name: String },
    #[error("{source_name}: no resolvable start date for {title:?}")]
    MissingDate { source_name: String, title: String },
    #[error("{source_name}: no url for {title:?}")]
    MissingUrl { source_name: String, title: String },
}

static REMOTE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(online|virtual|remote|digital|worldwide)\b").expect("remote marker regex")
});
static HYBRID_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bhybrid\b").expect("hybrid marker regex"));
static PLACE_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^,\d]*\p{L}[^,]*,\s*\p{L}[^,]*").expect("place list regex"));
static STREET_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b\d+[a-z]?\s+[\p{L}\s.'-]+\b(street|st|avenue|ave|road|rd|boulevard|blvd|lane|ln|drive|dr|way|square|sq)\b")
        .expect("street address regex")
});

/// Classifies free-text locations. Anything ambiguous (hybrid, both markers,
/// neither) is `Unknown`.
pub fn classify_location(text: &str) -> Location {
    let trimmed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() || HYBRID_MARKER.is_match(&trimmed) {
        return Location::Unknown;
    }
    let remote = REMOTE_MARKER.is_match(&trimmed);
    let address = PLACE_LIST.is_match(&trimmed) || STREET_ADDRESS.is_match(&trimmed);
    match (remote, address) {
        (true, false) => Location::Remote,
        (false, true) => Location::Physical(trimmed),
        _ => Location::Unknown,
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%B %d, %Y", "%b %d, %Y", "%d %B %Y", "%d %b %Y"];
const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];
const OFFSET_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%z", "%Y-%m-%d %H:%M:%S %z"];

/// Parses the date shapes seen across sources into UTC. Values without an
/// offset are taken as UTC; date-only values become midnight.
pub fn parse_datetime(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_DATETIME_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(input, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(input, fmt) {
            return Some(dt.and_utc());
        }
    }
    parse_date(input).and_then(midnight_utc)
}

fn parse_date(input: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(input.trim(), fmt).ok())
}

fn midnight_utc(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc())
}

/// Parses display ranges such as `"Apr 01 - May 15, 2024"`, `"May 01 - 03, 2024"`
/// or `"Dec 28, 2024 - Jan 03, 2025"`.
pub fn parse_date_range(input: &str) -> Option<(DateTime<Utc>, Option<DateTime<Utc>>)> {
    let normalized = input.replace(['–', '—'], "-");
    let Some((left, right)) = normalized.split_once(" - ") else {
        return parse_datetime(&normalized).map(|start| (start, None));
    };
    let (left, right) = (left.trim(), right.trim());

    let end = parse_date(right).or_else(|| {
        let month = left.split_whitespace().next()?;
        parse_date(&format!("{month} {right}"))
    })?;
    let start = parse_date(left).or_else(|| {
        let guess = parse_date(&format!("{left}, {}", end.year()))?;
        if guess > end {
            guess.with_year(end.year() - 1)
        } else {
            Some(guess)
        }
    })?;
    Some((midnight_utc(start)?, midnight_utc(end)))
}

fn days_in_month(date: NaiveDate) -> Option<u32> {
    let first = date.with_day(1)?;
    let next = first.checked_add_months(chrono::Months::new(1))?;
    u32::try_from(next.signed_duration_since(first).num_days()).ok()
}

/// Turns a "N days/months left" registration window into an absolute date,
/// counted from the fetch day. Months are sized by the event's start month.
/// Anchoring to the fetch day keeps the deadline stable while the remaining
/// count ticks down between runs.
pub fn registration_deadline(
    fetched_at: DateTime<Utc>,
    start_date: Option<DateTime<Utc>>,
    remaining: u32,
    unit: &str,
) -> Option<DateTime<Utc>> {
    let unit = unit.to_lowercase();
    let days = if unit.contains("day") {
        remaining
    } else if unit.contains("month") {
        remaining.checked_mul(days_in_month(start_date?.date_naive())?)?
    } else {
        return None;
    };
    let day = fetched_at
        .date_naive()
        .checked_add_days(Days::new(u64::from(days)))?;
    midnight_utc(day)
}

#[derive(Debug, Default)]
struct Fields {
    title: Option<String>,
    description: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    location_text: Option<String>,
    url: Option<String>,
    organizer: Option<String>,
    source_ref: Option<String>,
    tags: Vec<String>,
    status: Option<String>,
    deadline: Option<DateTime<Utc>>,
    engagement: Option<Engagement>,
}

fn join_places(parts: &[&Option<String>]) -> Option<String> {
    let joined = parts
        .iter()
        .filter_map(|p| p.as_deref())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    (!joined.is_empty()).then_some(joined)
}

fn unstop_fields(item: &UnstopItem, fetched_at: DateTime<Utc>) -> Fields {
    let online = item
        .region
        .as_deref()
        .is_some_and(|r| r.eq_ignore_ascii_case("online"));
    let location_text = if online {
        Some("online".to_string())
    } else {
        join_places(&[&item.city, &item.state, &item.country]).or_else(|| item.region.clone())
    };
    let url = item.public_url.as_deref().map(|path| {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{UNSTOP_BASE_URL}{}", path.trim_start_matches('/'))
        }
    });
    let mut tags = item.eligibility.clone();
    tags.extend(item.opportunity_type.clone());
    let start = item.start_date.as_deref().and_then(parse_datetime);
    let deadline = match (item.registration_remaining, &item.registration_remaining_unit) {
        (Some(remaining), Some(unit)) => registration_deadline(fetched_at, start, remaining, unit),
        _ => None,
    };
    let engagement = (item.register_count.is_some() || item.views_count.is_some()).then_some(
        Engagement {
            registrations: item.register_count,
            views: item.views_count,
        },
    );

    Fields {
        title: item.title.clone(),
        description: None,
        start,
        end: item.end_date.as_deref().and_then(parse_datetime),
        location_text,
        url,
        organizer: item.organisation.clone(),
        source_ref: item.id.map(|id| id.to_string()),
        tags,
        status: item.listing_status.clone(),
        deadline,
        engagement,
    }
}

fn devpost_fields(item: &DevpostItem) -> Fields {
    let (start, end) = item
        .submission_period_dates
        .as_deref()
        .and_then(parse_date_range)
        .map_or((None, None), |(start, end)| (Some(start), end));
    Fields {
        title: item.title.clone(),
        description: None,
        start,
        end,
        location_text: item.location.clone(),
        url: item.url.clone(),
        organizer: item.organization_name.clone(),
        source_ref: item.id.map(|id| id.to_string()),
        tags: item.themes.clone(),
        status: item.open_state.clone(),
        ..Default::default()
    }
}

fn mlh_fields(event: &MlhEvent) -> Fields {
    let note = event.format_note.as_deref().unwrap_or_default().to_lowercase();
    let location_text = if note.contains("digital") || note.contains("online") {
        Some("online".to_string())
    } else if note.contains("hybrid") {
        Some("hybrid".to_string())
    } else {
        join_places(&[&event.city, &event.state])
    };
    Fields {
        title: event.name.clone(),
        description: None,
        start: event.start_date.as_deref().and_then(parse_datetime),
        end: event.end_date.as_deref().and_then(parse_datetime),
        location_text,
        url: event.url.clone(),
        ..Default::default()
    }
}

fn feed_fields(item: &FeedItem) -> Fields {
    Fields {
        title: item.title.clone(),
        description: item.description.clone(),
        start: item.start_date.as_deref().and_then(parse_datetime),
        end: item.end_date.as_deref().and_then(parse_datetime),
        location_text: item.location.clone(),
        url: item.url.clone(),
        organizer: item.organizer.clone(),
        source_ref: item.id.clone(),
        tags: item.tags.clone(),
        ..Default::default()
    }
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("n/a"))
}

fn clean_tags(tags: Vec<String>) -> BTreeSet<String> {
    tags.into_iter()
        .filter_map(|t| clean(Some(t)))
        .map(|t| t.to_lowercase())
        .collect()
}

pub fn normalize(record: &RawRecord) -> Result<Listing, NormalizationError> {
    let fields = match &record.payload {
        RawPayload::Unstop(item) => unstop_fields(item, record.fetched_at),
        RawPayload::Devpost(item) => devpost_fields(item),
        RawPayload::Mlh(event) => mlh_fields(event),
        RawPayload::Feed(item) => feed_fields(item),
    };
    let source_name = record.source_name.clone();

    let title = clean(fields.title).ok_or_else(|| NormalizationError::MissingTitle {
        source_name: source_name.clone(),
    })?;
    let start_date = fields.start.ok_or_else(|| NormalizationError::MissingDate {
        source_name: source_name.clone(),
        title: title.clone(),
    })?;
    let url = clean(fields.url).ok_or_else(|| NormalizationError::MissingUrl {
        source_name: source_name.clone(),
        title: title.clone(),
    })?;

    let mut listing = Listing {
        identity_key: identity_key(&title, &start_date),
        title,
        description: clean(fields.description),
        start_date,
        end_date: fields.end,
        location: clean(fields.location_text)
            .map(|text| classify_location(&text))
            .unwrap_or(Location::Unknown),
        url,
        source_name,
        organizer: clean(fields.organizer),
        source_ref: clean(fields.source_ref),
        tags: clean_tags(fields.tags),
        source_status: clean(fields.status).map(|s| s.to_lowercase()),
        application_deadline: fields.deadline,
        engagement: fields.engagement,
        content_hash: String::new(),
    };
    listing.refresh_content_hash();
    Ok(listing)
}
