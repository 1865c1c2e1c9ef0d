//! Core domain model for hackathon listing sync: raw source records, canonical
//! listings, persisted records and the write-set handed to the store.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Raw record as produced by a source adapter, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_name: String,
    pub fetched_at: DateTime<Utc>,
    pub payload: RawPayload,
}

impl RawRecord {
    pub fn new(source_name: impl Into<String>, fetched_at: DateTime<Utc>, payload: RawPayload) -> Self {
        Self {
            source_name: source_name.into(),
            fetched_at,
            payload,
        }
    }
}

/// Source-specific payload shapes. The normalizer has one branch per tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawPayload {
    Unstop(UnstopItem),
    Devpost(DevpostItem),
    Mlh(MlhEvent),
    Feed(FeedItem),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UnstopItem {
    pub id: Option<u64>,
    pub title: Option<String>,
    pub organisation: Option<String>,
    pub public_url: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub opportunity_type: Option<String>,
    /// Status bucket the item was listed under (`open`, `recent`, ...).
    pub listing_status: Option<String>,
    #[serde(default)]
    pub eligibility: Vec<String>,
    pub register_count: Option<u64>,
    pub views_count: Option<u64>,
    /// Registration time left as reported at fetch time, e.g. `12` + `"days left"`.
    pub registration_remaining: Option<u32>,
    pub registration_remaining_unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DevpostItem {
    pub id: Option<u64>,
    pub title: Option<String>,
    pub url: Option<String>,
    pub submission_period_dates: Option<String>,
    pub location: Option<String>,
    pub organization_name: Option<String>,
    pub open_state: Option<String>,
    #[serde(default)]
    pub themes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MlhEvent {
    pub name: Option<String>,
    pub url: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub format_note: Option<String>,
}

/// Generic listing shape used by file feeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FeedItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub organizer: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "place", rename_all = "snake_case")]
pub enum Location {
    Physical(String),
    Remote,
    Unknown,
}

impl Location {
    pub fn is_known(&self) -> bool {
        !matches!(self, Location::Unknown)
    }
}

/// Volatile popularity counters. Stored with the listing but never part of
/// its content hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Engagement {
    pub registrations: Option<u64>,
    pub views: Option<u64>,
}

/// Canonical hackathon listing produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub identity_key: String,
    pub title: String,
    pub description: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub location: Location,
    pub url: String,
    pub source_name: String,
    pub organizer: Option<String>,
    /// Source-native identifier, kept for traceability only.
    pub source_ref: Option<String>,
    pub tags: BTreeSet<String>,
    /// Lifecycle state as the source reports it (`open`, `upcoming`, `ended`, ...).
    pub source_status: Option<String>,
    pub application_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub engagement: Option<Engagement>,
    pub content_hash: String,
}

#[derive(Serialize)]
struct ContentFields<'a> {
    title: &'a str,
    description: Option<&'a str>,
    start_date: &'a DateTime<Utc>,
    end_date: Option<&'a DateTime<Utc>>,
    location: &'a Location,
    url: &'a str,
    source_name: &'a str,
    organizer: Option<&'a str>,
    source_ref: Option<&'a str>,
    tags: &'a BTreeSet<String>,
    source_status: Option<&'a str>,
    application_deadline: Option<&'a DateTime<Utc>>,
}

impl Listing {
    /// Fingerprint over the mutable content fields. Bookkeeping fields,
    /// engagement counters and the identity key are excluded.
    pub fn compute_content_hash(&self) -> String {
        let fields = ContentFields {
            title: &self.title,
            description: self.description.as_deref(),
            start_date: &self.start_date,
            end_date: self.end_date.as_ref(),
            location: &self.location,
            url: &self.url,
            source_name: &self.source_name,
            organizer: self.organizer.as_deref(),
            source_ref: self.source_ref.as_deref(),
            tags: &self.tags,
            source_status: self.source_status.as_deref(),
            application_deadline: self.application_deadline.as_ref(),
        };
        // Serializing a plain struct of strings and ordered sets cannot fail.
        let bytes = serde_json::to_vec(&fields).unwrap_or_default();
        sha256_hex(&bytes)
    }

    pub fn refresh_content_hash(&mut self) {
        self.content_hash = self.compute_content_hash();
    }

    /// Number of populated optional fields; used as the dedup tie-break.
    pub fn completeness(&self) -> usize {
        [
            self.description.is_some(),
            self.end_date.is_some(),
            self.location.is_known(),
            self.organizer.is_some(),
            self.source_ref.is_some(),
            !self.tags.is_empty(),
            self.source_status.is_some(),
            self.application_deadline.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Active,
    Stale,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Active => "active",
            ListingStatus::Stale => "stale",
        }
    }
}

/// Persisted listing document. Timestamps and the absence counter are owned
/// by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    #[serde(flatten)]
    pub listing: Listing,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: ListingStatus,
    #[serde(default)]
    pub absence_count: u32,
    /// Other identity keys folded into this document by near-duplicate
    /// merging. A later run reporting one of them lands here.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub aliases: BTreeSet<String>,
}

impl ListingRecord {
    pub fn identity_key(&self) -> &str {
        &self.listing.identity_key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOperation {
    Create,
    Update,
    Reactivate,
    Touch,
    RecordAbsence,
    MarkStale,
}

/// Absolute values to write for one key. Nothing here is relative to the
/// stored state, so applying the same payload twice yields the same document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WritePayload {
    Document(Box<ListingRecord>),
    Seen {
        last_seen_at: DateTime<Utc>,
        engagement: Option<Engagement>,
        aliases: BTreeSet<String>,
    },
    Absent { absence_count: u32 },
    Stale { absence_count: u32 },
}

impl WritePayload {
    /// Applies the payload onto the stored document, if any. Returns `None` when
    /// a patch targets a key that does not exist.
    pub fn apply_to(&self, existing: Option<ListingRecord>) -> Option<ListingRecord> {
        match self {
            WritePayload::Document(record) => Some((**record).clone()),
            WritePayload::Seen {
                last_seen_at,
                engagement,
                aliases,
            } => existing.map(|mut record| {
                record.last_seen_at = *last_seen_at;
                record.absence_count = 0;
                record.listing.engagement = *engagement;
                record.aliases = aliases.clone();
                record
            }),
            WritePayload::Absent { absence_count } => existing.map(|mut record| {
                record.absence_count = *absence_count;
                record
            }),
            WritePayload::Stale { absence_count } => existing.map(|mut record| {
                record.absence_count = *absence_count;
                record.status = ListingStatus::Stale;
                record
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOp {
    pub identity_key: String,
    pub operation: WriteOperation,
    pub payload: WritePayload,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Lowercases, strips punctuation and collapses whitespace.
pub fn normalize_title(input: &str) -> String {
    input
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c.to_lowercase().collect::<String>())
            } else if c.is_whitespace() {
                Some(" ".to_string())
            } else {
                None
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic identity over the normalized title and the UTC calendar day
/// of the start date.
pub fn identity_key(title: &str, start_date: &DateTime<Utc>) -> String {
    let basis = format!("{}|{}", normalize_title(title), start_date.format("%Y-%m-%d"));
    sha256_hex(basis.as_bytes())
}
