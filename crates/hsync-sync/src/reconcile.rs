//! Per-key state machine between this run's listings and the stored snapshot.
//! Pure: the write-set is a function of its inputs and `now`.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use hsync_core::{Listing, ListingRecord, ListingStatus, WriteOp, WriteOperation, WritePayload};
use serde::Serialize;

use crate::dedup::DedupOutcome;

#[derive(Debug, Clone, Copy)]
pub struct ReconcilePolicy {
    /// Consecutive absent runs after which an active listing turns stale.
    pub stale_after_absences: u32,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            stale_after_absences: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileCounts {
    pub new: usize,
    pub changed: usize,
    pub reactivated: usize,
    pub unchanged: usize,
    /// Active listings missing this run that stay active.
    pub absent: usize,
    pub stale: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Ordered by identity key.
    pub writes: Vec<WriteOp>,
    pub counts: ReconcileCounts,
}

/// Classifies every survivor of this run against the stored snapshot. A
/// stored key merged into a survivor counts as seen, never as absent.
pub fn reconcile(
    incoming: &DedupOutcome,
    stored: &HashMap<String, ListingRecord>,
    now: DateTime<Utc>,
    policy: ReconcilePolicy,
) -> Reconciliation {
    let mut out = Reconciliation::default();
    let present = incoming.seen_keys();

    for listing in &incoming.listings {
        let key = listing.identity_key.clone();
        let existing = stored.get(&key);
        let aliases = aliases_for(&key, incoming, existing);
        let write = match existing {
            None => {
                out.counts.new += 1;
                document(key, WriteOperation::Create, listing, now, now, aliases)
            }
            Some(existing) if existing.status == ListingStatus::Stale => {
                out.counts.reactivated += 1;
                document(
                    key,
                    WriteOperation::Reactivate,
                    listing,
                    existing.first_seen_at,
                    now,
                    aliases,
                )
            }
            Some(existing) if existing.listing.content_hash != listing.content_hash => {
                out.counts.changed += 1;
                let first_seen = existing.first_seen_at;
                document(key, WriteOperation::Update, listing, first_seen, now, aliases)
            }
            Some(_) => {
                out.counts.unchanged += 1;
                WriteOp {
                    identity_key: key,
                    operation: WriteOperation::Touch,
                    payload: WritePayload::Seen {
                        last_seen_at: now,
                        engagement: listing.engagement,
                        aliases,
                    },
                }
            }
        };
        out.writes.push(write);
    }

    for (key, record) in stored {
        if record.status != ListingStatus::Active || present.contains(key.as_str()) {
            continue;
        }
        let absence_count = record.absence_count.saturating_add(1);
        let (operation, payload) = if absence_count >= policy.stale_after_absences {
            out.counts.stale += 1;
            (WriteOperation::MarkStale, WritePayload::Stale { absence_count })
        } else {
            out.counts.absent += 1;
            (WriteOperation::RecordAbsence, WritePayload::Absent { absence_count })
        };
        out.writes.push(WriteOp {
            identity_key: key.clone(),
            operation,
            payload,
        });
    }

    out.writes
        .sort_by(|a, b| a.identity_key.cmp(&b.identity_key));
    out
}

/// Keys already folded into the stored document plus the ones merged into
/// it this run. Never contains the document's own key.
fn aliases_for(
    key: &str,
    incoming: &DedupOutcome,
    existing: Option<&ListingRecord>,
) -> BTreeSet<String> {
    let mut aliases: BTreeSet<String> = existing
        .map(|record| record.aliases.clone())
        .unwrap_or_default();
    if let Some(merged) = incoming.merged_keys.get(key) {
        aliases.extend(merged.iter().cloned());
    }
    aliases.remove(key);
    aliases
}

fn document(
    identity_key: String,
    operation: WriteOperation,
    listing: &Listing,
    first_seen_at: DateTime<Utc>,
    now: DateTime<Utc>,
    aliases: BTreeSet<String>,
) -> WriteOp {
    let mut listing = listing.clone();
    listing.refresh_content_hash();
    WriteOp {
        identity_key,
        operation,
        payload: WritePayload::Document(Box::new(ListingRecord {
            listing,
            first_seen_at,
            last_seen_at: now,
            status: ListingStatus::Active,
            absence_count: 0,
            aliases,
        })),
    }
}
