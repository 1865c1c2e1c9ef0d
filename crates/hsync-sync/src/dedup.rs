use std::collections::{BTreeMap, BTreeSet, HashMap};

use hsync_core::{normalize_title, Listing, ListingRecord, ListingStatus};
use tracing::debug;
use strsim::jaro_winkler;

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Minimum Jaro-Winkler score between normalized titles for two distinct
    /// identity keys to be treated as the same event.
    pub near_duplicate_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            near_duplicate_threshold: 0.95,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupOutcome {
    /// One listing per surviving identity key, ordered by key.
    pub listings: Vec<Listing>,
    /// Every identity key folded into a survivor (its own included), keyed by
    /// the survivor's identity key.
    pub merged_keys: BTreeMap<String, BTreeSet<String>>,
    pub collapsed: usize,
}

impl DedupOutcome {
    /// Wraps listings that need no merging, one key each.
    pub fn distinct(mut listings: Vec<Listing>) -> Self {
        listings.sort_by(|a, b| a.identity_key.cmp(&b.identity_key));
        let merged_keys = listings
            .iter()
            .map(|l| (l.identity_key.clone(), BTreeSet::from([l.identity_key.clone()])))
            .collect();
        Self {
            listings,
            merged_keys,
            collapsed: 0,
        }
    }

    /// Every identity key reported this run, merged or not.
    pub fn seen_keys(&self) -> BTreeSet<&str> {
        self.merged_keys
            .values()
            .flatten()
            .map(String::as_str)
            .chain(self.listings.iter().map(|l| l.identity_key.as_str()))
            .collect()
    }
}

pub struct DedupEngine {
    config: DedupConfig,
}

struct Group {
    key: String,
    day: String,
    title: String,
    digits: String,
    sources: BTreeSet<String>,
    members: Vec<Listing>,
}

impl Group {
    fn shape(key: String, listing: &Listing, sources: BTreeSet<String>) -> Self {
        let title = normalize_title(&listing.title);
        Group {
            day: listing.start_date.format("%Y-%m-%d").to_string(),
            digits: title.chars().filter(char::is_ascii_digit).collect(),
            sources,
            title,
            key,
            members: Vec::new(),
        }
    }
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Collapses listings sharing an identity key (or a near-identical title on
    /// the same day across different sources) into a single winner. The result
    /// does not depend on input order.
    pub fn dedupe(&self, mut listings: Vec<Listing>) -> DedupOutcome {
        let input_len = listings.len();
        listings.sort_by(|a, b| {
            (&a.identity_key, &a.source_name, &a.content_hash).cmp(&(
                &b.identity_key,
                &b.source_name,
                &b.content_hash,
            ))
        });

        let mut by_key: BTreeMap<String, Vec<Listing>> = BTreeMap::new();
        for listing in listings {
            by_key
                .entry(listing.identity_key.clone())
                .or_default()
                .push(listing);
        }

        let groups: Vec<Group> = by_key
            .into_iter()
            .map(|(key, members)| {
                let sources = members.iter().map(|m| m.source_name.clone()).collect();
                let mut group = Group::shape(key, &members[0], sources);
                group.members = members;
                group
            })
            .collect();

        let mut clusters = UnionFind::new(groups.len());
        for i in 0..groups.len() {
            for j in (i + 1)..groups.len() {
                if self.near_duplicates(&groups[i], &groups[j]) {
                    clusters.union(i, j);
                }
            }
        }

        let mut merged: BTreeMap<usize, (BTreeSet<String>, Vec<Listing>)> = BTreeMap::new();
        for (idx, group) in groups.into_iter().enumerate() {
            let entry = merged.entry(clusters.find(idx)).or_default();
            entry.0.insert(group.key);
            entry.1.extend(group.members);
        }

        let mut outcome = DedupOutcome::default();
        for (keys, members) in merged.into_values() {
            let (Some(key), Some(mut winner)) = (keys.first().cloned(), pick_winner(members)) else {
                continue;
            };
            winner.identity_key = key.clone();
            outcome.listings.push(winner);
            outcome.merged_keys.insert(key, keys);
        }
        outcome
            .listings
            .sort_by(|a, b| a.identity_key.cmp(&b.identity_key));
        outcome.collapsed = input_len - outcome.listings.len();
        outcome
    }

    /// Moves each survivor onto the identity key its event is already stored
    /// under, so a cluster keeps one document across runs even when the member
    /// holding the smallest key comes and goes.
    ///
    /// A stored member key wins first (active before stale, then the smallest
    /// key), either directly or through a stored record's aliases. Otherwise a
    /// stored record that passes the near-duplicate rule against the survivor
    /// is adopted. Each stored key is claimed at most once.
    pub fn anchor(
        &self,
        outcome: DedupOutcome,
        stored: &HashMap<String, ListingRecord>,
    ) -> DedupOutcome {
        let DedupOutcome {
            listings,
            mut merged_keys,
            collapsed,
        } = outcome;
        let reported: BTreeSet<String> = merged_keys.values().flatten().cloned().collect();
        let alias_index: HashMap<&str, &str> = stored
            .values()
            .flat_map(|record| {
                record
                    .aliases
                    .iter()
                    .map(move |alias| (alias.as_str(), record.identity_key()))
            })
            .collect();

        let mut claimed: BTreeSet<String> = BTreeSet::new();
        let mut anchors: Vec<Option<String>> = listings
            .iter()
            .map(|listing| {
                let members = merged_keys.get(&listing.identity_key)?;
                let resolved = members.iter().filter_map(|key| {
                    stored
                        .get(key)
                        .or_else(|| stored.get(*alias_index.get(key.as_str())?))
                });
                let key = best_stored(resolved.filter(|r| !claimed.contains(r.identity_key())))?;
                claimed.insert(key.clone());
                Some(key)
            })
            .collect();

        let mut loose: Vec<&ListingRecord> = stored
            .values()
            .filter(|r| {
                !reported.contains(r.identity_key())
                    && r.aliases.iter().all(|alias| !reported.contains(alias))
            })
            .collect();
        loose.sort_by(|a, b| {
            (a.status != ListingStatus::Active, a.identity_key())
                .cmp(&(b.status != ListingStatus::Active, b.identity_key()))
        });
        for (listing, anchor) in listings.iter().zip(anchors.iter_mut()) {
            if anchor.is_some() {
                continue;
            }
            let incoming = Group::shape(
                listing.identity_key.clone(),
                listing,
                BTreeSet::from([listing.source_name.clone()]),
            );
            let found = loose.iter().find(|record| {
                !claimed.contains(record.identity_key()) && {
                    let candidate = Group::shape(
                        record.identity_key().to_string(),
                        &record.listing,
                        BTreeSet::from([record.listing.source_name.clone()]),
                    );
                    self.near_duplicates(&incoming, &candidate)
                }
            });
            if let Some(record) = found {
                claimed.insert(record.identity_key().to_string());
                *anchor = Some(record.identity_key().to_string());
            }
        }

        let mut out = DedupOutcome {
            collapsed,
            ..DedupOutcome::default()
        };
        for (mut listing, anchor) in listings.into_iter().zip(anchors) {
            let mut keys = merged_keys.remove(&listing.identity_key).unwrap_or_default();
            if let Some(key) = anchor.filter(|key| *key != listing.identity_key) {
                debug!(from = %listing.identity_key, to = %key, "keeping stored identity");
                keys.insert(key.clone());
                listing.identity_key = key;
            }
            keys.insert(listing.identity_key.clone());
            out.merged_keys.insert(listing.identity_key.clone(), keys);
            out.listings.push(listing);
        }
        out.listings
            .sort_by(|a, b| a.identity_key.cmp(&b.identity_key));
        out
    }

    fn near_duplicates(&self, a: &Group, b: &Group) -> bool {
        a.day == b.day
            && a.digits == b.digits
            && a.sources.is_disjoint(&b.sources)
            && jaro_winkler(&a.title, &b.title) >= self.config.near_duplicate_threshold
    }
}

fn best_stored<'a>(records: impl Iterator<Item = &'a ListingRecord>) -> Option<String> {
    records
        .min_by(|a, b| {
            (a.status != ListingStatus::Active, a.identity_key())
                .cmp(&(b.status != ListingStatus::Active, b.identity_key()))
        })
        .map(|record| record.identity_key().to_string())
}

/// Rank of a source-reported lifecycle state; lower is more current.
pub fn status_priority(status: Option<&str>) -> u8 {
    match status {
        Some("open") => 1,
        Some("recent" | "upcoming") => 2,
        Some("closed") => 3,
        Some("expired" | "ended") => 4,
        _ => 5,
    }
}

/// Most complete record wins; ties go to the more current source status, then
/// the lexicographically smaller source name, then the smaller content hash.
fn pick_winner(members: Vec<Listing>) -> Option<Listing> {
    members.into_iter().min_by(|a, b| {
        b.completeness()
            .cmp(&a.completeness())
            .then_with(|| {
                status_priority(a.source_status.as_deref())
                    .cmp(&status_priority(b.source_status.as_deref()))
            })
            .then_with(|| a.source_name.cmp(&b.source_name))
            .then_with(|| a.content_hash.cmp(&b.content_hash))
    })
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut idx: usize) -> usize {
        while self.parent[idx] != idx {
            self.parent[idx] = self.parent[self.parent[idx]];
            idx = self.parent[idx];
        }
        idx
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use hsync_core::{identity_key, Location};

    fn mk(source: &str, title: &str, day: u32) -> Listing {
        let start = Utc.with_ymd_and_hms(2024, 5, day, 9, 0, 0).single().unwrap();
        let mut listing = Listing {
            identity_key: identity_key(title, &start),
            title: title.to_string(),
            description: None,
            start_date: start,
            end_date: None,
            location: Location::Unknown,
            url: format!("https://{source}.example/{day}"),
            source_name: source.to_string(),
            organizer: None,
            source_ref: None,
            tags: Default::default(),
            source_status: None,
            application_deadline: None,
            engagement: None,
            content_hash: String::new(),
        };
        listing.refresh_content_hash();
        listing
    }

    #[test]
    fn same_key_collapses_to_the_richer_record() {
        let mut devpost = mk("devpost", "AI Hack Day", 1);
        devpost.location = Location::Remote;
        devpost.end_date = Some(devpost.start_date);
        devpost.refresh_content_hash();
        let mlh = mk("mlh", "ai hack day!", 1);

        let outcome = DedupEngine::new(DedupConfig::default()).dedupe(vec![mlh, devpost]);
        assert_eq!(outcome.listings.len(), 1);
        assert_eq!(outcome.collapsed, 1);
        assert_eq!(outcome.listings[0].source_name, "devpost");
    }

    #[test]
    fn ties_go_to_the_smaller_source_name() {
        let outcome = DedupEngine::new(DedupConfig::default())
            .dedupe(vec![mk("unstop", "Build Week", 3), mk("feed", "Build Week", 3)]);
        assert_eq!(outcome.listings[0].source_name, "feed");
    }

    #[test]
    fn result_is_independent_of_input_order() {
        let items = vec![
            mk("mlh", "Hack the North", 13),
            mk("devpost", "Hack the North", 13),
            mk("unstop", "Smart City Build-a-thon", 10),
            mk("feed", "Green Jam", 2),
        ];
        let engine = DedupEngine::new(DedupConfig::default());
        let forward = engine.dedupe(items.clone());
        let mut reversed = items;
        reversed.reverse();
        assert_eq!(forward, engine.dedupe(reversed));
        assert_eq!(forward.listings.len(), 3);
    }

    #[test]
    fn near_identical_titles_across_sources_merge() {
        let a = mk("devpost", "HackMIT Spring Edition", 4);
        let b = mk("mlh", "HackMIT Spring Editon", 4);
        assert_ne!(a.identity_key, b.identity_key);
        let expected_key = a.identity_key.clone().min(b.identity_key.clone());

        let both = BTreeSet::from([a.identity_key.clone(), b.identity_key.clone()]);

        let outcome = DedupEngine::new(DedupConfig::default()).dedupe(vec![a, b]);
        assert_eq!(outcome.listings.len(), 1);
        assert_eq!(outcome.listings[0].identity_key, expected_key);
        assert_eq!(outcome.merged_keys.get(&expected_key), Some(&both));
    }

    #[test]
    fn numbered_editions_and_other_days_stay_apart() {
        let engine = DedupEngine::new(DedupConfig::default());
        let editions = engine.dedupe(vec![
            mk("devpost", "Hackathon Series 11", 4),
            mk("mlh", "Hackathon Series 12", 4),
        ]);
        assert_eq!(editions.listings.len(), 2);

        let days = engine.dedupe(vec![mk("devpost", "Green Jam", 4), mk("mlh", "Green Jam", 5)]);
        assert_eq!(days.listings.len(), 2);
        assert_eq!(days.collapsed, 0);
    }

    #[test]
    fn same_source_near_titles_are_distinct_events() {
        let outcome = DedupEngine::new(DedupConfig::default()).dedupe(vec![
            mk("devpost", "HackMIT Spring Edition", 4),
            mk("devpost", "HackMIT Spring Editon", 4),
        ]);
        assert_eq!(outcome.listings.len(), 2);
    }

    fn stored(listing: &Listing, status: ListingStatus) -> (String, ListingRecord) {
        let record = ListingRecord {
            listing: listing.clone(),
            first_seen_at: listing.start_date,
            last_seen_at: listing.start_date,
            status,
            absence_count: 0,
            aliases: Default::default(),
        };
        (listing.identity_key.clone(), record)
    }

    #[test]
    fn more_current_status_wins_between_equal_records() {
        let mut recent = mk("unstop", "Code Sprint", 6);
        recent.source_status = Some("recent".into());
        recent.refresh_content_hash();
        let mut open = recent.clone();
        open.source_status = Some("open".into());
        open.refresh_content_hash();

        let outcome = DedupEngine::new(DedupConfig::default()).dedupe(vec![recent, open]);
        assert_eq!(outcome.listings[0].source_status.as_deref(), Some("open"));
        assert_eq!(status_priority(Some("ended")), 4);
        assert_eq!(status_priority(None), 5);
    }

    #[test]
    fn cluster_keeps_the_key_it_was_stored_under() {
        let engine = DedupEngine::new(DedupConfig::default());
        let devpost = mk("devpost", "HackMIT Spring Edition", 4);
        let mlh = mk("mlh", "HackMIT Spring Editon", 4);
        let larger = devpost.identity_key.clone().max(mlh.identity_key.clone());
        let first_stored = if devpost.identity_key == larger { &devpost } else { &mlh };
        let snapshot = HashMap::from([stored(first_stored, ListingStatus::Active)]);

        let outcome = engine.anchor(engine.dedupe(vec![devpost.clone(), mlh.clone()]), &snapshot);
        assert_eq!(outcome.listings.len(), 1);
        assert_eq!(outcome.listings[0].identity_key, larger);
        assert!(outcome.seen_keys().contains(devpost.identity_key.as_str()));
        assert!(outcome.seen_keys().contains(mlh.identity_key.as_str()));
    }

    #[test]
    fn lone_near_duplicate_adopts_the_stored_record() {
        let engine = DedupEngine::new(DedupConfig::default());
        let devpost = mk("devpost", "HackMIT Spring Edition", 4);
        let mlh = mk("mlh", "HackMIT Spring Editon", 4);
        let snapshot = HashMap::from([stored(&devpost, ListingStatus::Active)]);

        let outcome = engine.anchor(engine.dedupe(vec![mlh]), &snapshot);
        assert_eq!(outcome.listings[0].identity_key, devpost.identity_key);
        assert_eq!(outcome.listings[0].source_name, "mlh");
    }

    #[test]
    fn stored_record_is_claimed_once_and_same_source_is_not_adopted() {
        let engine = DedupEngine::new(DedupConfig::default());
        let old = mk("devpost", "HackMIT Spring Edition", 4);
        let retitled = mk("devpost", "HackMIT Spring Editon", 4);
        let snapshot = HashMap::from([stored(&old, ListingStatus::Active)]);

        let outcome = engine.anchor(engine.dedupe(vec![retitled.clone()]), &snapshot);
        assert_eq!(outcome.listings[0].identity_key, retitled.identity_key);

        let a = mk("mlh", "HackMIT Spring Editon", 4);
        let b = mk("feed", "HackMIT Spring Editin", 4);
        let outcome = engine.anchor(
            DedupOutcome::distinct(vec![a.clone(), b.clone()]),
            &snapshot,
        );
        let anchored: Vec<_> = outcome
            .listings
            .iter()
            .filter(|l| l.identity_key == old.identity_key)
            .collect();
        assert_eq!(anchored.len(), 1);
        assert_eq!(outcome.listings.len(), 2);
    }

    #[test]
    fn folded_key_finds_its_document_through_aliases() {
        let engine = DedupEngine::new(DedupConfig::default());
        let kept = mk("devpost", "HackMIT Spring Edition", 4);
        let folded = mk("devpost", "HackMIT Spring Editon", 4);
        let (key, mut record) = stored(&kept, ListingStatus::Active);
        record.aliases.insert(folded.identity_key.clone());
        let snapshot = HashMap::from([(key, record)]);

        let outcome = engine.anchor(engine.dedupe(vec![folded.clone()]), &snapshot);
        assert_eq!(outcome.listings.len(), 1);
        assert_eq!(outcome.listings[0].identity_key, kept.identity_key);
        assert!(outcome.merged_keys[&kept.identity_key].contains(&folded.identity_key));
    }
}
