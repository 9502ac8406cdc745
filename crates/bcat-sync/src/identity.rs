//! Identity resolution and the identity-preserving merge of fetched items.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bcat_core::{
    last_seen_tag, ColumnSet, FetchedItem, OutputRecord, ResolvedIdentity, SamplingMode, SortOrder,
};
use bcat_storage::{BookStore, TieBreak};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of one batched identity lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(HashMap<String, ResolvedIdentity>),
    /// The lookup failed; every key in the batch is treated as new.
    Degraded { reason: String },
}

impl Resolution {
    pub fn get(&self, natural_key: &str) -> Option<&ResolvedIdentity> {
        match self {
            Resolution::Resolved(map) => map.get(natural_key),
            Resolution::Degraded { .. } => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Resolution::Degraded { .. })
    }
}

pub struct IdentityResolver {
    store: Arc<dyn BookStore>,
    tie_break: TieBreak,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn BookStore>, columns: &ColumnSet) -> Self {
        Self {
            store,
            tie_break: TieBreak::for_columns(columns),
        }
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// One lookup for the whole batch. Blank and repeated keys are collapsed;
    /// an empty batch issues no query.
    pub async fn resolve(&self, natural_keys: &[String]) -> Resolution {
        let mut seen = HashSet::new();
        let keys: Vec<String> = natural_keys
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty() && seen.insert(k.to_string()))
            .map(str::to_string)
            .collect();

        if keys.is_empty() {
            return Resolution::Resolved(HashMap::new());
        }

        match self.store.resolve_identities(&keys, self.tie_break).await {
            Ok(map) => {
                debug!(keys = keys.len(), resolved = map.len(), "resolved identities");
                Resolution::Resolved(map)
            }
            Err(err) => {
                warn!(error = %err, keys = keys.len(), "identity lookup failed; treating batch as new");
                Resolution::Degraded {
                    reason: err.to_string(),
                }
            }
        }
    }
}

/// When and how one page of items was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub observed_at: DateTime<Utc>,
    pub provenance: String,
}

impl Observation {
    pub fn new(observed_at: DateTime<Utc>, mode: SamplingMode, term: &str, sort: SortOrder) -> Self {
        Self {
            observed_at,
            provenance: last_seen_tag(mode, term, sort),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedPage {
    pub records: Vec<OutputRecord>,
    pub new_identities: usize,
    pub carried_identities: usize,
    pub dropped_items: usize,
}

pub struct UpsertMergeEngine {
    ingest_provenance: String,
}

impl UpsertMergeEngine {
    /// `ingest_provenance` is stamped as first-seen provenance on new records.
    pub fn new(ingest_provenance: impl Into<String>) -> Self {
        Self {
            ingest_provenance: ingest_provenance.into(),
        }
    }

    /// Merge one fetched item. Items without a natural key cannot be
    /// identified and yield `None`.
    pub fn merge(
        &self,
        item: &FetchedItem,
        resolved: Option<&ResolvedIdentity>,
        observation: &Observation,
    ) -> Option<OutputRecord> {
        let natural_key = item.natural_key()?.to_string();
        let now = observation.observed_at;

        let (identity_id, first_seen_at, first_seen_provenance) = match resolved {
            Some(existing) => (
                existing.identity_id,
                existing.first_seen_at,
                existing.first_seen_provenance.clone(),
            ),
            None => (Uuid::now_v7(), now, self.ingest_provenance.clone()),
        };

        let base_version = now.timestamp();
        let version = resolved
            .and_then(|existing| existing.last_version)
            .map(|previous| base_version.max(previous.saturating_add(1)))
            .unwrap_or(base_version);

        Some(OutputRecord {
            natural_key,
            identity_id,
            version,
            first_seen_at,
            first_seen_provenance,
            last_seen_at: now,
            last_seen_provenance: observation.provenance.clone(),
            title: text(&item.title),
            link: text(&item.link),
            image: text(&item.image),
            author: text(&item.author),
            discount: parse_discount(item.discount.as_deref()),
            publisher: text(&item.publisher),
            description: text(&item.description),
            publication_date: text(&item.publication_date),
        })
    }

    /// Merge a page. A key repeated within the page keeps the identity given
    /// to its first occurrence, with the version stepped forward.
    pub fn merge_page(
        &self,
        items: &[FetchedItem],
        resolution: &Resolution,
        observation: &Observation,
    ) -> MergedPage {
        let mut page = MergedPage::default();
        let mut assigned: HashMap<String, ResolvedIdentity> = HashMap::new();

        for item in items {
            let Some(key) = item.natural_key() else {
                page.dropped_items += 1;
                continue;
            };
            let known = assigned.get(key).or_else(|| resolution.get(key));
            let was_known = known.is_some();
            let Some(record) = self.merge(item, known, observation) else {
                page.dropped_items += 1;
                continue;
            };

            if was_known {
                page.carried_identities += 1;
            } else {
                page.new_identities += 1;
            }
            assigned.insert(
                record.natural_key.clone(),
                ResolvedIdentity {
                    identity_id: record.identity_id,
                    first_seen_at: record.first_seen_at,
                    first_seen_provenance: record.first_seen_provenance.clone(),
                    last_version: Some(record.version),
                },
            );
            page.records.push(record);
        }
        page
    }
}

fn text(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

/// Blank or missing → `None`; integral text → value; anything else → `None`.
pub fn parse_discount(raw: Option<&str>) -> Option<i64> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(value) = raw.parse::<i64>() {
        return Some(value);
    }
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Some(value.trunc() as i64),
        _ => {
            debug!(raw, "ignoring unparseable discount");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bcat_core::{columns, SCHEDULED_PROVENANCE};
    use bcat_storage::MemoryBookStore;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("timestamp")
    }

    fn item(key: Option<&str>, title: &str) -> FetchedItem {
        FetchedItem {
            title: Some(title.to_string()),
            natural_key: key.map(str::to_string),
            discount: Some("15000".to_string()),
            ..Default::default()
        }
    }

    fn observation(secs: i64) -> Observation {
        Observation::new(at(secs), SamplingMode::Title, "통계", SortOrder::Relevance)
    }

    #[test]
    fn resolved_identity_is_carried_verbatim() {
        let engine = UpsertMergeEngine::new(SCHEDULED_PROVENANCE);
        let existing = ResolvedIdentity {
            identity_id: Uuid::now_v7(),
            first_seen_at: at(1_700_000_000),
            first_seen_provenance: "github_actions_auto".to_string(),
            last_version: Some(1_700_000_000),
        };

        let record = engine
            .merge(&item(Some("9780000000001"), "New Title"), Some(&existing), &observation(1_800_000_000))
            .expect("record");

        assert_eq!(record.identity_id, existing.identity_id);
        assert_eq!(record.first_seen_at, existing.first_seen_at);
        assert_eq!(record.first_seen_provenance, "github_actions_auto");
        assert_eq!(record.version, 1_800_000_000);
        assert_eq!(record.last_seen_at, at(1_800_000_000));
        assert_eq!(record.title, "New Title");
        assert_eq!(
            record.last_seen_provenance,
            "auto_upsert|mode=title|keyword=통계|sort=sim"
        );
    }

    #[test]
    fn stored_version_at_the_integer_limit_does_not_overflow() {
        let engine = UpsertMergeEngine::new(SCHEDULED_PROVENANCE);
        let existing = ResolvedIdentity {
            identity_id: Uuid::now_v7(),
            first_seen_at: at(1_700_000_000),
            first_seen_provenance: SCHEDULED_PROVENANCE.to_string(),
            last_version: Some(i64::MAX),
        };

        let record = engine
            .merge(&item(Some("9780000000009"), "Corrupt"), Some(&existing), &observation(1_800_000_000))
            .expect("record");
        assert_eq!(record.version, i64::MAX);
        assert_eq!(record.identity_id, existing.identity_id);
    }

    #[test]
    fn new_identity_uses_observation_time() {
        let engine = UpsertMergeEngine::new(SCHEDULED_PROVENANCE);
        let record = engine
            .merge(&item(Some("9780000000002"), "Fresh"), None, &observation(1_800_000_000))
            .expect("record");

        assert_eq!(record.first_seen_at, at(1_800_000_000));
        assert_eq!(record.first_seen_provenance, SCHEDULED_PROVENANCE);
        assert_eq!(record.version, 1_800_000_000);
        assert_eq!(record.identity_id.get_version_num(), 7);
        assert_eq!(record.discount, Some(15000));
        assert_eq!(record.link, "");
    }

    #[test]
    fn version_strictly_increases_within_the_same_second() {
        let engine = UpsertMergeEngine::new(SCHEDULED_PROVENANCE);
        let existing = ResolvedIdentity {
            identity_id: Uuid::now_v7(),
            first_seen_at: at(100),
            first_seen_provenance: String::new(),
            last_version: Some(500),
        };
        let record = engine
            .merge(&item(Some("k"), "t"), Some(&existing), &observation(500))
            .expect("record");
        assert_eq!(record.version, 501);
    }

    #[test]
    fn items_without_natural_key_are_dropped() {
        let engine = UpsertMergeEngine::new(SCHEDULED_PROVENANCE);
        assert!(engine.merge(&item(None, "x"), None, &observation(1)).is_none());
        assert!(engine.merge(&item(Some("  "), "x"), None, &observation(1)).is_none());
    }

    #[test]
    fn repeated_key_in_one_page_shares_one_identity() {
        let engine = UpsertMergeEngine::new(SCHEDULED_PROVENANCE);
        let items = vec![
            item(Some("k1"), "first"),
            item(None, "orphan"),
            item(Some("k1"), "second"),
            item(Some("k2"), "other"),
        ];
        let page = engine.merge_page(&items, &Resolution::Resolved(HashMap::new()), &observation(42));

        assert_eq!(page.records.len(), 3);
        assert_eq!(page.dropped_items, 1);
        assert_eq!(page.new_identities, 2);
        assert_eq!(page.carried_identities, 1);
        assert_eq!(page.records[0].identity_id, page.records[1].identity_id);
        assert!(page.records[1].version > page.records[0].version);
        assert_ne!(page.records[0].identity_id, page.records[2].identity_id);
    }

    #[test]
    fn discount_parsing_is_lenient() {
        assert_eq!(parse_discount(None), None);
        assert_eq!(parse_discount(Some("")), None);
        assert_eq!(parse_discount(Some(" 12600 ")), Some(12600));
        assert_eq!(parse_discount(Some("9900.0")), Some(9900));
        assert_eq!(parse_discount(Some("n/a")), None);
    }

    #[tokio::test]
    async fn empty_batch_issues_no_query() {
        let store = Arc::new(MemoryBookStore::new(ColumnSet::full()));
        store.set_fail_reads(true);
        let resolver = IdentityResolver::new(store, &ColumnSet::full());

        let resolution = resolver.resolve(&[" ".to_string()]).await;
        assert_eq!(resolution, Resolution::Resolved(HashMap::new()));
    }

    #[tokio::test]
    async fn failed_lookup_degrades_to_all_new() {
        let store = Arc::new(MemoryBookStore::new(ColumnSet::full()));
        store.set_fail_reads(true);
        let resolver = IdentityResolver::new(store, &ColumnSet::full());

        let resolution = resolver.resolve(&["k1".to_string()]).await;
        assert!(resolution.is_degraded());
        assert!(resolution.get("k1").is_none());
    }

    #[test]
    fn tie_break_follows_destination_columns() {
        let store = Arc::new(MemoryBookStore::new(ColumnSet::full()));
        let columns = ColumnSet::full().without(columns::VERSION);
        let resolver = IdentityResolver::new(store, &columns);
        assert_eq!(resolver.tie_break(), TieBreak::LastSeenAt);
    }
}
