//! Core domain model and provenance types for the book catalog harvester.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Destination column names. These match the layout of the existing
/// `raw_naver` table so the harvester can write into it unchanged.
pub mod columns {
    pub const NATURAL_KEY: &str = "isbn";
    pub const IDENTITY_ID: &str = "uuid";
    pub const VERSION: &str = "version";
    pub const FIRST_SEEN_AT: &str = "created_at";
    pub const FIRST_SEEN_PROVENANCE: &str = "created_log";
    pub const LAST_SEEN_AT: &str = "updated_at";
    pub const LAST_SEEN_PROVENANCE: &str = "updated_log";
    pub const TITLE: &str = "title";
    pub const LINK: &str = "link";
    pub const IMAGE: &str = "image";
    pub const AUTHOR: &str = "author";
    pub const DISCOUNT: &str = "discount";
    pub const PUBLISHER: &str = "publisher";
    pub const DESCRIPTION: &str = "description";
    pub const PUBLICATION_DATE: &str = "pubdate";
}

/// First-seen provenance for records created by a sampled (scheduled) run.
pub const SCHEDULED_PROVENANCE: &str = "scheduled_auto";
/// First-seen provenance for records created by a manual keyword run.
pub const MANUAL_PROVENANCE: &str = "manual_keyword";

/// Separator used by the search API for multi-value author fields.
pub const AUTHOR_DELIMITER: char = '^';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Relevance,
    Recency,
}

impl SortOrder {
    pub const ALL: [SortOrder; 2] = [SortOrder::Relevance, SortOrder::Recency];

    /// Value the search API expects in its `sort` parameter.
    pub fn api_value(self) -> &'static str {
        match self {
            SortOrder::Relevance => "sim",
            SortOrder::Recency => "date",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_value())
    }
}

/// Which stored field a search term was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermSource {
    Title,
    Author,
    Publisher,
    Fallback,
    Manual,
}

impl TermSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TermSource::Title => "title",
            TermSource::Author => "author",
            TermSource::Publisher => "publisher",
            TermSource::Fallback => "fallback",
            TermSource::Manual => "manual",
        }
    }
}

/// Ephemeral search string; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Term {
    pub text: String,
    pub source: TermSource,
}

impl Term {
    pub fn new(text: impl Into<String>, source: TermSource) -> Self {
        Self {
            text: text.into(),
            source,
        }
    }
}

/// Operating mode of a harvest run, as configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMode {
    Title,
    Author,
    Publisher,
    Mixed,
    Manual,
}

impl SamplingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SamplingMode::Title => "title",
            SamplingMode::Author => "author",
            SamplingMode::Publisher => "publisher",
            SamplingMode::Mixed => "mixed",
            SamplingMode::Manual => "manual",
        }
    }
}

impl FromStr for SamplingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "title" => Ok(SamplingMode::Title),
            "author" => Ok(SamplingMode::Author),
            "publisher" => Ok(SamplingMode::Publisher),
            "mixed" => Ok(SamplingMode::Mixed),
            "manual" => Ok(SamplingMode::Manual),
            other => Err(format!(
                "unknown mode `{other}` (expected title, author, publisher, mixed or manual)"
            )),
        }
    }
}

/// Composite last-seen provenance tag for one observation.
pub fn last_seen_tag(mode: SamplingMode, term: &str, sort: SortOrder) -> String {
    format!(
        "auto_upsert|mode={}|keyword={}|sort={}",
        mode.as_str(),
        term,
        sort.api_value()
    )
}

/// One item as returned by the search API. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchedItem {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub discount: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default, rename = "isbn")]
    pub natural_key: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "pubdate")]
    pub publication_date: Option<String>,
}

impl FetchedItem {
    /// Trimmed natural key, or `None` when the item cannot be identified.
    pub fn natural_key(&self) -> Option<&str> {
        self.natural_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Str(String),
    Int(i64),
    Float(f64),
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<StringOrNumber>::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        StringOrNumber::Str(s) => s,
        StringOrNumber::Int(i) => i.to_string(),
        StringOrNumber::Float(f) => f.to_string(),
    }))
}

/// Identity and first-seen provenance carried forward for a natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedIdentity {
    pub identity_id: Uuid,
    pub first_seen_at: DateTime<Utc>,
    pub first_seen_provenance: String,
    /// Version of the row that won the tie-break, when the destination has one.
    pub last_version: Option<i64>,
}

/// Record produced by the merge step, before schema projection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputRecord {
    pub natural_key: String,
    pub identity_id: Uuid,
    pub version: i64,
    pub first_seen_at: DateTime<Utc>,
    pub first_seen_provenance: String,
    pub last_seen_at: DateTime<Utc>,
    pub last_seen_provenance: String,
    pub title: String,
    pub link: String,
    pub image: String,
    pub author: String,
    pub discount: Option<i64>,
    pub publisher: String,
    pub description: String,
    pub publication_date: String,
}

impl OutputRecord {
    /// Every field of the record as a destination cell, in write order.
    pub fn cells(&self) -> Vec<(&'static str, ColumnValue)> {
        vec![
            (columns::IDENTITY_ID, ColumnValue::Uuid(self.identity_id)),
            (columns::VERSION, ColumnValue::Integer(self.version)),
            (columns::FIRST_SEEN_AT, ColumnValue::Timestamp(self.first_seen_at)),
            (
                columns::FIRST_SEEN_PROVENANCE,
                ColumnValue::Text(self.first_seen_provenance.clone()),
            ),
            (columns::LAST_SEEN_AT, ColumnValue::Timestamp(self.last_seen_at)),
            (
                columns::LAST_SEEN_PROVENANCE,
                ColumnValue::Text(self.last_seen_provenance.clone()),
            ),
            (columns::TITLE, ColumnValue::Text(self.title.clone())),
            (columns::LINK, ColumnValue::Text(self.link.clone())),
            (columns::IMAGE, ColumnValue::Text(self.image.clone())),
            (columns::AUTHOR, ColumnValue::Text(self.author.clone())),
            (columns::DISCOUNT, ColumnValue::NullableInteger(self.discount)),
            (columns::PUBLISHER, ColumnValue::Text(self.publisher.clone())),
            (columns::NATURAL_KEY, ColumnValue::Text(self.natural_key.clone())),
            (columns::DESCRIPTION, ColumnValue::Text(self.description.clone())),
            (
                columns::PUBLICATION_DATE,
                ColumnValue::Text(self.publication_date.clone()),
            ),
        ]
    }
}

/// Typed destination cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ColumnValue {
    Text(String),
    Integer(i64),
    NullableInteger(Option<i64>),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
}

impl ColumnValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ColumnValue::Integer(v) => Some(*v),
            ColumnValue::NullableInteger(v) => *v,
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            ColumnValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            ColumnValue::Uuid(id) => Some(*id),
            ColumnValue::Text(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }
}

/// Row restricted to the columns the destination currently has.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ProjectedRow {
    pub cells: Vec<(String, ColumnValue)>,
}

impl ProjectedRow {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }
}

/// Destination column names as currently defined by the store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ColumnSet(BTreeSet<String>);

impl ColumnSet {
    pub fn contains(&self, column: &str) -> bool {
        self.0.contains(column)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Every column a full `OutputRecord` can populate.
    pub fn full() -> Self {
        [
            columns::NATURAL_KEY,
            columns::IDENTITY_ID,
            columns::VERSION,
            columns::FIRST_SEEN_AT,
            columns::FIRST_SEEN_PROVENANCE,
            columns::LAST_SEEN_AT,
            columns::LAST_SEEN_PROVENANCE,
            columns::TITLE,
            columns::LINK,
            columns::IMAGE,
            columns::AUTHOR,
            columns::DISCOUNT,
            columns::PUBLISHER,
            columns::DESCRIPTION,
            columns::PUBLICATION_DATE,
        ]
        .into_iter()
        .collect()
    }

    pub fn without(mut self, column: &str) -> Self {
        self.0.remove(column);
        self
    }
}

impl<S: Into<String>> FromIterator<S> for ColumnSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Title/author/publisher projection used for term sampling.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SampleRow {
    pub title: Option<String>,
    pub author: Option<String>,
    pub publisher: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_orders_map_to_api_values() {
        assert_eq!(SortOrder::Relevance.api_value(), "sim");
        assert_eq!(SortOrder::Recency.api_value(), "date");
        assert_eq!(SortOrder::ALL.len(), 2);
    }

    #[test]
    fn sampling_mode_parses_case_insensitively() {
        assert_eq!("Title".parse::<SamplingMode>(), Ok(SamplingMode::Title));
        assert_eq!(" mixed ".parse::<SamplingMode>(), Ok(SamplingMode::Mixed));
        assert!("everything".parse::<SamplingMode>().is_err());
    }

    #[test]
    fn fetched_item_accepts_string_numeric_and_missing_discount() {
        let items: Vec<FetchedItem> = serde_json::from_str(
            r#"[
                {"title": "A", "isbn": "9780000000001", "discount": "12600"},
                {"title": "B", "isbn": "9780000000002", "discount": 9000},
                {"title": "C", "isbn": "9780000000003", "discount": ""},
                {"title": "D"}
            ]"#,
        )
        .expect("items parse");

        assert_eq!(items[0].discount.as_deref(), Some("12600"));
        assert_eq!(items[1].discount.as_deref(), Some("9000"));
        assert_eq!(items[2].discount.as_deref(), Some(""));
        assert_eq!(items[3].discount, None);
        assert_eq!(items[3].natural_key(), None);
        assert_eq!(items[0].natural_key(), Some("9780000000001"));
    }

    #[test]
    fn blank_natural_key_is_not_an_identity() {
        let item = FetchedItem {
            natural_key: Some("   ".into()),
            ..Default::default()
        };
        assert_eq!(item.natural_key(), None);
    }

    #[test]
    fn last_seen_tag_carries_mode_term_and_sort() {
        assert_eq!(
            last_seen_tag(SamplingMode::Author, "한강", SortOrder::Recency),
            "auto_upsert|mode=author|keyword=한강|sort=date"
        );
    }

    #[test]
    fn full_column_set_covers_every_record_cell() {
        let full = ColumnSet::full();
        let record = OutputRecord {
            natural_key: "k".into(),
            identity_id: Uuid::now_v7(),
            version: 1,
            first_seen_at: Utc::now(),
            first_seen_provenance: String::new(),
            last_seen_at: Utc::now(),
            last_seen_provenance: String::new(),
            title: String::new(),
            link: String::new(),
            image: String::new(),
            author: String::new(),
            discount: None,
            publisher: String::new(),
            description: String::new(),
            publication_date: String::new(),
        };
        let cells = record.cells();
        assert_eq!(cells.len(), full.len());
        assert!(cells.iter().all(|(name, _)| full.contains(name)));
    }
}
