//! Destination table access for the harvester: the `BookStore` contract plus a
//! Postgres backend over sqlx and an in-process backend.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bcat_core::{columns, ColumnSet, ColumnValue, ProjectedRow, ResolvedIdentity, SampleRow};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("column `{column}` does not exist in {table}")]
    UnknownColumn { table: String, column: String },
    #[error("rows in one batch must share a column layout")]
    MixedColumnLayout,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Ordering used to pick one historical row per natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    Version,
    LastSeenAt,
    FirstSeenAt,
}

impl TieBreak {
    /// Most specific ordering the destination schema supports.
    pub fn for_columns(columns: &ColumnSet) -> Self {
        if columns.contains(columns::VERSION) {
            TieBreak::Version
        } else if columns.contains(columns::LAST_SEEN_AT) {
            TieBreak::LastSeenAt
        } else {
            TieBreak::FirstSeenAt
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            TieBreak::Version => columns::VERSION,
            TieBreak::LastSeenAt => columns::LAST_SEEN_AT,
            TieBreak::FirstSeenAt => columns::FIRST_SEEN_AT,
        }
    }
}

/// Keyed, appendable destination table.
#[async_trait]
pub trait BookStore: Send + Sync {
    async fn list_columns(&self) -> Result<ColumnSet, StoreError>;

    /// Random sample of up to `limit` rows projecting title/author/publisher.
    async fn sample_rows(&self, limit: usize) -> Result<Vec<SampleRow>, StoreError>;

    /// At most one identity per key, chosen by `tie_break` (descending).
    async fn resolve_identities(
        &self,
        keys: &[String],
        tie_break: TieBreak,
    ) -> Result<HashMap<String, ResolvedIdentity>, StoreError>;

    /// Append a batch of rows sharing one column layout. Returns rows written.
    async fn append_rows(&self, rows: &[ProjectedRow]) -> Result<u64, StoreError>;
}

/// Validated `schema.table` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    schema: String,
    name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Result<Self, StoreError> {
        let schema = schema.into();
        let name = name.into();
        validate_identifier(&schema)?;
        validate_identifier(&name)?;
        Ok(Self { schema, name })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qualified(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.name)
    }
}

fn validate_identifier(ident: &str) -> Result<(), StoreError> {
    let mut chars = ident.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(ident.to_string()))
    }
}

fn quote_identifier(ident: &str) -> Result<String, StoreError> {
    validate_identifier(ident)?;
    Ok(format!("\"{ident}\""))
}

fn shared_layout(rows: &[ProjectedRow]) -> Result<Vec<&str>, StoreError> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let layout: Vec<&str> = first.column_names().collect();
    if rows
        .iter()
        .any(|row| !row.column_names().eq(layout.iter().copied()))
    {
        return Err(StoreError::MixedColumnLayout);
    }
    Ok(layout)
}

#[derive(Debug, Clone)]
pub struct PgBookStore {
    pool: PgPool,
    table: TableRef,
}

impl PgBookStore {
    pub async fn connect(database_url: &str, table: TableRef) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool, table))
    }

    pub fn from_pool(pool: PgPool, table: TableRef) -> Self {
        Self { pool, table }
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Apply the bundled migrations (creates the default `raw_naver` table).
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl BookStore for PgBookStore {
    async fn list_columns(&self) -> Result<ColumnSet, StoreError> {
        let rows = sqlx::query(
            "SELECT column_name::text AS column_name
             FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = $2",
        )
        .bind(self.table.schema())
        .bind(self.table.name())
        .fetch_all(&self.pool)
        .await?;

        let columns = rows
            .iter()
            .map(|row| row.try_get::<String, _>("column_name"))
            .collect::<Result<ColumnSet, _>>()?;
        debug!(table = %self.table.qualified(), columns = columns.len(), "listed destination columns");
        Ok(columns)
    }

    async fn sample_rows(&self, limit: usize) -> Result<Vec<SampleRow>, StoreError> {
        let sql = format!(
            "SELECT {title}::text AS title, {author}::text AS author, {publisher}::text AS publisher
             FROM {table}
             ORDER BY random()
             LIMIT $1",
            title = columns::TITLE,
            author = columns::AUTHOR,
            publisher = columns::PUBLISHER,
            table = self.table.qualified(),
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(SampleRow {
                    title: row.try_get("title")?,
                    author: row.try_get("author")?,
                    publisher: row.try_get("publisher")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn resolve_identities(
        &self,
        keys: &[String],
        tie_break: TieBreak,
    ) -> Result<HashMap<String, ResolvedIdentity>, StoreError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let version_expr = match tie_break {
            TieBreak::Version => format!("{}::bigint", columns::VERSION),
            TieBreak::LastSeenAt | TieBreak::FirstSeenAt => "NULL::bigint".to_string(),
        };
        let sql = format!(
            "SELECT DISTINCT ON ({key})
                {key}::text AS natural_key,
                {id}::text AS identity_id,
                {first_at}::timestamptz AS first_seen_at,
                COALESCE({first_log}::text, '') AS first_seen_provenance,
                {version_expr} AS version
             FROM {table}
             WHERE {key} = ANY($1)
             ORDER BY {key}, {order} DESC NULLS LAST",
            key = columns::NATURAL_KEY,
            id = columns::IDENTITY_ID,
            first_at = columns::FIRST_SEEN_AT,
            first_log = columns::FIRST_SEEN_PROVENANCE,
            order = tie_break.column(),
            table = self.table.qualified(),
        );

        let rows = sqlx::query(&sql)
            .bind(keys.to_vec())
            .fetch_all(&self.pool)
            .await?;

        let mut resolved = HashMap::with_capacity(rows.len());
        for row in rows {
            let natural_key: String = row.try_get("natural_key")?;
            let raw_id: String = row.try_get("identity_id")?;
            let Ok(identity_id) = Uuid::parse_str(&raw_id) else {
                warn!(natural_key = %natural_key, raw_id = %raw_id, "skipping row with unparseable identity id");
                continue;
            };
            let first_seen_at: DateTime<Utc> = row.try_get("first_seen_at")?;
            resolved.insert(
                natural_key,
                ResolvedIdentity {
                    identity_id,
                    first_seen_at,
                    first_seen_provenance: row.try_get("first_seen_provenance")?,
                    last_version: row.try_get("version")?,
                },
            );
        }
        Ok(resolved)
    }

    async fn append_rows(&self, rows: &[ProjectedRow]) -> Result<u64, StoreError> {
        let layout = shared_layout(rows)?;
        if layout.is_empty() {
            return Ok(0);
        }
        let quoted = layout
            .iter()
            .map(|column| quote_identifier(column))
            .collect::<Result<Vec<_>, _>>()?;

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            self.table.qualified(),
            quoted.join(", ")
        ));
        qb.push_values(rows, |mut b, row| {
            for (_, value) in &row.cells {
                match value {
                    ColumnValue::Text(text) => {
                        b.push_bind(text.clone());
                    }
                    ColumnValue::Integer(v) => {
                        b.push_bind(*v);
                    }
                    ColumnValue::NullableInteger(v) => {
                        b.push_bind(*v);
                    }
                    ColumnValue::Timestamp(ts) => {
                        b.push_bind(*ts);
                    }
                    ColumnValue::Uuid(id) => {
                        b.push_bind(*id);
                    }
                }
            }
        });

        let result = qb.build().execute(&self.pool).await?;
        debug!(table = %self.table.qualified(), rows = result.rows_affected(), "appended rows");
        Ok(result.rows_affected())
    }
}

type StoredRow = BTreeMap<String, ColumnValue>;

/// In-process table with a fixed column set. Rejects writes to unknown columns
/// the way a real destination would, and can be told to fail reads or writes.
#[derive(Debug, Default)]
pub struct MemoryBookStore {
    columns: ColumnSet,
    rows: Mutex<Vec<StoredRow>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryBookStore {
    pub fn new(columns: ColumnSet) -> Self {
        Self {
            columns,
            ..Default::default()
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn rows(&self) -> Vec<StoredRow> {
        self.rows.lock().await.clone()
    }

    pub async fn rows_for_key(&self, natural_key: &str) -> Vec<StoredRow> {
        self.rows
            .lock()
            .await
            .iter()
            .filter(|row| {
                row.get(columns::NATURAL_KEY).and_then(ColumnValue::as_text) == Some(natural_key)
            })
            .cloned()
            .collect()
    }

    fn check_reads(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".to_string()));
        }
        Ok(())
    }

    fn check_row(&self, row: &ProjectedRow) -> Result<StoredRow, StoreError> {
        row.cells
            .iter()
            .map(|(column, value)| {
                if self.columns.contains(column) {
                    Ok((column.clone(), value.clone()))
                } else {
                    Err(StoreError::UnknownColumn {
                        table: "memory".to_string(),
                        column: column.clone(),
                    })
                }
            })
            .collect()
    }
}

fn rank(row: &StoredRow, tie_break: TieBreak) -> Option<i64> {
    let value = row.get(tie_break.column())?;
    match tie_break {
        TieBreak::Version => value.as_integer(),
        TieBreak::LastSeenAt | TieBreak::FirstSeenAt => {
            value.as_timestamp().map(|ts| ts.timestamp_micros())
        }
    }
}

fn identity_from_row(row: &StoredRow, tie_break: TieBreak) -> Option<ResolvedIdentity> {
    Some(ResolvedIdentity {
        identity_id: row.get(columns::IDENTITY_ID)?.as_uuid()?,
        first_seen_at: row.get(columns::FIRST_SEEN_AT)?.as_timestamp()?,
        first_seen_provenance: row
            .get(columns::FIRST_SEEN_PROVENANCE)
            .and_then(ColumnValue::as_text)
            .unwrap_or_default()
            .to_string(),
        last_version: match tie_break {
            TieBreak::Version => row.get(columns::VERSION).and_then(ColumnValue::as_integer),
            TieBreak::LastSeenAt | TieBreak::FirstSeenAt => None,
        },
    })
}

#[async_trait]
impl BookStore for MemoryBookStore {
    async fn list_columns(&self) -> Result<ColumnSet, StoreError> {
        self.check_reads()?;
        Ok(self.columns.clone())
    }

    async fn sample_rows(&self, limit: usize) -> Result<Vec<SampleRow>, StoreError> {
        self.check_reads()?;
        let mut rows = self.rows.lock().await.clone();
        rows.shuffle(&mut rand::rng());
        let text = |row: &StoredRow, column: &str| {
            row.get(column)
                .and_then(ColumnValue::as_text)
                .map(str::to_string)
        };
        Ok(rows
            .iter()
            .take(limit)
            .map(|row| SampleRow {
                title: text(row, columns::TITLE),
                author: text(row, columns::AUTHOR),
                publisher: text(row, columns::PUBLISHER),
            })
            .collect())
    }

    async fn resolve_identities(
        &self,
        keys: &[String],
        tie_break: TieBreak,
    ) -> Result<HashMap<String, ResolvedIdentity>, StoreError> {
        self.check_reads()?;
        let wanted: HashSet<&str> = keys.iter().map(String::as_str).collect();
        let rows = self.rows.lock().await;

        let mut best: HashMap<String, (Option<i64>, ResolvedIdentity)> = HashMap::new();
        for row in rows.iter() {
            let Some(key) = row.get(columns::NATURAL_KEY).and_then(ColumnValue::as_text) else {
                continue;
            };
            if !wanted.contains(key) {
                continue;
            }
            let Some(identity) = identity_from_row(row, tie_break) else {
                continue;
            };
            let row_rank = rank(row, tie_break);
            match best.entry(key.to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert((row_rank, identity));
                }
                Entry::Occupied(mut slot) => {
                    if row_rank > slot.get().0 {
                        slot.insert((row_rank, identity));
                    }
                }
            }
        }

        Ok(best
            .into_iter()
            .map(|(key, (_, identity))| (key, identity))
            .collect())
    }

    async fn append_rows(&self, rows: &[ProjectedRow]) -> Result<u64, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        shared_layout(rows)?;
        let checked = rows
            .iter()
            .map(|row| self.check_row(row))
            .collect::<Result<Vec<_>, _>>()?;
        let written = checked.len() as u64;
        self.rows.lock().await.extend(checked);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn stored(key: &str, id: Uuid, version: Option<i64>, updated_hour: u32) -> ProjectedRow {
        let mut cells = vec![
            (columns::NATURAL_KEY.to_string(), ColumnValue::Text(key.to_string())),
            (columns::IDENTITY_ID.to_string(), ColumnValue::Uuid(id)),
            (columns::FIRST_SEEN_AT.to_string(), ColumnValue::Timestamp(ts(1))),
            (
                columns::FIRST_SEEN_PROVENANCE.to_string(),
                ColumnValue::Text("scheduled_auto".to_string()),
            ),
            (
                columns::LAST_SEEN_AT.to_string(),
                ColumnValue::Timestamp(ts(updated_hour)),
            ),
        ];
        if let Some(v) = version {
            cells.push((columns::VERSION.to_string(), ColumnValue::Integer(v)));
        }
        ProjectedRow { cells }
    }

    #[test]
    fn tie_break_degrades_with_schema() {
        let full = ColumnSet::full();
        assert_eq!(TieBreak::for_columns(&full), TieBreak::Version);
        let no_version = full.clone().without(columns::VERSION);
        assert_eq!(TieBreak::for_columns(&no_version), TieBreak::LastSeenAt);
        let bare = no_version.without(columns::LAST_SEEN_AT);
        assert_eq!(TieBreak::for_columns(&bare), TieBreak::FirstSeenAt);
    }

    #[test]
    fn table_identifiers_are_validated_and_quoted() {
        let table = TableRef::new("public", "raw_naver").expect("valid");
        assert_eq!(table.qualified(), "\"public\".\"raw_naver\"");
        assert!(TableRef::new("public", "raw_naver; DROP TABLE x").is_err());
        assert!(TableRef::new("", "raw_naver").is_err());
        assert!(TableRef::new("public", "1books").is_err());
    }

    #[tokio::test]
    async fn memory_resolve_prefers_highest_version() {
        let store = MemoryBookStore::new(ColumnSet::full());
        let older = Uuid::now_v7();
        let newer = Uuid::now_v7();
        store
            .append_rows(&[
                stored("k1", newer, Some(20), 2),
                stored("k1", older, Some(10), 9),
            ])
            .await
            .expect("seed");

        let resolved = store
            .resolve_identities(&["k1".to_string(), "missing".to_string()], TieBreak::Version)
            .await
            .expect("resolve");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved["k1"].identity_id, newer);
        assert_eq!(resolved["k1"].last_version, Some(20));
    }

    #[tokio::test]
    async fn memory_resolve_falls_back_to_last_seen_without_version() {
        let columns = ColumnSet::full().without(columns::VERSION);
        let store = MemoryBookStore::new(columns);
        let early = Uuid::now_v7();
        let late = Uuid::now_v7();
        store
            .append_rows(&[stored("k1", late, None, 8), stored("k1", early, None, 3)])
            .await
            .expect("seed");

        let resolved = store
            .resolve_identities(&["k1".to_string()], TieBreak::LastSeenAt)
            .await
            .expect("resolve");
        assert_eq!(resolved["k1"].identity_id, late);
        assert_eq!(resolved["k1"].last_version, None);
    }

    #[tokio::test]
    async fn memory_store_rejects_unknown_columns() {
        let store = MemoryBookStore::new(ColumnSet::full().without(columns::VERSION));
        let err = store
            .append_rows(&[stored("k1", Uuid::now_v7(), Some(1), 1)])
            .await
            .expect_err("version column is not defined");
        assert!(matches!(err, StoreError::UnknownColumn { .. }));
        assert!(store.rows().await.is_empty());
    }

    #[tokio::test]
    async fn mixed_layouts_are_rejected() {
        let store = MemoryBookStore::new(ColumnSet::full());
        let err = store
            .append_rows(&[
                stored("k1", Uuid::now_v7(), Some(1), 1),
                stored("k2", Uuid::now_v7(), None, 1),
            ])
            .await
            .expect_err("layouts differ");
        assert!(matches!(err, StoreError::MixedColumnLayout));
    }

    #[tokio::test]
    async fn sample_is_bounded_and_failures_surface() {
        let store = MemoryBookStore::new(ColumnSet::full());
        let rows: Vec<_> = (0..5)
            .map(|i| {
                let mut row = stored(&format!("k{i}"), Uuid::now_v7(), Some(1), 1);
                row.cells
                    .push((columns::TITLE.to_string(), ColumnValue::Text(format!("Title {i}"))));
                row
            })
            .collect();
        store.append_rows(&rows).await.expect("seed");

        let sample = store.sample_rows(3).await.expect("sample");
        assert_eq!(sample.len(), 3);
        assert!(sample.iter().all(|row| row.title.is_some() && row.author.is_none()));

        store.set_fail_reads(true);
        assert!(store.sample_rows(3).await.is_err());
        assert!(store
            .resolve_identities(&["k1".to_string()], TieBreak::Version)
            .await
            .is_err());
    }
}
