//! Projection of output records onto the destination's current columns.

use std::sync::Arc;

use bcat_core::{ColumnSet, OutputRecord, ProjectedRow};
use bcat_storage::{BookStore, StoreError};
use tracing::{debug, warn};

/// Keep only the cells the destination has a column for.
pub fn project(record: &OutputRecord, columns: &ColumnSet) -> ProjectedRow {
    ProjectedRow {
        cells: record
            .cells()
            .into_iter()
            .filter(|(name, _)| columns.contains(name))
            .map(|(name, value)| (name.to_string(), value))
            .collect(),
    }
}

pub struct SchemaAdaptiveWriter {
    store: Arc<dyn BookStore>,
    columns: ColumnSet,
}

impl SchemaAdaptiveWriter {
    /// `columns` is the destination column set, read once per process.
    pub fn new(store: Arc<dyn BookStore>, columns: ColumnSet) -> Self {
        let full = ColumnSet::full();
        let unsupported: Vec<&str> = full
            .iter()
            .filter(|column| !columns.contains(column))
            .collect();
        if !unsupported.is_empty() {
            debug!(?unsupported, "destination lacks columns; those fields will not be written");
        }
        Self { store, columns }
    }

    pub fn project(&self, record: &OutputRecord) -> ProjectedRow {
        project(record, &self.columns)
    }

    /// One append call for the whole page. Returns the number of rows written.
    pub async fn write_page(&self, records: &[OutputRecord]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let rows: Vec<ProjectedRow> = records.iter().map(|r| self.project(r)).collect();
        if rows.iter().all(ProjectedRow::is_empty) {
            warn!(records = records.len(), "destination shares no columns with output records; skipping write");
            return Ok(0);
        }
        let written = self.store.append_rows(&rows).await?;
        debug!(written, "page written");
        Ok(written)
    }
}
