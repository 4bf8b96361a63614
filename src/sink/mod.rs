//! Destination store abstraction.
//!
//! The [`Sink`] trait is everything the pipeline and the CDC protocol need
//! from the analytical store: idempotent relation provisioning, per-worker
//! sessions for row inserts, the watermark query, and the range delete.
//!
//! | Implementation | Purpose |
//! |----------------|---------|
//! | [`sqlite::SqliteSink`] | SQLite database via `sqlx` |
//! | [`memory::InMemorySink`] | In-process store with a call journal, for tests |

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::IngestError;
use crate::models::{FileRecord, LineRecord};

/// Storage type of a relation column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Text,
    /// Microseconds since the Unix epoch, UTC.
    Timestamp,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub required: bool,
}

/// Name and schema of a destination relation.
#[derive(Debug, Clone, Copy)]
pub struct Relation {
    pub name: &'static str,
    pub columns: &'static [Column],
    pub primary_key: Option<&'static str>,
    /// `(column, referenced relation, referenced column)`.
    pub foreign_key: Option<(&'static str, &'static str, &'static str)>,
    /// `(index name, column list)` pairs.
    pub indexes: &'static [(&'static str, &'static str)],
}

const fn required(name: &'static str, ty: ColumnType) -> Column {
    Column {
        name,
        ty,
        required: true,
    }
}

/// File metadata relation: one row per ingested file.
pub const LOG_FILES: Relation = Relation {
    name: "log_files",
    columns: &[
        required("id", ColumnType::Integer),
        required("sys", ColumnType::Text),
        required("path", ColumnType::Text),
        required("modified_at", ColumnType::Timestamp),
        required("size", ColumnType::Integer),
    ],
    primary_key: Some("id"),
    foreign_key: None,
    indexes: &[("idx_log_files_sys_modified", "sys, modified_at")],
};

/// Line content relation: one row per line of an ingested file.
pub const LOG_LINES: Relation = Relation {
    name: "log_lines",
    columns: &[
        required("file_id", ColumnType::Integer),
        required("line_num", ColumnType::Integer),
        required("line_text", ColumnType::Text),
    ],
    primary_key: None,
    foreign_key: Some(("file_id", "log_files", "id")),
    indexes: &[("idx_log_lines_file_id", "file_id")],
};

/// Every relation the loader writes to, in creation order.
pub const RELATIONS: [Relation; 2] = [LOG_FILES, LOG_LINES];

/// Outcome of [`Sink::ensure_relation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provisioned {
    Exists,
    Created,
}

/// Rows removed by [`Sink::delete_rows_in_range`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RangeDeletion {
    pub files: u64,
    pub lines: u64,
}

impl RangeDeletion {
    pub fn total(&self) -> u64 {
        self.files + self.lines
    }
}

/// The remote analytical store, as consumed by the pipeline.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Create `relation` if it is missing. An existing relation is not an error.
    async fn ensure_relation(&self, relation: &Relation) -> Result<Provisioned, IngestError>;

    /// Open an independent session. Each loader worker owns exactly one.
    async fn open_session(&self) -> Result<Box<dyn SinkSession>, IngestError>;

    /// Max stored `modified_at` for `system_tag`, or `None` when it has no rows.
    async fn query_max_modified_time(
        &self,
        system_tag: &str,
    ) -> Result<Option<DateTime<Utc>>, IngestError>;

    /// Delete file rows of `system_tag` modified at or after `from`, and their lines.
    ///
    /// Blocking bulk operation; a store with streaming write buffers may
    /// refuse it until they flush.
    async fn delete_rows_in_range(
        &self,
        system_tag: &str,
        from: DateTime<Utc>,
    ) -> Result<RangeDeletion, IngestError>;
}

/// A single writer connection with one uploader per relation.
#[async_trait]
pub trait SinkSession: Send {
    async fn insert_files(&mut self, rows: &[FileRecord]) -> Result<(), IngestError>;

    async fn insert_lines(&mut self, rows: &[LineRecord]) -> Result<(), IngestError>;

    /// Release the session back to the store.
    async fn close(self: Box<Self>) -> Result<(), IngestError>;
}

/// Ensure every loader relation exists, logging what was found.
pub async fn provision(sink: &dyn Sink) -> Result<Vec<(&'static str, Provisioned)>, IngestError> {
    let mut outcome = Vec::with_capacity(RELATIONS.len());
    for relation in RELATIONS.iter() {
        let state = sink.ensure_relation(relation).await?;
        match state {
            Provisioned::Exists => info!("Relation {} already exists", relation.name),
            Provisioned::Created => info!("Relation {} has been created", relation.name),
        }
        outcome.push((relation.name, state));
    }
    Ok(outcome)
}
