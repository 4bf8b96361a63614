//! In-memory [`Sink`] for tests.
//!
//! Rows live in `Vec`s behind `std::sync::Mutex`. Every call is appended to
//! a journal so tests can assert on ordering (file row before its lines,
//! batch sizes) and on session lifecycle. Inserts into a chosen relation can
//! be made to fail to exercise the fatal-persistence path.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::IngestError;
use crate::models::{FileRecord, LineRecord};

use super::{Provisioned, RangeDeletion, Relation, Sink, SinkSession, LOG_FILES, LOG_LINES};

/// One observed call against the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    EnsureRelation(String),
    OpenSession,
    InsertFiles { ids: Vec<i64> },
    InsertLines {
        file_id: i64,
        first_line: i64,
        len: usize,
    },
    CloseSession,
    DeleteRange { system_tag: String },
}

#[derive(Default)]
struct State {
    relations: HashSet<String>,
    files: Vec<FileRecord>,
    lines: Vec<LineRecord>,
    journal: Vec<SinkCall>,
    open_sessions: usize,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    failing_relation: Option<&'static str>,
}

fn lock(shared: &Shared) -> MutexGuard<'_, State> {
    shared.state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory store. Cheap to clone; clones share the same rows.
#[derive(Clone, Default)]
pub struct InMemorySink {
    shared: Arc<Shared>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose inserts into `relation` always fail.
    pub fn failing_inserts_into(relation: &'static str) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                failing_relation: Some(relation),
            }),
        }
    }

    pub fn files(&self) -> Vec<FileRecord> {
        lock(&self.shared).files.clone()
    }

    pub fn lines(&self) -> Vec<LineRecord> {
        lock(&self.shared).lines.clone()
    }

    pub fn journal(&self) -> Vec<SinkCall> {
        lock(&self.shared).journal.clone()
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        lock(&self.shared).open_sessions
    }

    /// Seed a file row directly, bypassing sessions.
    pub fn seed_file(&self, record: FileRecord) {
        lock(&self.shared).files.push(record);
    }
}

#[async_trait]
impl Sink for InMemorySink {
    async fn ensure_relation(&self, relation: &Relation) -> Result<Provisioned, IngestError> {
        let mut state = lock(&self.shared);
        state
            .journal
            .push(SinkCall::EnsureRelation(relation.name.to_string()));
        if state.relations.insert(relation.name.to_string()) {
            Ok(Provisioned::Created)
        } else {
            Ok(Provisioned::Exists)
        }
    }

    async fn open_session(&self) -> Result<Box<dyn SinkSession>, IngestError> {
        let mut state = lock(&self.shared);
        state.journal.push(SinkCall::OpenSession);
        state.open_sessions += 1;
        Ok(Box::new(InMemorySession {
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn query_max_modified_time(
        &self,
        system_tag: &str,
    ) -> Result<Option<DateTime<Utc>>, IngestError> {
        let state = lock(&self.shared);
        Ok(state
            .files
            .iter()
            .filter(|f| f.system_tag == system_tag)
            .map(|f| f.modified_at)
            .max())
    }

    async fn delete_rows_in_range(
        &self,
        system_tag: &str,
        from: DateTime<Utc>,
    ) -> Result<RangeDeletion, IngestError> {
        let mut state = lock(&self.shared);
        state.journal.push(SinkCall::DeleteRange {
            system_tag: system_tag.to_string(),
        });

        let doomed: HashSet<i64> = state
            .files
            .iter()
            .filter(|f| f.system_tag == system_tag && f.modified_at >= from)
            .map(|f| f.id)
            .collect();

        let lines_before = state.lines.len();
        state.lines.retain(|l| !doomed.contains(&l.file_id));
        let lines = (lines_before - state.lines.len()) as u64;

        let files_before = state.files.len();
        state.files.retain(|f| !doomed.contains(&f.id));
        let files = (files_before - state.files.len()) as u64;

        Ok(RangeDeletion { files, lines })
    }
}

struct InMemorySession {
    shared: Arc<Shared>,
}

impl InMemorySession {
    fn check_failure(&self, relation: &Relation) -> Result<(), IngestError> {
        if self.shared.failing_relation == Some(relation.name) {
            return Err(IngestError::persistence(relation.name, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl SinkSession for InMemorySession {
    async fn insert_files(&mut self, rows: &[FileRecord]) -> Result<(), IngestError> {
        self.check_failure(&LOG_FILES)?;
        let mut state = lock(&self.shared);
        if !state.relations.contains(LOG_FILES.name) {
            return Err(IngestError::persistence(LOG_FILES.name, "no such relation"));
        }
        state.journal.push(SinkCall::InsertFiles {
            ids: rows.iter().map(|r| r.id).collect(),
        });
        state.files.extend(rows.iter().cloned());
        Ok(())
    }

    async fn insert_lines(&mut self, rows: &[LineRecord]) -> Result<(), IngestError> {
        self.check_failure(&LOG_LINES)?;
        let mut state = lock(&self.shared);
        if !state.relations.contains(LOG_LINES.name) {
            return Err(IngestError::persistence(LOG_LINES.name, "no such relation"));
        }
        let Some(first) = rows.first() else {
            return Ok(());
        };
        if rows.iter().any(|r| r.file_id != first.file_id) {
            return Err(IngestError::persistence(
                LOG_LINES.name,
                "batch mixes lines of several files",
            ));
        }
        if !state.files.iter().any(|f| f.id == first.file_id) {
            return Err(IngestError::persistence(
                LOG_LINES.name,
                format!("file {} has not been persisted", first.file_id),
            ));
        }
        state.journal.push(SinkCall::InsertLines {
            file_id: first.file_id,
            first_line: first.line_number,
            len: rows.len(),
        });
        state.lines.extend(rows.iter().cloned());
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), IngestError> {
        let mut state = lock(&self.shared);
        state.journal.push(SinkCall::CloseSession);
        state.open_sessions -= 1;
        Ok(())
    }
}
