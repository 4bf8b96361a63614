//! Sink Loader stage: provision once, then persist every kept file.
//!
//! Each kept [`ScoredFile`] becomes one [`FileRecord`] followed by its lines,
//! sent in batches of `line_batch_size` in ascending line order. The file row
//! is always written before any of its line batches.
//!
//! File ids are `prefix × 10000 + seq`, where `prefix` is a wall-clock second
//! formatted as the integer `YYYYMMDDHHMMSS` and `seq` is a shared counter
//! starting at 1. A prefix carries at most 9999 files; when it fills up, the
//! generator moves to the next wall-clock second after it (waiting for the
//! clock if needed) and restarts the counter, so at most 9999 files are keyed
//! per distinct second.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info};

use crate::error::IngestError;
use crate::models::{FileRecord, LineRecord, ScoredFile};
use crate::pipeline::{join_workers, next_item, share, SharedReceiver};
use crate::sink::{provision, Sink, SinkSession};

/// Current wall-clock second as `YYYYMMDDHHMMSS`.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Clock poll interval while waiting for a fresh second.
const ROLLOVER_POLL: Duration = Duration::from_millis(20);

/// `at` as the integer `YYYYMMDDHHMMSS`.
pub fn stamp<Tz: TimeZone>(at: &DateTime<Tz>) -> i64 {
    i64::from(at.year()) * 10_000_000_000
        + i64::from(at.month()) * 100_000_000
        + i64::from(at.day()) * 1_000_000
        + i64::from(at.hour()) * 10_000
        + i64::from(at.minute()) * 100
        + i64::from(at.second())
}

struct IdState {
    prefix: i64,
    seq: i64,
}

/// Run-wide generator of file ids, shared by every loader worker.
pub struct FileIdGenerator {
    state: Mutex<IdState>,
    clock: Clock,
}

impl FileIdGenerator {
    /// Ids under one prefix are `prefix * SEQUENCE_SPAN + 1 ..= prefix * SEQUENCE_SPAN + 9999`.
    pub const SEQUENCE_SPAN: i64 = 10_000;

    /// Start at `prefix`, rolling over on the local wall clock.
    pub fn new(prefix: i64) -> Self {
        Self::with_clock(prefix, Arc::new(|| stamp(&Local::now())))
    }

    pub fn with_clock(prefix: i64, clock: Clock) -> Self {
        Self {
            state: Mutex::new(IdState { prefix, seq: 0 }),
            clock,
        }
    }

    /// Generator keyed on the run start `at`.
    pub fn for_run_start<Tz: TimeZone>(at: &DateTime<Tz>) -> Self {
        Self::new(stamp(at))
    }

    /// Prefix the next id will carry, unless the sequence rolls over first.
    pub async fn prefix(&self) -> i64 {
        self.state.lock().await.prefix
    }

    /// Next id of the run. Ids strictly increase across all callers.
    pub async fn next_id(&self) -> i64 {
        let mut state = self.state.lock().await;
        state.seq += 1;
        if state.seq >= Self::SEQUENCE_SPAN {
            let full = state.prefix;
            state.prefix = self.second_after(full).await;
            state.seq = 1;
            debug!("Id prefix {} is full, continuing with {}", full, state.prefix);
        }
        state.prefix * Self::SEQUENCE_SPAN + state.seq
    }

    async fn second_after(&self, prefix: i64) -> i64 {
        loop {
            let now = (self.clock)();
            if now > prefix {
                return now;
            }
            tokio::time::sleep(ROLLOVER_POLL).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub workers: usize,
    pub line_batch_size: usize,
    pub system_tag: String,
}

/// Counters reported by the loader pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub files: u64,
    pub lines: u64,
    pub batches: u64,
}

impl LoadReport {
    fn merge(self, other: LoadReport) -> LoadReport {
        LoadReport {
            files: self.files + other.files,
            lines: self.lines + other.lines,
            batches: self.batches + other.batches,
        }
    }
}

/// Persist one file: its metadata row, then its lines in batches.
pub async fn persist_file(
    session: &mut dyn SinkSession,
    ids: &FileIdGenerator,
    system_tag: &str,
    scored: &ScoredFile,
    batch_size: usize,
) -> Result<LoadReport, IngestError> {
    let record = FileRecord {
        id: ids.next_id().await,
        system_tag: system_tag.to_string(),
        path: scored.file_path.to_string_lossy().into_owned(),
        modified_at: scored.modified_at,
        size_bytes: scored.size_bytes,
    };
    session.insert_files(std::slice::from_ref(&record)).await?;

    let mut report = LoadReport {
        files: 1,
        ..LoadReport::default()
    };
    let batch_size = batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);

    for (n, text) in scored.lines().enumerate() {
        batch.push(LineRecord {
            file_id: record.id,
            line_number: n as i64,
            text: text.to_string(),
        });
        if batch.len() == batch_size {
            session.insert_lines(&batch).await?;
            report.lines += batch.len() as u64;
            report.batches += 1;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        session.insert_lines(&batch).await?;
        report.lines += batch.len() as u64;
        report.batches += 1;
    }

    debug!(
        "Persisted {} as file {} with {} lines",
        record.path, record.id, report.lines
    );
    Ok(report)
}

/// Provision the destination relations, then start the loader workers.
///
/// The returned handle resolves once every worker has finished and closed
/// its session.
pub fn spawn_loader(
    sink: Arc<dyn Sink>,
    ids: Arc<FileIdGenerator>,
    settings: LoaderSettings,
    input: mpsc::Receiver<ScoredFile>,
) -> JoinHandle<Result<LoadReport, IngestError>> {
    tokio::spawn(async move {
        provision(sink.as_ref()).await?;

        let input = share(input);
        let mut pool = JoinSet::new();
        for n in 1..=settings.workers {
            pool.spawn(loader_worker(
                n,
                Arc::clone(&sink),
                Arc::clone(&ids),
                settings.clone(),
                input.clone(),
            ));
        }

        let reports = join_workers("loader", pool).await?;
        let total = reports.into_iter().fold(LoadReport::default(), LoadReport::merge);
        Ok::<_, IngestError>(total)
    })
}

async fn loader_worker(
    n: usize,
    sink: Arc<dyn Sink>,
    ids: Arc<FileIdGenerator>,
    settings: LoaderSettings,
    input: SharedReceiver<ScoredFile>,
) -> Result<LoadReport, IngestError> {
    info!("Sink loader #{} starts", n);
    let mut session = sink.open_session().await?;

    let mut report = LoadReport::default();
    let mut outcome = Ok(());
    while let Some(scored) = next_item(&input).await {
        match persist_file(
            session.as_mut(),
            &ids,
            &settings.system_tag,
            &scored,
            settings.line_batch_size,
        )
        .await
        {
            Ok(file) => report = report.merge(file),
            Err(err) => {
                outcome = Err(err);
                break;
            }
        }
    }

    // Release the session even when a write failed.
    let closed = session.close().await;
    outcome?;
    closed?;

    info!(
        "Sink loader #{} ends: persisted {} files, {} lines",
        n, report.files, report.lines
    );
    Ok(report)
}
