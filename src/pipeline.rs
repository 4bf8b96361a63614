//! Staged concurrent pipeline: scan → score → decide → load.
//!
//! Each stage is a pool of tokio tasks reading from the previous stage's
//! bounded queue and writing to its own. A stage's output queue closes when
//! its last worker drops its sender, so downstream sees a single end-of-input
//! after every in-flight item has been delivered.
//!
//! ```text
//! ┌─────────┐ paths ┌─────────┐ scored ┌─────────┐ kept ┌────────┐
//! │ Scanner │──────▶│ Scorer  │───────▶│ Decider │─────▶│ Loader │──▶ Sink
//! │ (1)     │  100  │ (N)     │  100   │ (M)     │ 100  │ (K)    │
//! └─────────┘       └─────────┘        └─────────┘      └────────┘
//! ```
//!
//! The first fatal error from any stage aborts every other stage and is
//! returned from [`Pipeline::run`]. Workers that find their downstream queue
//! gone stop quietly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use globset::GlobSet;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::info;

use crate::config::PipelineConfig;
use crate::decider::{self, DecideReport};
use crate::error::IngestError;
use crate::loader::{self, FileIdGenerator, LoadReport, LoaderSettings};
use crate::scanner::{self, ScanReport};
use crate::scorer::{self, ScoreReport};
use crate::sink::Sink;

/// A running stage: its bounded output queue plus a completion future that
/// resolves once every worker of the stage has finished.
pub struct StageHandle<T, R> {
    pub output: mpsc::Receiver<T>,
    pub completion: JoinHandle<Result<R, IngestError>>,
}

/// Receiver shared by all workers of one stage.
pub(crate) type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

pub(crate) fn share<T>(rx: mpsc::Receiver<T>) -> SharedReceiver<T> {
    Arc::new(Mutex::new(rx))
}

/// Take the next item; `None` once the queue is closed and drained.
pub(crate) async fn next_item<T>(rx: &SharedReceiver<T>) -> Option<T> {
    // Lock only long enough to pull one message.
    let mut guard = rx.lock().await;
    guard.recv().await
}

/// Await a task, turning a panic or cancellation into an [`IngestError`].
pub(crate) async fn finish<R>(
    stage: &'static str,
    handle: JoinHandle<Result<R, IngestError>>,
) -> Result<R, IngestError> {
    handle.await.map_err(|e| IngestError::WorkerPanicked {
        stage,
        message: e.to_string(),
    })?
}

/// Wait for every worker of a stage. On the first failure the remaining
/// workers are aborted and that failure is returned.
pub(crate) async fn join_workers<R: Send + 'static>(
    stage: &'static str,
    mut workers: JoinSet<Result<R, IngestError>>,
) -> Result<Vec<R>, IngestError> {
    let mut reports = Vec::with_capacity(workers.len());
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(report)) => reports.push(report),
            Ok(Err(err)) => {
                workers.abort_all();
                return Err(err);
            }
            Err(join_err) => {
                workers.abort_all();
                return Err(IngestError::WorkerPanicked {
                    stage,
                    message: join_err.to_string(),
                });
            }
        }
    }
    Ok(reports)
}

/// Counters from every stage of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub system_tag: String,
    pub cutoff: DateTime<Utc>,
    pub scan: ScanReport,
    pub score: ScoreReport,
    pub decide: DecideReport,
    pub load: LoadReport,
    pub elapsed_secs: f64,
}

/// Builder for a [`Pipeline`].
pub struct PipelineBuilder {
    system_tag: String,
    root: PathBuf,
    cutoff: DateTime<Utc>,
    settings: PipelineConfig,
    exclude_globs: Vec<String>,
    ids: Option<Arc<FileIdGenerator>>,
}

impl PipelineBuilder {
    /// Files modified before `cutoff` are not captured. Defaults to the Unix epoch.
    pub fn cutoff(mut self, cutoff: DateTime<Utc>) -> Self {
        self.cutoff = cutoff;
        self
    }

    pub fn settings(mut self, settings: &PipelineConfig) -> Self {
        self.settings = settings.clone();
        self
    }

    pub fn exclude_globs(mut self, globs: &[String]) -> Self {
        self.exclude_globs = globs.to_vec();
        self
    }

    /// Use a specific id generator instead of one keyed on the current time.
    pub fn id_generator(mut self, ids: Arc<FileIdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let excludes = scanner::build_globset(&self.exclude_globs)?;
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(FileIdGenerator::for_run_start(&Local::now())));
        Ok(Pipeline {
            system_tag: self.system_tag,
            root: self.root,
            cutoff: self.cutoff,
            settings: self.settings,
            excludes,
            ids,
        })
    }
}

/// One configured run over one directory tree for one system tag.
pub struct Pipeline {
    system_tag: String,
    root: PathBuf,
    cutoff: DateTime<Utc>,
    settings: PipelineConfig,
    excludes: GlobSet,
    ids: Arc<FileIdGenerator>,
}

impl Pipeline {
    pub fn builder(system_tag: impl Into<String>, root: impl Into<PathBuf>) -> PipelineBuilder {
        PipelineBuilder {
            system_tag: system_tag.into(),
            root: root.into(),
            cutoff: DateTime::<Utc>::UNIX_EPOCH,
            settings: PipelineConfig::default(),
            exclude_globs: Vec::new(),
            ids: None,
        }
    }

    /// Run every stage to completion against `sink`.
    pub async fn run(self, sink: Arc<dyn Sink>) -> Result<RunReport, IngestError> {
        let started = Instant::now();
        let capacity = self.settings.queue_capacity;

        info!(
            "Pipeline starts: sys={}, dir={}, cutoff={}",
            self.system_tag,
            self.root.display(),
            self.cutoff
        );

        let scan = scanner::spawn_scanner(self.root.clone(), self.cutoff, self.excludes, capacity);
        let score = scorer::spawn_scorers(self.settings.scorer_workers, scan.output, capacity);
        let decide = decider::spawn_deciders(self.settings.decider_workers, score.output, capacity);
        let load = loader::spawn_loader(
            sink,
            self.ids,
            LoaderSettings {
                workers: self.settings.loader_workers,
                line_batch_size: self.settings.line_batch_size,
                system_tag: self.system_tag.clone(),
            },
            decide.output,
        );

        let aborts = [
            scan.completion.abort_handle(),
            score.completion.abort_handle(),
            decide.completion.abort_handle(),
            load.abort_handle(),
        ];

        let joined = tokio::try_join!(
            finish("scanner", scan.completion),
            finish("scorer", score.completion),
            finish("decider", decide.completion),
            finish("loader", load),
        );

        let (scan, score, decide, load) = match joined {
            Ok(reports) => reports,
            Err(err) => {
                for handle in &aborts {
                    handle.abort();
                }
                return Err(err);
            }
        };

        let report = RunReport {
            system_tag: self.system_tag,
            cutoff: self.cutoff,
            scan,
            score,
            decide,
            load,
            elapsed_secs: started.elapsed().as_secs_f64(),
        };
        info!(
            "Pipeline ends: {} scanned, {} scored, {} kept, {} files / {} lines persisted",
            report.scan.sent,
            report.score.scored,
            report.decide.kept,
            report.load.files,
            report.load.lines
        );
        Ok(report)
    }
}
