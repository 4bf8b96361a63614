//! Command orchestration for `run`, `watermark` and `cleanup`.
//!
//! A run derives the CDC watermark for the system, clears the capture window
//! (unless disabled), then drives the pipeline from that watermark against
//! the SQLite sink and prints a summary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::cdc;
use crate::config::Config;
use crate::db;
use crate::models::Watermark;
use crate::pipeline::{Pipeline, RunReport};
use crate::sink::sqlite::SqliteSink;
use crate::sink::{RangeDeletion, Sink};

/// Arguments of one `run` invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub system_tag: String,
    pub root: PathBuf,
    /// Clear the capture window before loading. Also gated by `cdc.cleanup`.
    pub cleanup: bool,
    /// Capture start override; skips watermark derivation.
    pub since: Option<DateTime<Utc>>,
}

/// Everything one run did, as printed by `run --json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub watermark: Watermark,
    pub cleared: Option<RangeDeletion>,
    pub report: RunReport,
    /// Wall-clock seconds for the whole run, watermark and cleanup included.
    /// `report.elapsed_secs` covers the pipeline alone.
    pub total_elapsed_secs: f64,
}

/// Execute one CDC run against `sink`.
pub async fn ingest(
    config: &Config,
    sink: Arc<dyn Sink>,
    options: &RunOptions,
) -> Result<RunSummary> {
    if options.system_tag.trim().is_empty() || options.root.as_os_str().is_empty() {
        bail!("Both a system tag and a start directory are required");
    }
    let started = Instant::now();

    let watermark = match options.since {
        Some(capture_start) => {
            let stored_max = sink.query_max_modified_time(&options.system_tag).await?;
            info!(
                "Capture start for {} overridden to {}",
                options.system_tag, capture_start
            );
            Watermark {
                stored_max,
                capture_start,
            }
        }
        None => cdc::derive_watermark(sink.as_ref(), &options.system_tag, &config.cdc).await?,
    };

    let cleared = if options.cleanup && config.cdc.cleanup {
        let from = watermark.capture_start;
        Some(cdc::prepare_window(sink.as_ref(), &options.system_tag, from).await?)
    } else {
        info!("Capture window cleanup skipped for {}", options.system_tag);
        None
    };

    let report = Pipeline::builder(options.system_tag.clone(), options.root.clone())
        .cutoff(watermark.capture_start)
        .settings(&config.pipeline)
        .exclude_globs(&config.scanner.exclude_globs)
        .build()?
        .run(sink)
        .await
        .with_context(|| format!("Run for system '{}' failed", options.system_tag))?;

    Ok(RunSummary {
        watermark,
        cleared,
        report,
        total_elapsed_secs: started.elapsed().as_secs_f64(),
    })
}

/// The `run` command.
pub async fn run_ingest(config: &Config, options: &RunOptions, json: bool) -> Result<()> {
    let started = Instant::now();
    info!(
        "Started with sys={}, dir={}",
        options.system_tag,
        options.root.display()
    );

    let pool = db::connect(config).await?;
    let sink = Arc::new(SqliteSink::new(pool.clone()));
    let summary = ingest(config, sink, options).await;
    pool.close().await;
    let mut summary = summary?;
    summary.total_elapsed_secs = started.elapsed().as_secs_f64();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    info!("Execution time: {:.2}s", summary.total_elapsed_secs);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let r = &summary.report;
    println!("run {}", r.system_tag);
    println!("  capture start: {}", summary.watermark.capture_start.to_rfc3339());
    if let Some(cleared) = summary.cleared {
        println!("  cleared: {} files, {} lines", cleared.files, cleared.lines);
    }
    println!(
        "  scanned: {} sent, {} skipped, {} denied",
        r.scan.sent, r.scan.skipped, r.scan.denied
    );
    println!(
        "  scored: {} files, {} skipped, {} denied",
        r.score.scored, r.score.skipped, r.score.denied
    );
    println!("  kept: {} of {}", r.decide.kept, r.decide.received);
    println!(
        "  persisted: {} files, {} lines in {} batches",
        r.load.files, r.load.lines, r.load.batches
    );
    println!(
        "  elapsed: {:.2}s total, {:.2}s pipeline",
        summary.total_elapsed_secs, r.elapsed_secs
    );
    println!("ok");
}

/// The `watermark` command.
pub async fn run_watermark(config: &Config, system_tag: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let sink = SqliteSink::new(pool.clone());
    let watermark = cdc::derive_watermark(&sink, system_tag, &config.cdc).await;
    pool.close().await;
    let watermark = watermark?;

    println!("watermark {}", system_tag);
    match watermark.stored_max {
        Some(max) => println!("  stored max:    {}", max.to_rfc3339()),
        None => println!("  stored max:    none"),
    }
    println!("  capture start: {}", watermark.capture_start.to_rfc3339());
    Ok(())
}

/// The `cleanup` command.
pub async fn run_cleanup(config: &Config, system_tag: &str, from: DateTime<Utc>) -> Result<()> {
    let pool = db::connect(config).await?;
    let sink = SqliteSink::new(pool.clone());
    let deleted = cdc::prepare_window(&sink, system_tag, from).await;
    pool.close().await;
    let deleted = deleted?;

    println!("cleanup {} from {}", system_tag, from.to_rfc3339());
    println!("  files deleted: {}", deleted.files);
    println!("  lines deleted: {}", deleted.lines);
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::memory::{InMemorySink, SinkCall};

    fn options(root: PathBuf) -> RunOptions {
        RunOptions {
            system_tag: "web01".into(),
            root,
            cleanup: true,
            since: None,
        }
    }

    #[tokio::test]
    async fn empty_system_tag_is_rejected() {
        let sink = InMemorySink::new();
        let mut opts = options(PathBuf::from("/tmp"));
        opts.system_tag = String::new();
        assert!(ingest(&Config::default(), Arc::new(sink), &opts).await.is_err());
    }

    #[tokio::test]
    async fn cleanup_runs_before_loading() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = InMemorySink::new();
        let summary = ingest(
            &Config::default(),
            Arc::new(sink.clone()),
            &options(dir.path().to_path_buf()),
        )
        .await
        .unwrap();

        assert_eq!(summary.cleared, Some(RangeDeletion::default()));
        let journal = sink.journal();
        assert_eq!(
            journal[0],
            SinkCall::DeleteRange {
                system_tag: "web01".into()
            }
        );
        assert!(matches!(journal[1], SinkCall::EnsureRelation(_)));
        assert!(summary.total_elapsed_secs >= summary.report.elapsed_secs);
    }

    #[tokio::test]
    async fn cleanup_can_be_disabled() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = InMemorySink::new();
        let mut opts = options(dir.path().to_path_buf());
        opts.cleanup = false;
        let summary = ingest(&Config::default(), Arc::new(sink.clone()), &opts)
            .await
            .unwrap();
        assert!(summary.cleared.is_none());
        assert!(!sink
            .journal()
            .iter()
            .any(|c| matches!(c, SinkCall::DeleteRange { .. })));
    }
}
