//! Scorer stage: read each candidate file and count signal lines.
//!
//! The signal is a structured log-line prefix at the start of a line:
//! a `YYYY-MM-DD HH:MM:SS,mmm` timestamp, a tab, the `sbacli` tag, and
//! another tab. Matching is case-sensitive, multi-line (`^` anchors at every
//! line start), uses ASCII digits only, and counts non-overlapping matches.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::{is_permission_denied, IngestError};
use crate::models::ScoredFile;
use crate::pipeline::{finish, join_workers, next_item, share, SharedReceiver, StageHandle};
use crate::scanner::has_log_extension;

/// Source of the signal pattern.
pub const SIGNAL_PATTERN: &str =
    r"(?m)^[0-9]{4}-[0-9]{2}-[0-9]{2} [0-9]{2}:[0-9]{2}:[0-9]{2},[0-9]{3}\tsbacli\t";

static SIGNAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(SIGNAL_PATTERN).expect("signal pattern is a valid regex"));

/// Log a progress line every this many files per worker.
const PROGRESS_EVERY: u64 = 1000;

/// Number of non-overlapping signal matches in `content`.
pub fn count_signals(content: &str) -> usize {
    SIGNAL.find_iter(content).count()
}

/// Read and score one file.
///
/// Returns `Ok(None)` when the file may not be read (permission denied);
/// every other read or stat failure is fatal.
pub fn score_file(path: &Path) -> Result<Option<ScoredFile>, IngestError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if is_permission_denied(&err) => {
            warn!("Can't read {} - access denied: {}", path.display(), err);
            return Ok(None);
        }
        Err(source) => {
            return Err(IngestError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let stat = std::fs::metadata(path).and_then(|m| Ok((m.len(), m.modified()?)));
    let (size, modified) = match stat {
        Ok(found) => found,
        Err(err) if is_permission_denied(&err) => {
            warn!("Can't stat {} - access denied: {}", path.display(), err);
            return Ok(None);
        }
        Err(source) => {
            return Err(IngestError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let content = String::from_utf8_lossy(&bytes).into_owned();
    let signal_count = count_signals(&content);

    Ok(Some(ScoredFile {
        file_path: path.to_path_buf(),
        content,
        modified_at: DateTime::<Utc>::from(modified),
        size_bytes: size as i64,
        signal_count,
    }))
}

/// Counters reported by the scorer pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScoreReport {
    /// Files read and forwarded (signal count may be zero).
    pub scored: u64,
    /// Paths whose extension is not on the allow-list.
    pub skipped: u64,
    /// Files that could not be read because access was denied.
    pub denied: u64,
}

impl ScoreReport {
    fn seen(&self) -> u64 {
        self.scored + self.skipped + self.denied
    }

    fn merge(self, other: ScoreReport) -> ScoreReport {
        ScoreReport {
            scored: self.scored + other.scored,
            skipped: self.skipped + other.skipped,
            denied: self.denied + other.denied,
        }
    }
}

/// Start `workers` scorers reading from `input`.
pub fn spawn_scorers(
    workers: usize,
    input: mpsc::Receiver<PathBuf>,
    capacity: usize,
) -> StageHandle<ScoredFile, ScoreReport> {
    let (tx, rx) = mpsc::channel(capacity);
    let input = share(input);

    let mut pool = JoinSet::new();
    for n in 1..=workers {
        pool.spawn(scorer_worker(n, input.clone(), tx.clone()));
    }
    // Only the workers hold senders now; the queue closes when the last one ends.
    drop(tx);

    let completion = tokio::spawn(async move {
        let reports = join_workers("scorer", pool).await?;
        let total = reports.into_iter().fold(ScoreReport::default(), ScoreReport::merge);
        Ok::<_, IngestError>(total)
    });

    StageHandle {
        output: rx,
        completion,
    }
}

async fn scorer_worker(
    n: usize,
    input: SharedReceiver<PathBuf>,
    output: mpsc::Sender<ScoredFile>,
) -> Result<ScoreReport, IngestError> {
    info!("Scorer #{} starts", n);
    let mut report = ScoreReport::default();

    while let Some(path) = next_item(&input).await {
        if !has_log_extension(&path) {
            report.skipped += 1;
        } else {
            let read = tokio::task::spawn_blocking(move || score_file(&path));
            match finish("scorer", read).await? {
                Some(scored) => {
                    if output.send(scored).await.is_err() {
                        break;
                    }
                    report.scored += 1;
                }
                None => report.denied += 1,
            }
        }

        if report.seen() % PROGRESS_EVERY == 0 {
            info!(
                "Scorer #{} went through {} files: processed {}, skipped {}, denied {}",
                n,
                report.seen(),
                report.scored,
                report.skipped,
                report.denied
            );
        }
    }

    info!(
        "Scorer #{} ends: processed {} files, skipped {}, denied {}",
        n, report.scored, report.skipped, report.denied
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SIGNAL_LINE: &str = "2018-02-28 15:51:07,123\tsbacli\tERROR connection reset";

    #[test]
    fn counts_matches_at_line_starts_only() {
        let content = format!(
            "{}\nplain line\n  {}\n{}\n",
            SIGNAL_LINE, SIGNAL_LINE, SIGNAL_LINE
        );
        assert_eq!(count_signals(&content), 2);
    }

    #[test]
    fn tag_is_case_sensitive() {
        assert_eq!(count_signals("2018-02-28 15:51:07,123\tSBACLI\tboom"), 0);
    }

    #[test]
    fn requires_exact_shape() {
        // missing milliseconds, space instead of tab, non-ASCII digits
        assert_eq!(count_signals("2018-02-28 15:51:07\tsbacli\tx"), 0);
        assert_eq!(count_signals("2018-02-28 15:51:07,123 sbacli\tx"), 0);
        assert_eq!(count_signals("٢٠١٨-02-28 15:51:07,123\tsbacli\tx"), 0);
    }

    #[test]
    fn zero_matches_still_scores() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quiet.log");
        fs::write(&path, "nothing to see\nhere").unwrap();

        let scored = score_file(&path).unwrap().unwrap();
        assert_eq!(scored.signal_count, 0);
        assert_eq!(scored.file_path, path);
        assert_eq!(scored.size_bytes, 19);
    }

    #[test]
    fn scores_file_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("noisy.log");
        fs::write(&path, format!("{}\n{}\nend", SIGNAL_LINE, SIGNAL_LINE)).unwrap();

        let scored = score_file(&path).unwrap().unwrap();
        assert_eq!(scored.signal_count, 2);
        assert!(scored.content.ends_with("end"));
    }

    #[test]
    fn missing_file_is_fatal() {
        let err = score_file(Path::new("/no/such/file.log")).unwrap_err();
        assert!(matches!(err, IngestError::Read { .. }));
    }

    #[tokio::test]
    async fn pool_scores_every_path_and_closes_once() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel(16);
        for i in 0..10 {
            let path = dir.path().join(format!("f{}.log", i));
            fs::write(&path, SIGNAL_LINE).unwrap();
            tx.send(path).await.unwrap();
        }
        tx.send(dir.path().join("image.png")).await.unwrap();
        drop(tx);

        let mut stage = spawn_scorers(3, rx, 4);
        let mut received = 0;
        while let Some(scored) = stage.output.recv().await {
            assert_eq!(scored.signal_count, 1);
            received += 1;
        }
        let report = stage.completion.await.unwrap().unwrap();
        assert_eq!(received, 10);
        assert_eq!(report.scored, 10);
        assert_eq!(report.skipped, 1);
    }
}
