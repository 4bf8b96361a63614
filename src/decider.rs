//! Decider stage: keep a scored file iff it carries at least one signal.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::info;

use crate::error::IngestError;
use crate::models::ScoredFile;
use crate::pipeline::{join_workers, next_item, share, SharedReceiver, StageHandle};

pub fn decide(scored: &ScoredFile) -> bool {
    scored.signal_count > 0
}

/// Counters reported by the decider pool. `kept + dropped == received`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecideReport {
    pub received: u64,
    pub kept: u64,
    pub dropped: u64,
}

impl DecideReport {
    fn merge(self, other: DecideReport) -> DecideReport {
        DecideReport {
            received: self.received + other.received,
            kept: self.kept + other.kept,
            dropped: self.dropped + other.dropped,
        }
    }
}

/// Start `workers` deciders reading from `input`.
pub fn spawn_deciders(
    workers: usize,
    input: mpsc::Receiver<ScoredFile>,
    capacity: usize,
) -> StageHandle<ScoredFile, DecideReport> {
    let (tx, rx) = mpsc::channel(capacity);
    let input = share(input);

    let mut pool = JoinSet::new();
    for n in 1..=workers {
        pool.spawn(decider_worker(n, input.clone(), tx.clone()));
    }
    drop(tx);

    let completion = tokio::spawn(async move {
        let reports = join_workers("decider", pool).await?;
        let total = reports.into_iter().fold(DecideReport::default(), DecideReport::merge);
        Ok::<_, IngestError>(total)
    });

    StageHandle {
        output: rx,
        completion,
    }
}

async fn decider_worker(
    n: usize,
    input: SharedReceiver<ScoredFile>,
    output: mpsc::Sender<ScoredFile>,
) -> Result<DecideReport, IngestError> {
    info!("Decision maker #{} starts", n);
    let mut report = DecideReport::default();

    while let Some(scored) = next_item(&input).await {
        report.received += 1;
        if decide(&scored) {
            if output.send(scored).await.is_err() {
                break;
            }
            report.kept += 1;
        } else {
            report.dropped += 1;
        }
    }

    info!(
        "Decision maker #{} ends: processed {} results, {} positive",
        n, report.received, report.kept
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn scored(name: &str, signal_count: usize) -> ScoredFile {
        ScoredFile {
            file_path: PathBuf::from(name),
            content: String::new(),
            modified_at: Utc::now(),
            size_bytes: 0,
            signal_count,
        }
    }

    #[test]
    fn keeps_only_positive_counts() {
        assert!(!decide(&scored("a.log", 0)));
        assert!(decide(&scored("b.log", 1)));
        assert!(decide(&scored("c.log", 40)));
    }

    #[tokio::test]
    async fn totals_balance_across_workers() {
        let (tx, rx) = mpsc::channel(16);
        let mut stage = spawn_deciders(3, rx, 4);

        tokio::spawn(async move {
            for i in 0..50 {
                tx.send(scored(&format!("{}.log", i), i % 3)).await.unwrap();
            }
        });

        let mut kept = Vec::new();
        while let Some(f) = stage.output.recv().await {
            kept.push(f);
        }
        let report = stage.completion.await.unwrap().unwrap();

        assert_eq!(report.received, 50);
        assert_eq!(report.kept + report.dropped, report.received);
        assert_eq!(report.kept as usize, kept.len());
        assert!(kept.iter().all(|f| f.signal_count > 0));
        // i % 3 == 0 for 0, 3, ..., 48
        assert_eq!(report.dropped, 17);
    }
}
