//! Change-data-capture watermark protocol.
//!
//! Before a run, the sink is asked for the newest `modified_at` it holds for
//! the system. The capture start is derived from it (or from the configured
//! epoch when nothing is stored), and files modified at or after that instant
//! are scanned. Rows already stored inside the capture window are deleted
//! before re-ingesting it, so repeated runs over an unchanged tree converge on
//! the same rows instead of duplicating them.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::info;

use crate::config::CdcConfig;
use crate::error::IngestError;
use crate::models::Watermark;
use crate::sink::{RangeDeletion, Sink};

/// Capture start for a stored maximum.
///
/// With `align_to_day`, the stored max is truncated to midnight UTC; then
/// `lookback_days` whole days are subtracted. No stored rows means the epoch.
///
/// Midnight is taken in UTC, the zone of the stored micros, not the host's
/// local zone. A host east or west of UTC therefore re-captures up to a few
/// hours more or less than a local-midnight boundary would.
///
/// Fails when the lookback moves the start outside the representable range.
pub fn capture_start(stored_max: Option<DateTime<Utc>>, cfg: &CdcConfig) -> Result<DateTime<Utc>> {
    let Some(max) = stored_max else {
        return cfg.epoch();
    };

    let base = if cfg.align_to_day {
        max.date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|midnight| midnight.and_utc())
            .unwrap_or(max)
    } else {
        max
    };

    Duration::try_days(i64::from(cfg.lookback_days))
        .and_then(|lookback| base.checked_sub_signed(lookback))
        .with_context(|| {
            format!(
                "cdc.lookback_days = {} steps back from {} past the earliest representable instant",
                cfg.lookback_days, base
            )
        })
}

/// Query the sink and derive this run's watermark for `system_tag`.
pub async fn derive_watermark(
    sink: &dyn Sink,
    system_tag: &str,
    cfg: &CdcConfig,
) -> Result<Watermark> {
    let stored_max = sink.query_max_modified_time(system_tag).await?;
    let capture_start = capture_start(stored_max, cfg)?;

    match stored_max {
        Some(max) => info!(
            "Max modified_at for {} is {}, capture starts at {}",
            system_tag, max, capture_start
        ),
        None => info!(
            "No rows stored for {}, capture starts at epoch {}",
            system_tag, capture_start
        ),
    }

    Ok(Watermark {
        stored_max,
        capture_start,
    })
}

/// Clear rows of `system_tag` modified at or after `from`, lines first.
pub async fn prepare_window(
    sink: &dyn Sink,
    system_tag: &str,
    from: DateTime<Utc>,
) -> Result<RangeDeletion, IngestError> {
    info!("Clearing rows of {} modified at or after {}", system_tag, from);
    let deleted = sink.delete_rows_in_range(system_tag, from).await?;
    info!(
        "Capture window cleared for {}: {} files, {} lines removed",
        system_tag, deleted.files, deleted.lines
    );
    Ok(deleted)
}

/// Parse an RFC 3339 instant or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_instant(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("'{}' is neither RFC 3339 nor YYYY-MM-DD", s))?;
    date.and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .with_context(|| format!("'{}' has no midnight", s))
}
