//! Store statistics.
//!
//! Summarizes what has been captured so far: file and line counts and the
//! newest stored modification time per system tag. The newest time is the
//! input to the next run's watermark, so `log-harvest stats` doubles as a
//! check that CDC is advancing.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

/// Per-system breakdown of captured rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemStats {
    pub system_tag: String,
    pub files: i64,
    pub lines: i64,
    /// Newest stored `modified_at`, in Unix microseconds.
    pub last_modified: Option<i64>,
}

async fn is_initialized(pool: &SqlitePool) -> Result<bool> {
    let tables: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('log_files', 'log_lines')",
    )
    .fetch_one(pool)
    .await?;
    Ok(tables == 2)
}

/// Counts per system, optionally restricted to one tag. Empty when the
/// relations have not been created yet.
pub async fn collect_stats(
    pool: &SqlitePool,
    system_tag: Option<&str>,
) -> Result<Vec<SystemStats>> {
    if !is_initialized(pool).await? {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        r#"
        SELECT
            f.sys AS sys,
            COUNT(DISTINCT f.id) AS file_count,
            COUNT(l.file_id) AS line_count,
            MAX(f.modified_at) AS last_modified
        FROM log_files f
        LEFT JOIN log_lines l ON l.file_id = f.id
        WHERE ?1 IS NULL OR f.sys = ?1
        GROUP BY f.sys
        ORDER BY file_count DESC, f.sys
        "#,
    )
    .bind(system_tag)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| SystemStats {
            system_tag: row.get("sys"),
            files: row.get("file_count"),
            lines: row.get("line_count"),
            last_modified: row.get("last_modified"),
        })
        .collect())
}

/// The `stats` command.
pub async fn run_stats(config: &Config, system_tag: Option<&str>) -> Result<()> {
    let pool = db::connect(config).await?;
    let initialized = is_initialized(&pool).await;
    let stats = collect_stats(&pool, system_tag).await;
    pool.close().await;
    let (initialized, stats) = (initialized?, stats?);

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Log Harvest - Store Stats");
    println!("=========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));

    if !initialized {
        println!();
        println!("  Not initialized. Run `log-harvest init` first.");
        println!();
        return Ok(());
    }

    let total_files: i64 = stats.iter().map(|s| s.files).sum();
    let total_lines: i64 = stats.iter().map(|s| s.lines).sum();
    println!();
    println!("  Files:       {}", total_files);
    println!("  Lines:       {}", total_lines);

    if !stats.is_empty() {
        println!();
        println!("  By system:");
        println!(
            "  {:<24} {:>8} {:>12}   {}",
            "SYSTEM", "FILES", "LINES", "LAST MODIFIED"
        );
        println!("  {}", "-".repeat(72));

        for s in &stats {
            let modified = match s.last_modified {
                Some(micros) => format_micros_relative(micros),
                None => "never".to_string(),
            };
            println!(
                "  {:<24} {:>8} {:>12}   {}",
                s.system_tag, s.files, s.lines, modified
            );
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format Unix microseconds relative to now (e.g. "3 hours ago").
fn format_micros_relative(micros: i64) -> String {
    let Some(at) = DateTime::<Utc>::from_timestamp_micros(micros) else {
        return micros.to_string();
    };
    let delta = (Utc::now() - at).num_seconds();

    if delta < 0 {
        return format_iso(at);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_iso(at)
    }
}

fn format_iso(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileRecord, LineRecord};
    use crate::sink::sqlite::SqliteSink;
    use crate::sink::{provision, Sink};
    use chrono::TimeZone;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn old_instants_print_as_dates() {
        let micros = Utc
            .with_ymd_and_hms(2018, 2, 28, 15, 51, 0)
            .unwrap()
            .timestamp_micros();
        assert_eq!(format_micros_relative(micros), "2018-02-28 15:51");
    }

    #[tokio::test]
    async fn empty_before_init() {
        let pool = memory_pool().await;
        assert!(collect_stats(&pool, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn counts_files_and_lines_per_system() {
        let pool = memory_pool().await;
        let sink = SqliteSink::new(pool.clone());
        provision(&sink).await.unwrap();

        let mut session = sink.open_session().await.unwrap();
        for (id, sys) in [(1, "web01"), (2, "web01"), (3, "db02")] {
            session
                .insert_files(&[FileRecord {
                    id,
                    system_tag: sys.to_string(),
                    path: format!("/logs/{}.log", id),
                    modified_at: DateTime::from_timestamp(id * 1000, 0).unwrap(),
                    size_bytes: 4,
                }])
                .await
                .unwrap();
        }
        let lines: Vec<LineRecord> = (0..4)
            .map(|n| LineRecord {
                file_id: 2,
                line_number: n,
                text: "x".into(),
            })
            .collect();
        session.insert_lines(&lines).await.unwrap();
        session.close().await.unwrap();

        let all = collect_stats(&pool, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].system_tag, "web01");
        assert_eq!(all[0].files, 2);
        assert_eq!(all[0].lines, 4);
        assert_eq!(all[0].last_modified, Some(2_000_000_000));

        let one = collect_stats(&pool, Some("db02")).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].lines, 0);
    }
}
