//! # Log Harvest CLI (`log-harvest`)
//!
//! Scans a directory tree for log files, keeps the ones carrying structured
//! `sbacli` entries, and loads them line by line into the store. Re-runs pick
//! up from the newest stored modification time of the system.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `log-harvest init` | Create the store relations |
//! | `log-harvest run --sys <tag> --dir <root>` | Run one CDC capture |
//! | `log-harvest watermark --sys <tag>` | Show the stored max and next capture start |
//! | `log-harvest cleanup --sys <tag> --from <when>` | Delete captured rows from an instant on |
//! | `log-harvest stats` | File and line counts per system |
//!
//! ## Examples
//!
//! ```bash
//! log-harvest init
//! log-harvest run --sys web01 --dir /var/log
//! log-harvest run --sys web01 --dir /var/log --since 2018-02-28 --json
//! log-harvest cleanup --sys web01 --from 2018-02-27
//! ```

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use log_harvest::ingest::{self, RunOptions};
use log_harvest::{cdc, config, logging, migrate, stats};

/// Log Harvest: incremental log-file ingestion with CDC watermarks.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means built-in defaults.
#[derive(Parser)]
#[command(
    name = "log-harvest",
    about = "Incremental log-file ingestion into an analytical store",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/log-harvest.toml")]
    config: PathBuf,

    /// Debug-level diagnostics on stderr (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the `log_files` and `log_lines` relations.
    ///
    /// Idempotent: existing relations are reported and left alone.
    Init,

    /// Capture changed log files of one system.
    ///
    /// Derives the capture start from the newest stored modification time,
    /// clears rows inside the capture window, then scans, scores and loads.
    Run {
        /// System tag, typically the server name.
        #[arg(long = "sys", value_parser = non_empty)]
        system_tag: String,

        /// Start directory for the log scan.
        #[arg(long, value_parser = non_empty)]
        dir: String,

        /// Keep rows already stored inside the capture window.
        #[arg(long)]
        no_cleanup: bool,

        /// Capture files modified at or after this instant instead of the
        /// derived watermark (RFC 3339 or YYYY-MM-DD).
        #[arg(long, value_parser = parse_when)]
        since: Option<DateTime<Utc>>,

        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the stored max and the capture start the next run would use.
    Watermark {
        #[arg(long = "sys", value_parser = non_empty)]
        system_tag: String,
    },

    /// Delete rows of a system modified at or after an instant.
    Cleanup {
        #[arg(long = "sys", value_parser = non_empty)]
        system_tag: String,

        /// RFC 3339 instant or YYYY-MM-DD.
        #[arg(long, value_parser = parse_when)]
        from: DateTime<Utc>,
    },

    /// Show file and line counts per system.
    Stats {
        /// Restrict the report to one system tag.
        #[arg(long = "sys")]
        system_tag: Option<String>,
    },
}

fn non_empty(s: &str) -> Result<String, String> {
    if s.trim().is_empty() {
        Err("value must not be empty".to_string())
    } else {
        Ok(s.to_string())
    }
}

fn parse_when(s: &str) -> Result<DateTime<Utc>, String> {
    cdc::parse_instant(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let cfg = config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_init(&cfg).await?;
        }
        Commands::Run {
            system_tag,
            dir,
            no_cleanup,
            since,
            json,
        } => {
            let options = RunOptions {
                system_tag,
                root: PathBuf::from(dir),
                cleanup: !no_cleanup,
                since,
            };
            ingest::run_ingest(&cfg, &options, json).await?;
        }
        Commands::Watermark { system_tag } => {
            ingest::run_watermark(&cfg, &system_tag).await?;
        }
        Commands::Cleanup { system_tag, from } => {
            ingest::run_cleanup(&cfg, &system_tag, from).await?;
        }
        Commands::Stats { system_tag } => {
            stats::run_stats(&cfg, system_tag.as_deref()).await?;
        }
    }

    Ok(())
}
