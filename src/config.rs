//! TOML configuration.
//!
//! Every section is optional; a missing file falls back to
//! [`Config::default`], which matches the tuning the pipeline was built for
//! (15 scorers, 1 decider, 5 loaders, queues of 100, line batches of 500).

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub cdc: CdcConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/log-harvest.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_scorer_workers")]
    pub scorer_workers: usize,
    #[serde(default = "default_decider_workers")]
    pub decider_workers: usize,
    #[serde(default = "default_loader_workers")]
    pub loader_workers: usize,
    #[serde(default = "default_line_batch_size")]
    pub line_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            scorer_workers: default_scorer_workers(),
            decider_workers: default_decider_workers(),
            loader_workers: default_loader_workers(),
            line_batch_size: default_line_batch_size(),
        }
    }
}

fn default_queue_capacity() -> usize {
    100
}
fn default_scorer_workers() -> usize {
    15
}
fn default_decider_workers() -> usize {
    1
}
fn default_loader_workers() -> usize {
    5
}
fn default_line_batch_size() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ScannerConfig {
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CdcConfig {
    #[serde(default = "default_epoch")]
    pub epoch: String,
    #[serde(default = "default_align_to_day")]
    pub align_to_day: bool,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default = "default_cleanup")]
    pub cleanup: bool,
}

impl Default for CdcConfig {
    fn default() -> Self {
        Self {
            epoch: default_epoch(),
            align_to_day: default_align_to_day(),
            lookback_days: default_lookback_days(),
            cleanup: default_cleanup(),
        }
    }
}

fn default_epoch() -> String {
    "2016-01-01T00:00:00Z".to_string()
}
fn default_align_to_day() -> bool {
    true
}
fn default_lookback_days() -> u32 {
    1
}
fn default_cleanup() -> bool {
    true
}

impl CdcConfig {
    /// The watermark used when the store holds no rows for a system.
    pub fn epoch(&self) -> Result<DateTime<Utc>> {
        let parsed = DateTime::parse_from_rfc3339(&self.epoch)
            .with_context(|| format!("cdc.epoch is not RFC 3339: '{}'", self.epoch))?;
        Ok(parsed.with_timezone(&Utc))
    }
}

/// Loads `path` if it exists, otherwise returns validated defaults.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        let config = Config::default();
        validate(&config)?;
        Ok(config)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let p = &config.pipeline;
    if p.queue_capacity == 0 {
        bail!("pipeline.queue_capacity must be >= 1");
    }
    if p.scorer_workers == 0 || p.decider_workers == 0 || p.loader_workers == 0 {
        bail!("pipeline worker counts must be >= 1");
    }
    if p.line_batch_size == 0 {
        bail!("pipeline.line_batch_size must be >= 1");
    }

    config.cdc.epoch()?;

    for pattern in &config.scanner.exclude_globs {
        globset::Glob::new(pattern)
            .with_context(|| format!("Invalid scanner.exclude_globs entry: '{}'", pattern))?;
    }

    Ok(())
}
