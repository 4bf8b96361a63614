//! # Log Harvest
//!
//! Incremental ingestion of log files into an analytical store.
//!
//! A run walks a directory tree, reads every allow-listed file modified since
//! the system's watermark, keeps the files that carry at least one structured
//! `sbacli` log entry, and persists each kept file as one metadata row plus one
//! row per line. The watermark is the newest stored modification time for the
//! system; rows inside the capture window are cleared before re-ingesting it,
//! so repeated runs over the same window do not duplicate data.
//!
//! ## Architecture
//!
//! ```text
//!            watermark query / window cleanup
//!         ┌──────────────────────────────────────────┐
//!         ▼                                          │
//! ┌─────────┐   ┌────────┐   ┌─────────┐   ┌────────┐   ┌──────────┐
//! │ Scanner │──▶│ Scorer │──▶│ Decider │──▶│ Loader │──▶│   Sink   │
//! │ walkdir │   │ regex  │   │ filter  │   │ batches│   │ SQLite   │
//! └─────────┘   └────────┘   └─────────┘   └────────┘   └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | Tracing subscriber setup |
//! | [`error`] | Fatal error taxonomy |
//! | [`models`] | Core data types |
//! | [`scanner`] | Directory walk and candidate filter |
//! | [`scorer`] | Signal counting |
//! | [`decider`] | Keep/drop filter |
//! | [`loader`] | Id generation and batched persistence |
//! | [`pipeline`] | Stage wiring and run report |
//! | [`cdc`] | Watermark derivation and window cleanup |
//! | [`sink`] | Store abstraction (SQLite, in-memory) |
//! | [`db`] | Database connection |
//! | [`ingest`] | `run`, `watermark` and `cleanup` commands |
//! | [`migrate`] | `init` command |
//! | [`stats`] | `stats` command |

pub mod cdc;
pub mod config;
pub mod db;
pub mod decider;
pub mod error;
pub mod ingest;
pub mod loader;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod scanner;
pub mod scorer;
pub mod sink;
pub mod stats;
