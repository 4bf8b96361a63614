//! Error taxonomy for the ingestion pipeline.
//!
//! Every variant here is fatal for the run that raised it. Recoverable
//! conditions (a directory or file the process may not read) never become an
//! [`IngestError`]; the stage that hits them logs a warning, bumps a counter,
//! and drops that unit of work.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A fatal pipeline failure.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A directory could not be listed for a reason other than permissions.
    #[error("failed to traverse {}: {source}", path.display())]
    Traversal {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A candidate file could not be read or stat'ed.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A destination relation could not be checked or created.
    #[error("failed to provision relation '{relation}': {message}")]
    Provisioning { relation: String, message: String },

    /// A row or batch insert was rejected by the sink.
    #[error("failed to persist into '{relation}': {message}")]
    Persistence { relation: String, message: String },

    /// The stored watermark could not be read.
    #[error("failed to query watermark for system '{system}': {message}")]
    WatermarkQuery { system: String, message: String },

    /// The capture-window delete failed.
    #[error("failed to clear capture window for system '{system}': {message}")]
    Cleanup { system: String, message: String },

    /// A worker task panicked or was cancelled before finishing.
    #[error("{stage} worker did not finish: {message}")]
    WorkerPanicked { stage: &'static str, message: String },
}

impl IngestError {
    pub(crate) fn persistence(relation: &str, err: impl std::fmt::Display) -> Self {
        IngestError::Persistence {
            relation: relation.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn provisioning(relation: &str, err: impl std::fmt::Display) -> Self {
        IngestError::Provisioning {
            relation: relation.to_string(),
            message: err.to_string(),
        }
    }
}

/// True when an I/O failure is a permission problem the pipeline recovers from.
pub fn is_permission_denied(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::PermissionDenied
}
