use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by the ingestion core.
///
/// Each variant is scoped to a single volume or a single copied entry; none
/// of them is fatal to the process.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to query volume information for {root}: {reason}")]
    VolumeQuery { root: PathBuf, reason: String },

    #[error("failed to query capacity for {root}: {reason}")]
    CapacityQuery { root: PathBuf, reason: String },

    #[error("failed to create destination directory {path}: {source}")]
    DestinationCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to list source directory {path}: {source}")]
    SourceList {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to copy {path}: {source}")]
    EntryCopy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read ledger {path}: {source}")]
    LedgerRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to append to ledger {path}: {source}")]
    LedgerWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl IngestError {
    pub fn volume_query(root: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::VolumeQuery {
            root: root.into(),
            reason: reason.to_string(),
        }
    }

    pub fn capacity_query(root: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::CapacityQuery {
            root: root.into(),
            reason: reason.to_string(),
        }
    }
}
