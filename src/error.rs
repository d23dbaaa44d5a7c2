/*!
 * Error types for Hydrant
 */

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HydrantError>;

/// Errors that can escape a library-level call boundary.
///
/// Transient per-operation failures inside the pool and batch machinery
/// (a dead connection, a failed COPY chunk, a recovery attempt) are not
/// represented here — they are recorded into the connection's state
/// machine and the stats ledger directly, matching the rule that the
/// core never aborts the process on a batch failure. This enum only
/// covers the conditions that are fatal to the process: configuration,
/// initialization, and I/O opening the input source.
#[derive(Error, Debug)]
pub enum HydrantError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to open input file {path}: {source}")]
    InputOpen { path: PathBuf, source: io::Error },

    #[error("no healthy connections available at startup")]
    NoHealthyConnections,

    #[error("failed to allocate batch buffer of {requested} bytes")]
    BatchAllocation { requested: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HydrantError {
    /// Category used for event-sink classification and exit-code mapping.
    pub fn category(&self) -> ErrorCategory {
        match self {
            HydrantError::Config(_) => ErrorCategory::Configuration,
            HydrantError::InputOpen { .. } => ErrorCategory::IoError,
            HydrantError::NoHealthyConnections => ErrorCategory::Startup,
            HydrantError::BatchAllocation { .. } => ErrorCategory::Resource,
            HydrantError::Io(_) => ErrorCategory::IoError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    IoError,
    Startup,
    Resource,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::IoError => write!(f, "io"),
            ErrorCategory::Startup => write!(f, "startup"),
            ErrorCategory::Resource => write!(f, "resource"),
        }
    }
}
