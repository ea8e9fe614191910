//! Error types for pgfan CLI
//!
//! Only run-level failures live here: bad parameters detected before any
//! connection is attempted, and failures to produce the archive itself.
//! Per-endpoint failures never become a `CliError`; they end up in that
//! endpoint's terminal state instead.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

/// Exit code for a run stopped by the user
pub const EXIT_CANCELLED: i32 = 130;

/// Exit code for every other fatal error
pub const EXIT_FAILURE: i32 = 1;

#[derive(Error, Debug)]
pub enum CliError {
    /// An endpoint descriptor could not be parsed
    #[error("{0}. Expected 'postgres://[user[:pass]@]host[:port]/database[?params]'.")]
    InvalidEndpoint(#[from] pgfan_common::PgfanError),

    /// Two endpoints map to the same archive entry under the reject policy
    #[error("Endpoints '{first}' and '{second}' would both be archived as '{entry}'. Use --on-collision suffix to keep both.")]
    EntryCollision {
        entry: String,
        first: String,
        second: String,
    },

    /// Required parameter missing or out of range
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Configuration from the environment is invalid
    #[error("Configuration error: {0}. Check your PGFAN_* environment variables.")]
    Config(String),

    /// The output archive could not be created
    #[error("Could not create archive '{}': {source}. Check that the directory exists and is writable.", path.display())]
    ArchiveCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The archive could not be finished or moved into place
    #[error("Could not finalize archive '{}': {reason}", path.display())]
    ArchiveFinalize { path: PathBuf, reason: String },

    /// The run was cancelled before the archive was written
    #[error("Cancelled; no archive was written")]
    Cancelled,
}

impl CliError {
    pub fn invalid_parameters(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn archive_create(path: &Path, source: std::io::Error) -> Self {
        Self::ArchiveCreate {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn archive_finalize(path: &Path, reason: impl ToString) -> Self {
        Self::ArchiveFinalize {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Cancelled => EXIT_CANCELLED,
            _ => EXIT_FAILURE,
        }
    }
}
