//! Error types for pgfan

use thiserror::Error;

/// Result type alias for pgfan operations
pub type Result<T> = std::result::Result<T, PgfanError>;

/// Main error type for pgfan
#[derive(Error, Debug)]
pub enum PgfanError {
    #[error("Invalid connection descriptor '{descriptor}': {reason}")]
    InvalidDescriptor { descriptor: String, reason: String },
}

impl PgfanError {
    /// Create an invalid descriptor error
    ///
    /// The descriptor is stored redacted when it parses as a URL, so passwords
    /// never end up in error messages.
    pub fn invalid_descriptor(descriptor: &str, reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            descriptor: crate::types::redact(descriptor),
            reason: reason.into(),
        }
    }
}
