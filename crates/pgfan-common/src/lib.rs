//! pgfan Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the pgfan workspace.
//!
//! # Overview
//!
//! - **Error Handling**: Custom error types and result types
//! - **Logging**: Diagnostic log configuration and initialization
//! - **Types**: Endpoint descriptors and their canonical names
//!
//! # Example
//!
//! ```no_run
//! use pgfan_common::{Endpoint, Result};
//!
//! fn describe(descriptor: &str) -> Result<()> {
//!     let endpoint = Endpoint::parse(descriptor)?;
//!     println!("{} -> {}", endpoint.redacted(), endpoint.canonical_name());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{PgfanError, Result};
pub use types::Endpoint;
