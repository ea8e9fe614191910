//! Query engine seam
//!
//! A [`ConnectionTask`](crate::task::ConnectionTask) only ever talks to the
//! database through these traits: one [`Connector`] shared by every task, one
//! [`Session`] per endpoint. [`postgres::PgConnector`] is the live
//! implementation; tests drive the same lifecycle with scripted sessions.

pub mod postgres;
pub mod scripted;

use crate::value::Cell;
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub use postgres::PgConnector;

/// Failure inside a single endpoint's session
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("timed out after {0} seconds")]
    Timeout(u64),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Stream of decoded rows, one `Vec<Cell>` per row
pub type RowStream<'a> = BoxStream<'a, Result<Vec<Cell>, EngineError>>;

/// A submitted query: its column names and the rows still to be read
pub struct ResultSet<'a> {
    pub columns: Vec<String>,
    pub rows: RowStream<'a>,
}

/// Opens sessions against endpoint descriptors
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    /// Establish a session. Callers bound this with their own timeout.
    async fn connect(&self, descriptor: &str) -> Result<Self::Session, EngineError>;
}

/// One live connection, exclusively owned by its task
#[async_trait]
pub trait Session: Send + 'static {
    /// Submit `sql` and return its result set.
    ///
    /// An error here means the query was never accepted; errors after this
    /// point arrive through the row stream.
    async fn execute<'a>(&'a mut self, sql: &'a str) -> Result<ResultSet<'a>, EngineError>;

    /// Close the connection gracefully
    async fn close(self) -> Result<(), EngineError>;
}
