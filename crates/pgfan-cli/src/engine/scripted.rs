//! In-memory engine for tests
//!
//! Each descriptor is mapped to a [`Script`] describing how its session
//! behaves, so the full task / dispatch / archive path can be exercised
//! without a database. Descriptors without a script fail to connect.
//!
//! # Examples
//!
//! ```rust,ignore
//! use pgfan_cli::engine::scripted::{Script, ScriptedConnector};
//! use pgfan_cli::value::Cell;
//!
//! let connector = ScriptedConnector::new()
//!     .endpoint("postgres://u@down/app", Script::connect_error("connection refused"))
//!     .endpoint("postgres://u@up/app", Script::rows(&["n"], vec![vec![Cell::Integer(1)]]));
//! ```

use super::{Connector, EngineError, ResultSet, Session};
use crate::value::Cell;
use async_trait::async_trait;
use futures::{stream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Behaviour of one scripted endpoint
#[derive(Debug, Clone)]
pub enum Script {
    /// `connect` fails with this message
    ConnectError(String),
    /// `connect` never completes
    ConnectHang,
    /// Connects, then the query is refused with this message
    QueryError(String),
    /// Connects and streams rows
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Cell>>,
        /// Yield an error with this message after this many rows
        fail_after: Option<(usize, String)>,
        /// Pause before each row
        row_delay: Duration,
    },
}

impl Script {
    pub fn connect_error(msg: impl Into<String>) -> Self {
        Self::ConnectError(msg.into())
    }

    pub fn query_error(msg: impl Into<String>) -> Self {
        Self::QueryError(msg.into())
    }

    pub fn rows(columns: &[&str], rows: Vec<Vec<Cell>>) -> Self {
        Self::Rows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            fail_after: None,
            row_delay: Duration::ZERO,
        }
    }

    /// `count` rows of `(id, label)` integers and text
    pub fn numbered_rows(count: usize) -> Self {
        let rows = (0..count)
            .map(|i| vec![Cell::Integer(i as i128), Cell::Text(format!("row {}", i))])
            .collect();
        Self::rows(&["id", "label"], rows)
    }

    /// Fail the row stream once `after` rows have been yielded
    pub fn failing_after(mut self, after: usize, msg: impl Into<String>) -> Self {
        if let Self::Rows { fail_after, .. } = &mut self {
            *fail_after = Some((after, msg.into()));
        }
        self
    }

    pub fn with_row_delay(mut self, delay: Duration) -> Self {
        if let Self::Rows { row_delay, .. } = &mut self {
            *row_delay = delay;
        }
        self
    }
}

/// Connector serving [`Script`]s by descriptor
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    scripts: HashMap<String, Script>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(mut self, descriptor: impl Into<String>, script: Script) -> Self {
        self.scripts.insert(descriptor.into(), script);
        self
    }

    /// Sessions currently open
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of sessions that were open at the same time
    pub fn peak_sessions(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Session = ScriptedSession;

    async fn connect(&self, descriptor: &str) -> Result<ScriptedSession, EngineError> {
        let script = match self.scripts.get(descriptor) {
            Some(Script::ConnectError(msg)) => return Err(EngineError::other(msg.clone())),
            Some(Script::ConnectHang) => futures::future::pending().await,
            Some(script) => script.clone(),
            None => return Err(EngineError::other("no route to host")),
        };

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        Ok(ScriptedSession {
            script,
            active: Arc::clone(&self.active),
        })
    }
}

/// Session produced by [`ScriptedConnector`]
pub struct ScriptedSession {
    script: Script,
    active: Arc<AtomicUsize>,
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn execute<'a>(&'a mut self, _sql: &'a str) -> Result<ResultSet<'a>, EngineError> {
        match &self.script {
            Script::QueryError(msg) => Err(EngineError::other(msg.clone())),
            Script::Rows {
                columns,
                rows,
                fail_after,
                row_delay,
            } => {
                let mut items: Vec<Result<Vec<Cell>, EngineError>> = match fail_after {
                    Some((after, _)) => rows.iter().take(*after).cloned().map(Ok).collect(),
                    None => rows.iter().cloned().map(Ok).collect(),
                };
                if let Some((_, msg)) = fail_after {
                    items.push(Err(EngineError::other(msg.clone())));
                }

                let delay = *row_delay;
                let rows = stream::iter(items)
                    .then(move |item| async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        item
                    })
                    .boxed();

                Ok(ResultSet {
                    columns: columns.clone(),
                    rows,
                })
            },
            Script::ConnectError(_) | Script::ConnectHang => {
                Err(EngineError::other("session was never connected"))
            },
        }
    }

    async fn close(self) -> Result<(), EngineError> {
        Ok(())
    }
}
