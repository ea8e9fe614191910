//! Per-endpoint connection lifecycle
//!
//! A [`ConnectionTask`] drives one endpoint from `Init` to a terminal state:
//!
//! ```text
//! Init -> Connecting -> Connected -> QueryStarted -> Fetching -> Complete
//!   \__________\____________\____________\______________\____> Failed(reason)
//! ```
//!
//! The task owns its session and artifact outright. Everything it does is
//! observable from outside only through [`TaskSnapshot`] copies published on a
//! `watch` channel, and its result is handed back as a [`TaskOutcome`] when
//! it finishes. A failure here never reaches any other task.

use crate::artifact::{CompletedArtifact, OutputArtifact};
use crate::engine::{Connector, EngineError, ResultSet, Session};
use crate::plan::Target;
use crate::value;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Rendered rows buffered before each trip to the blocking pool
const WRITE_BATCH_ROWS: usize = 1024;

/// Run artifact file I/O off the async workers
async fn blocking<T, F>(work: F) -> Result<T, TaskFailure>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| TaskFailure::Artifact(std::io::Error::other(e)))?
        .map_err(TaskFailure::Artifact)
}

/// Lifecycle state of one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Init,
    Connecting,
    Connected,
    QueryStarted,
    Fetching,
    Complete,
    Failed(String),
}

impl TaskState {
    /// `Complete` and `Failed` are terminal; nothing follows them
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Complete | TaskState::Failed(_))
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, TaskState::Complete)
    }

    /// Glyph shown by the status display
    pub fn icon(&self) -> &'static str {
        match self {
            TaskState::Init => "🎬",
            TaskState::Connecting | TaskState::Connected => "🔌",
            TaskState::QueryStarted => "🔍",
            TaskState::Fetching => "📝",
            TaskState::Complete => "🏁",
            TaskState::Failed(_) => "💣",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Init => write!(f, "init"),
            TaskState::Connecting => write!(f, "connecting"),
            TaskState::Connected => write!(f, "connected"),
            TaskState::QueryStarted => write!(f, "query-started"),
            TaskState::Fetching => write!(f, "fetching"),
            TaskState::Complete => write!(f, "complete"),
            TaskState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Point-in-time copy of a task's state, safe to read from any thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub state: TaskState,
    pub status: String,
    pub rows: u64,
}

impl TaskSnapshot {
    fn initial() -> Self {
        Self {
            state: TaskState::Init,
            status: "init".to_string(),
            rows: 0,
        }
    }
}

/// Why a task ended in `Failed`
#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error("connect-error: {0}")]
    Connect(EngineError),

    #[error("query-error: {0}")]
    Query(EngineError),

    #[error("row-error: {0}")]
    Row(EngineError),

    #[error("artifact-error: {0}")]
    Artifact(std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

/// Settings shared by every task of a run
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub connect_timeout: Duration,
    pub artifact_dir: Option<PathBuf>,
}

/// Terminal result of one task
#[derive(Debug)]
pub struct TaskOutcome {
    pub target: Target,
    /// Always terminal
    pub state: TaskState,
    pub status: String,
    pub rows: u64,
    pub elapsed: Duration,
    /// Present only for `Complete` results with at least one row
    pub artifact: Option<CompletedArtifact>,
}

impl TaskOutcome {
    /// Outcome for a task that ended without reporting one itself
    pub fn failed(target: Target, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            target,
            status: format!("failed: {}", reason),
            state: TaskState::Failed(reason),
            rows: 0,
            elapsed: Duration::ZERO,
            artifact: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }
}

/// One endpoint's connect / query / fetch lifecycle
pub struct ConnectionTask<C: Connector> {
    target: Target,
    connector: Arc<C>,
    query: Arc<str>,
    options: TaskOptions,
    cancel: CancellationToken,
    state: TaskState,
    status: String,
    rows: u64,
    fetch_start: Option<Instant>,
    status_tx: watch::Sender<TaskSnapshot>,
}

impl<C: Connector> ConnectionTask<C> {
    /// Create a task in `Init` along with the receiver for its snapshots
    pub fn new(
        target: Target,
        connector: Arc<C>,
        query: Arc<str>,
        options: TaskOptions,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<TaskSnapshot>) {
        let initial = TaskSnapshot::initial();
        let (status_tx, status_rx) = watch::channel(initial.clone());

        let task = Self {
            target,
            connector,
            query,
            options,
            cancel,
            state: initial.state,
            status: initial.status,
            rows: 0,
            fetch_start: None,
            status_tx,
        };

        (task, status_rx)
    }

    /// Drive the endpoint to a terminal state. Never fails; failures are
    /// recorded in the returned outcome.
    pub async fn run(mut self) -> TaskOutcome {
        let started = Instant::now();

        let artifact = match self.drive().await {
            Ok(artifact) => {
                let secs = self.fetch_elapsed().as_secs_f64();
                let status = format!(
                    "fetched {} rows successfully in {:.1} seconds",
                    self.rows, secs
                );
                info!(rows = self.rows, seconds = secs, "Fetch complete");
                self.transition(TaskState::Complete, status);
                artifact
            },
            Err(failure) => {
                match &failure {
                    TaskFailure::Cancelled => info!("Task cancelled"),
                    _ => warn!(error = %failure, "Task failed"),
                }
                let reason = failure.to_string();
                self.transition(TaskState::Failed(reason.clone()), format!("failed: {}", reason));
                None
            },
        };

        TaskOutcome {
            target: self.target,
            state: self.state,
            status: self.status,
            rows: self.rows,
            elapsed: started.elapsed(),
            artifact,
        }
    }

    /// Finish a task that was cancelled before it could start, publishing
    /// the terminal snapshot its observers are waiting for
    pub fn cancel_before_start(mut self) -> TaskOutcome {
        let reason = TaskFailure::Cancelled.to_string();
        info!("Task cancelled before start");
        self.transition(TaskState::Failed(reason.clone()), format!("failed: {}", reason));

        TaskOutcome {
            target: self.target,
            state: self.state,
            status: self.status,
            rows: 0,
            elapsed: Duration::ZERO,
            artifact: None,
        }
    }

    async fn drive(&mut self) -> Result<Option<CompletedArtifact>, TaskFailure> {
        self.transition(TaskState::Connecting, "connecting");

        let timeout = self.options.connect_timeout;
        let connector = Arc::clone(&self.connector);
        let connect = tokio::time::timeout(
            timeout,
            connector.connect(self.target.endpoint.descriptor()),
        );

        let mut session = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TaskFailure::Cancelled),
            result = connect => match result {
                Ok(Ok(session)) => session,
                Ok(Err(e)) => return Err(TaskFailure::Connect(e)),
                Err(_) => return Err(TaskFailure::Connect(EngineError::Timeout(timeout.as_secs()))),
            },
        };
        debug!("Connected");
        self.transition(TaskState::Connected, "connected");

        let result = self.fetch(&mut session).await;

        if matches!(result, Err(TaskFailure::Cancelled)) {
            // dropping closes the socket without waiting on the server
            drop(session);
        } else {
            match tokio::time::timeout(timeout, session.close()).await {
                Ok(Ok(())) => debug!("Session closed"),
                Ok(Err(e)) => debug!(error = %e, "Session close failed"),
                Err(_) => debug!("Session close timed out"),
            }
        }

        result
    }

    async fn fetch(
        &mut self,
        session: &mut C::Session,
    ) -> Result<Option<CompletedArtifact>, TaskFailure> {
        self.transition(TaskState::QueryStarted, "executing query");
        self.fetch_start = Some(Instant::now());

        let cancel = self.cancel.clone();
        let query = Arc::clone(&self.query);

        let ResultSet { columns, mut rows } = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TaskFailure::Cancelled),
            result = session.execute(&query) => result.map_err(TaskFailure::Query)?,
        };
        self.transition(TaskState::Fetching, "fetching");

        let mut artifact: Option<OutputArtifact> = None;
        let mut batch: Vec<Vec<String>> = Vec::with_capacity(WRITE_BATCH_ROWS);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TaskFailure::Cancelled),
                next = rows.next() => next,
            };
            let Some(row) = next else { break };
            let cells = row.map_err(TaskFailure::Row)?;
            batch.push(value::render_row(&cells));

            self.rows += 1;
            let status = self.throughput_status();
            self.set_status(status);

            if batch.len() >= WRITE_BATCH_ROWS {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(WRITE_BATCH_ROWS));
                artifact = Some(self.write_batch(artifact.take(), &columns, full).await?);
            }
        }
        drop(rows);

        if !batch.is_empty() {
            artifact = Some(self.write_batch(artifact.take(), &columns, batch).await?);
        }
        match artifact {
            Some(out) => blocking(move || out.finish()).await.map(Some),
            None => Ok(None),
        }
    }

    /// Append rendered rows on the blocking pool, creating the artifact on
    /// the first batch
    async fn write_batch(
        &self,
        artifact: Option<OutputArtifact>,
        header: &[String],
        batch: Vec<Vec<String>>,
    ) -> Result<OutputArtifact, TaskFailure> {
        let dir = self.options.artifact_dir.clone();
        let header = header.to_vec();

        blocking(move || -> std::io::Result<OutputArtifact> {
            let mut out = match artifact {
                Some(out) => out,
                None => OutputArtifact::create(dir.as_deref(), &header)?,
            };
            for row in &batch {
                out.write_row(row)?;
            }
            Ok(out)
        })
        .await
    }

    fn fetch_elapsed(&self) -> Duration {
        self.fetch_start
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }

    /// `fetch <n> rows (<rate>/s)`, rate omitted until time has passed
    fn throughput_status(&self) -> String {
        let secs = self.fetch_elapsed().as_secs_f64();
        if secs > 0.0 {
            format!("fetch {} rows ({:.2}/s)", self.rows, self.rows as f64 / secs)
        } else {
            format!("fetch {} rows", self.rows)
        }
    }

    fn transition(&mut self, next: TaskState, status: impl Into<String>) {
        if self.state.is_terminal() {
            debug!(from = %self.state, to = %next, "Ignoring transition out of terminal state");
            return;
        }
        self.state = next;
        self.set_status(status);
    }

    fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
        self.status_tx.send_replace(TaskSnapshot {
            state: self.state.clone(),
            status: self.status.clone(),
            rows: self.rows,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::{Script, ScriptedConnector};
    use crate::value::Cell;
    use pgfan_common::Endpoint;

    const DESCRIPTOR: &str = "postgres://u@db1/app";

    fn target() -> Target {
        Target::new(0, Endpoint::parse(DESCRIPTOR).unwrap(), "db1_app.csv")
    }

    fn options(dir: &std::path::Path) -> TaskOptions {
        TaskOptions {
            connect_timeout: Duration::from_secs(2),
            artifact_dir: Some(dir.to_path_buf()),
        }
    }

    async fn run_script(
        script: Script,
        dir: &std::path::Path,
    ) -> (TaskOutcome, watch::Receiver<TaskSnapshot>) {
        let connector = Arc::new(ScriptedConnector::new().endpoint(DESCRIPTOR, script));
        let (task, rx) = ConnectionTask::new(
            target(),
            connector,
            Arc::from("SELECT 1"),
            options(dir),
            CancellationToken::new(),
        );
        (task.run().await, rx)
    }

    fn files_in(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_rows_complete_with_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let (outcome, rx) = run_script(Script::numbered_rows(10), dir.path()).await;

        assert_eq!(outcome.state, TaskState::Complete);
        assert_eq!(outcome.rows, 10);
        assert!(outcome.status.starts_with("fetched 10 rows successfully in"));

        let artifact = outcome.artifact.expect("artifact for non-empty result");
        let content = std::fs::read_to_string(artifact.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 11);
        assert_eq!(lines[0], "id,label");
        assert!(lines.iter().all(|l| l.split(',').count() == 2));

        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.state, TaskState::Complete);
        assert_eq!(snapshot.rows, 10);
    }

    #[tokio::test]
    async fn test_zero_rows_complete_without_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let (outcome, _) = run_script(Script::numbered_rows(0), dir.path()).await;

        assert_eq!(outcome.state, TaskState::Complete);
        assert!(outcome.artifact.is_none());
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let (outcome, rx) =
            run_script(Script::connect_error("connection refused"), dir.path()).await;

        assert_eq!(
            outcome.state,
            TaskState::Failed("connect-error: connection refused".to_string())
        );
        assert_eq!(outcome.status, "failed: connect-error: connection refused");
        assert!(rx.borrow().state.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (outcome, _) = run_script(Script::ConnectHang, dir.path()).await;

        assert_eq!(
            outcome.state,
            TaskState::Failed("connect-error: timed out after 2 seconds".to_string())
        );
    }

    #[tokio::test]
    async fn test_query_error() {
        let dir = tempfile::tempdir().unwrap();
        let (outcome, _) =
            run_script(Script::query_error("relation \"t\" does not exist"), dir.path()).await;

        match outcome.state {
            TaskState::Failed(reason) => assert!(reason.starts_with("query-error: ")),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_row_error_discards_partial_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script::numbered_rows(10).failing_after(4, "connection reset");
        let (outcome, _) = run_script(script, dir.path()).await;

        assert_eq!(
            outcome.state,
            TaskState::Failed("row-error: connection reset".to_string())
        );
        assert_eq!(outcome.rows, 4);
        assert!(outcome.artifact.is_none());
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_rows_spanning_several_batches() {
        let dir = tempfile::tempdir().unwrap();
        let total = WRITE_BATCH_ROWS * 2 + 5;
        let (outcome, _) = run_script(Script::numbered_rows(total), dir.path()).await;

        assert_eq!(outcome.state, TaskState::Complete);
        let artifact = outcome.artifact.expect("artifact");
        assert_eq!(artifact.rows(), total as u64);
        let content = std::fs::read_to_string(artifact.path()).unwrap();
        assert_eq!(content.lines().count(), total + 1);
        assert_eq!(content.lines().last(), Some(format!("{},row {}", total - 1, total - 1).as_str()));
    }

    #[tokio::test]
    async fn test_row_error_after_written_batch_discards_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script::numbered_rows(WRITE_BATCH_ROWS * 3)
            .failing_after(WRITE_BATCH_ROWS + 10, "connection reset");
        let (outcome, _) = run_script(script, dir.path()).await;

        assert!(matches!(outcome.state, TaskState::Failed(_)));
        assert!(outcome.artifact.is_none());
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_ragged_row_is_artifact_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = Script::rows(
            &["a", "b"],
            vec![vec![Cell::Integer(1), Cell::Integer(2)], vec![Cell::Null]],
        );
        let (outcome, _) = run_script(script, dir.path()).await;

        match outcome.state {
            TaskState::Failed(reason) => assert!(reason.starts_with("artifact-error: ")),
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(ScriptedConnector::new().endpoint(
            DESCRIPTOR,
            Script::numbered_rows(1_000).with_row_delay(Duration::from_millis(5)),
        ));
        let cancel = CancellationToken::new();
        let (task, mut rx) = ConnectionTask::new(
            target(),
            Arc::clone(&connector),
            Arc::from("SELECT 1"),
            options(dir.path()),
            cancel.clone(),
        );
        let handle = tokio::spawn(task.run());

        rx.wait_for(|s| s.rows >= 3).await.unwrap();
        cancel.cancel();
        let outcome = handle.await.unwrap();

        assert_eq!(outcome.state, TaskState::Failed("cancelled".to_string()));
        assert!(outcome.artifact.is_none());
        assert_eq!(files_in(dir.path()), 0);
        assert_eq!(connector.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_snapshots_track_progress() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(ScriptedConnector::new().endpoint(
            DESCRIPTOR,
            Script::numbered_rows(5).with_row_delay(Duration::from_millis(2)),
        ));
        let (task, mut rx) = ConnectionTask::new(
            target(),
            connector,
            Arc::from("SELECT 1"),
            options(dir.path()),
            CancellationToken::new(),
        );
        assert_eq!(rx.borrow().state, TaskState::Init);

        let handle = tokio::spawn(task.run());
        let fetching = rx
            .wait_for(|s| s.state == TaskState::Fetching && s.rows > 0)
            .await
            .unwrap()
            .clone();
        assert!(fetching.status.starts_with("fetch "));

        handle.await.unwrap();
        assert_eq!(rx.borrow().state, TaskState::Complete);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Complete.is_terminal());
        assert!(TaskState::Failed("x".into()).is_terminal());
        assert!(!TaskState::Fetching.is_terminal());
        assert!(!TaskState::Init.is_terminal());
    }
}
