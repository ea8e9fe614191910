//! Fan-out of one query over every planned endpoint
//!
//! Each target gets its own spawned [`ConnectionTask`]. Tasks share nothing
//! but the connector, the query text and the cancellation token, so a slow or
//! failing endpoint never holds up the others. With a concurrency limit the
//! tasks queue on a semaphore before connecting.

use crate::config::RunConfig;
use crate::engine::Connector;
use crate::plan::Target;
use crate::task::{ConnectionTask, TaskOptions, TaskOutcome, TaskSnapshot};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

/// Run-wide progress, observed by the status display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fetching,
    Archiving,
    Done,
    Cancelled,
}

impl Phase {
    pub fn is_finished(self) -> bool {
        matches!(self, Phase::Done | Phase::Cancelled)
    }
}

/// Read side of one task's snapshot channel
#[derive(Debug, Clone)]
pub struct StatusHandle {
    pub target: Target,
    pub receiver: watch::Receiver<TaskSnapshot>,
}

/// Spawns one task per endpoint
pub struct Dispatcher<C: Connector> {
    connector: Arc<C>,
    options: TaskOptions,
    limit: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
}

impl<C: Connector> Dispatcher<C> {
    pub fn new(connector: Arc<C>, config: &RunConfig, cancel: CancellationToken) -> Self {
        Self {
            connector,
            options: TaskOptions {
                connect_timeout: config.connect_timeout,
                artifact_dir: config.artifact_dir.clone(),
            },
            limit: config
                .max_concurrency
                .map(|permits| Arc::new(Semaphore::new(permits.max(1)))),
            cancel,
        }
    }

    /// Start every target. Returns immediately; tasks run in the background.
    pub fn dispatch(&self, targets: Vec<Target>, query: &str) -> FetchPhase {
        let query: Arc<str> = Arc::from(query);
        let mut handles = Vec::with_capacity(targets.len());
        let mut statuses = Vec::with_capacity(targets.len());

        info!(
            endpoints = targets.len(),
            limit = ?self.limit.as_ref().map(|s| s.available_permits()),
            "Dispatching query"
        );

        for target in targets {
            let (task, receiver) = ConnectionTask::new(
                target.clone(),
                Arc::clone(&self.connector),
                Arc::clone(&query),
                self.options.clone(),
                self.cancel.clone(),
            );
            statuses.push(StatusHandle {
                target: target.clone(),
                receiver,
            });

            let span = info_span!(
                "endpoint",
                index = target.index,
                entry = %target.entry_name,
                endpoint = %target.endpoint,
            );
            let limit = self.limit.clone();
            let cancel = self.cancel.clone();

            let handle = tokio::spawn(
                async move {
                    let _permit = match limit {
                        Some(semaphore) => tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                return task.cancel_before_start();
                            },
                            permit = semaphore.acquire_owned() => permit.ok(),
                        },
                        None => None,
                    };
                    task.run().await
                }
                .instrument(span),
            );
            handles.push((target, handle));
        }

        FetchPhase { handles, statuses }
    }
}

/// Tasks of a run that are still in flight
pub struct FetchPhase {
    handles: Vec<(Target, JoinHandle<TaskOutcome>)>,
    statuses: Vec<StatusHandle>,
}

impl FetchPhase {
    /// Snapshot receivers in endpoint order
    pub fn statuses(&self) -> Vec<StatusHandle> {
        self.statuses.clone()
    }

    /// Wait for every task, returning outcomes in endpoint order.
    ///
    /// A task that panicked is reported as failed rather than aborting the
    /// run. The phase moves to `Archiving`, or `Cancelled` if the run was
    /// cancelled meanwhile.
    pub async fn join(
        self,
        phase: &watch::Sender<Phase>,
        cancel: &CancellationToken,
    ) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::with_capacity(self.handles.len());

        for (target, handle) in self.handles {
            outcomes.push(settle(target, handle.await));
        }

        let next = if cancel.is_cancelled() {
            Phase::Cancelled
        } else {
            Phase::Archiving
        };
        phase.send_replace(next);

        let complete = outcomes.iter().filter(|o| o.is_complete()).count();
        info!(
            complete,
            failed = outcomes.len() - complete,
            "All endpoint tasks finished"
        );

        outcomes
    }
}

/// Outcome for a joined task; a panic or abort becomes a `task-error` failure
fn settle(target: Target, joined: Result<TaskOutcome, JoinError>) -> TaskOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(entry = %target.entry_name, error = %e, "Endpoint task did not finish");
            TaskOutcome::failed(target, format!("task-error: {}", e))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scripted::{Script, ScriptedConnector};
    use crate::plan::{plan_targets, CollisionPolicy};
    use crate::task::TaskState;
    use std::time::Duration;

    fn descriptors(hosts: &[&str]) -> Vec<String> {
        hosts
            .iter()
            .map(|h| format!("postgres://u@{}/app", h))
            .collect()
    }

    fn config(dir: &std::path::Path, limit: Option<usize>) -> RunConfig {
        let mut config = RunConfig::new();
        config.set_artifact_dir(Some(dir.to_path_buf()));
        config.set_max_concurrency(limit);
        config
    }

    #[tokio::test]
    async fn test_outcomes_in_endpoint_order() {
        let dir = tempfile::tempdir().unwrap();
        let descs = descriptors(&["a", "b", "c"]);
        let connector = ScriptedConnector::new()
            .endpoint(&descs[0], Script::numbered_rows(3).with_row_delay(Duration::from_millis(10)))
            .endpoint(&descs[1], Script::connect_error("refused"))
            .endpoint(&descs[2], Script::numbered_rows(1));

        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(Arc::new(connector), &config(dir.path(), None), cancel.clone());
        let targets = plan_targets(&descs, CollisionPolicy::Suffix).unwrap();
        let (phase_tx, phase_rx) = watch::channel(Phase::Fetching);

        let outcomes = dispatcher.dispatch(targets, "SELECT 1").join(&phase_tx, &cancel).await;

        let names: Vec<&str> = outcomes.iter().map(|o| o.target.entry_name.as_str()).collect();
        assert_eq!(names, vec!["a_app.csv", "b_app.csv", "c_app.csv"]);
        assert_eq!(outcomes[0].state, TaskState::Complete);
        assert_eq!(outcomes[1].state, TaskState::Failed("connect-error: refused".into()));
        assert_eq!(outcomes[2].state, TaskState::Complete);
        assert_eq!(*phase_rx.borrow(), Phase::Archiving);
    }

    #[tokio::test]
    async fn test_concurrency_limit_bounds_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let descs = descriptors(&["h1", "h2", "h3", "h4", "h5", "h6"]);
        let mut connector = ScriptedConnector::new();
        for desc in &descs {
            connector = connector.endpoint(
                desc,
                Script::numbered_rows(4).with_row_delay(Duration::from_millis(5)),
            );
        }
        let connector = Arc::new(connector);

        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(Arc::clone(&connector), &config(dir.path(), Some(2)), cancel.clone());
        let targets = plan_targets(&descs, CollisionPolicy::Suffix).unwrap();
        let (phase_tx, _) = watch::channel(Phase::Fetching);

        let outcomes = dispatcher.dispatch(targets, "SELECT 1").join(&phase_tx, &cancel).await;

        assert!(outcomes.iter().all(|o| o.is_complete()));
        assert!(connector.peak_sessions() <= 2);
        assert_eq!(connector.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_cancel_reaches_queued_and_running_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let descs = descriptors(&["x", "y", "z"]);
        let mut connector = ScriptedConnector::new();
        for desc in &descs {
            connector = connector.endpoint(
                desc,
                Script::numbered_rows(10_000).with_row_delay(Duration::from_millis(5)),
            );
        }

        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(Arc::new(connector), &config(dir.path(), Some(1)), cancel.clone());
        let targets = plan_targets(&descs, CollisionPolicy::Suffix).unwrap();
        let (phase_tx, phase_rx) = watch::channel(Phase::Fetching);

        let fetch = dispatcher.dispatch(targets, "SELECT 1");
        let fetch_statuses = fetch.statuses();
        let mut first = fetch_statuses[0].receiver.clone();
        first.wait_for(|s| s.rows > 0).await.unwrap();
        cancel.cancel();

        let outcomes = fetch.join(&phase_tx, &cancel).await;
        assert!(outcomes
            .iter()
            .all(|o| o.state == TaskState::Failed("cancelled".into())));
        assert!(outcomes.iter().all(|o| o.artifact.is_none()));
        assert_eq!(*phase_rx.borrow(), Phase::Cancelled);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        // queued tasks never ran, but their observers still see the end state
        for status in fetch_statuses {
            let snapshot = status.receiver.borrow().clone();
            assert_eq!(snapshot.state, TaskState::Failed("cancelled".into()));
            assert_eq!(snapshot.status, "failed: cancelled");
        }
    }

    #[tokio::test]
    async fn test_panicked_task_settles_as_task_error() {
        let target = plan_targets(&descriptors(&["p"]), CollisionPolicy::Suffix)
            .unwrap()
            .remove(0);
        let handle: JoinHandle<TaskOutcome> = tokio::spawn(async { panic!("boom") });

        let outcome = settle(target, handle.await);

        assert_eq!(outcome.target.entry_name, "p_app.csv");
        match &outcome.state {
            TaskState::Failed(reason) => assert!(reason.starts_with("task-error: "), "{}", reason),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(outcome.status.starts_with("failed: task-error: "));
        assert!(outcome.artifact.is_none());
    }
}
