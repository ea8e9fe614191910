//! `pgfan` fetch run
//!
//! validate -> plan -> dispatch -> join -> aggregate -> report

use crate::archive::{Aggregator, ArchiveReport};
use crate::config::RunConfig;
use crate::dispatch::{Dispatcher, Phase};
use crate::engine::{Connector, PgConnector};
use crate::error::{CliError, Result};
use crate::plan::plan_targets;
use crate::progress::{self, StatusProjection};
use crate::task::TaskState;
use colored::Colorize;
use indicatif::ProgressDrawTarget;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything one run needs
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub query: String,
    pub output: PathBuf,
    pub endpoints: Vec<String>,
    pub config: RunConfig,
    /// Draw the live status display on stderr
    pub progress: bool,
}

/// Final state of one endpoint
#[derive(Debug, Clone)]
pub struct EndpointSummary {
    /// Descriptor with the password redacted
    pub endpoint: String,
    pub entry_name: String,
    pub complete: bool,
    pub status: String,
    pub rows: u64,
    pub elapsed: Duration,
}

/// Result of a finished run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub endpoints: Vec<EndpointSummary>,
    pub archive: ArchiveReport,
}

impl RunReport {
    pub fn failed_endpoints(&self) -> usize {
        self.endpoints.iter().filter(|e| !e.complete).count()
    }
}

/// Run against live PostgreSQL endpoints, cancelling on Ctrl-C
pub async fn run(request: FetchRequest) -> Result<()> {
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; cancelling run");
                cancel.cancel();
            }
        }
    });

    let result = run_with(Arc::new(PgConnector::new()), &request, cancel).await;
    watcher.abort();

    let report = result?;
    print_summary(&report);
    Ok(())
}

/// Run with any connector. No task starts unless every parameter is valid.
pub async fn run_with<C: Connector>(
    connector: Arc<C>,
    request: &FetchRequest,
    cancel: CancellationToken,
) -> Result<RunReport> {
    validate(request)?;
    let targets = plan_targets(&request.endpoints, request.config.collision_policy)?;
    info!(
        endpoints = targets.len(),
        output = %request.output.display(),
        "Starting run"
    );

    let (phase_tx, phase_rx) = watch::channel(Phase::Fetching);
    let dispatcher = Dispatcher::new(connector, &request.config, cancel.clone());
    let fetch = dispatcher.dispatch(targets, &request.query);

    let statuses = fetch.statuses();
    let tick = request.config.refresh_interval;
    let projection = if request.progress {
        StatusProjection::stderr(statuses, phase_rx, &request.output, tick)
    } else {
        StatusProjection::new(
            statuses,
            phase_rx,
            &request.output,
            tick,
            ProgressDrawTarget::hidden(),
        )
    };
    let display = tokio::spawn(projection.run());

    let mut outcomes = fetch.join(&phase_tx, &cancel).await;

    let archived = if cancel.is_cancelled() {
        // outcomes are dropped with their artifacts
        Err(CliError::Cancelled)
    } else {
        Aggregator::new(&request.output, cancel.clone())
            .run(&mut outcomes, &phase_tx)
            .await
    };

    drop(phase_tx);
    if let Err(e) = display.await {
        debug!(error = %e, "Status display task ended abnormally");
    }

    let archive = archived?;
    let endpoints = outcomes
        .into_iter()
        .map(|o| EndpointSummary {
            endpoint: o.target.endpoint.redacted(),
            entry_name: o.target.entry_name,
            complete: matches!(o.state, TaskState::Complete),
            status: o.status,
            rows: o.rows,
            elapsed: o.elapsed,
        })
        .collect();

    Ok(RunReport { endpoints, archive })
}

/// Parameter checks that need no connection
fn validate(request: &FetchRequest) -> Result<()> {
    if request.query.trim().is_empty() {
        return Err(CliError::invalid_parameters("query must not be empty"));
    }
    if request.endpoints.is_empty() {
        return Err(CliError::invalid_parameters(
            "at least one endpoint is required",
        ));
    }
    if request.output.as_os_str().is_empty() {
        return Err(CliError::invalid_parameters("output path must not be empty"));
    }
    if request.output.is_dir() {
        return Err(CliError::invalid_parameters(format!(
            "output '{}' is a directory",
            request.output.display()
        )));
    }

    let parent = request
        .output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    if !parent.is_dir() {
        return Err(CliError::invalid_parameters(format!(
            "output directory '{}' does not exist",
            parent.display()
        )));
    }

    Ok(())
}

fn print_summary(report: &RunReport) {
    println!();
    for endpoint in &report.endpoints {
        let mark = if endpoint.complete {
            "✓".green()
        } else {
            "✗".red()
        };
        println!("{} {}: {}", mark, endpoint.endpoint, endpoint.status);
    }

    if !report.archive.entries.is_empty() {
        println!();
        for entry in &report.archive.entries {
            println!(
                "  {} ({} rows, {})",
                entry.name.cyan(),
                entry.rows,
                progress::format_bytes(entry.bytes)
            );
        }
    }

    for failure in &report.archive.failures {
        println!(
            "{} {} was not archived: {}",
            "!".yellow(),
            failure.name,
            failure.reason
        );
    }

    let failed = report.failed_endpoints();
    let written = format!(
        "Finished writing {} entries to {}",
        report.archive.entries.len(),
        report.archive.path.display()
    );
    if failed == 0 && report.archive.failures.is_empty() {
        println!("\n{} {}", "✓".green().bold(), written);
    } else {
        println!(
            "\n{} {} ({} endpoint(s) failed)",
            "✓".yellow().bold(),
            written,
            failed
        );
    }
}
