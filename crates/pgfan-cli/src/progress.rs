//! Live status display
//!
//! [`StatusProjection`] polls every task's latest snapshot on a fixed tick and
//! draws one line per endpoint with indicatif. It only ever reads snapshots,
//! so what it shows may trail the tasks by up to one tick.

use crate::dispatch::{Phase, StatusHandle};
use crate::task::TaskSnapshot;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

const LINE_TEMPLATE: &str = "{msg}";

/// One status line per endpoint plus an archive footer
pub struct StatusProjection {
    multi: MultiProgress,
    lines: Vec<(StatusHandle, ProgressBar)>,
    footer: ProgressBar,
    phase: watch::Receiver<Phase>,
    output: PathBuf,
    tick: Duration,
}

impl StatusProjection {
    pub fn new(
        statuses: Vec<StatusHandle>,
        phase: watch::Receiver<Phase>,
        output: impl Into<PathBuf>,
        tick: Duration,
        draw_target: ProgressDrawTarget,
    ) -> Self {
        let multi = MultiProgress::with_draw_target(draw_target);
        let style = line_style();

        let lines = statuses
            .into_iter()
            .map(|handle| {
                let bar = multi.add(ProgressBar::new_spinner().with_style(style.clone()));
                bar.set_message(render_line(&handle, &handle.receiver.borrow()));
                (handle, bar)
            })
            .collect();
        let footer = multi.add(ProgressBar::new_spinner().with_style(style));

        Self {
            multi,
            lines,
            footer,
            phase,
            output: output.into(),
            tick,
        }
    }

    /// Draw to stderr when it is a terminal, otherwise draw nothing
    pub fn stderr(
        statuses: Vec<StatusHandle>,
        phase: watch::Receiver<Phase>,
        output: impl Into<PathBuf>,
        tick: Duration,
    ) -> Self {
        let target = if console::Term::stderr().is_term() {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        Self::new(statuses, phase, output, tick, target)
    }

    /// Refresh until the run is `Done` or `Cancelled`, returning the final phase
    pub async fn run(mut self) -> Phase {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {},
                changed = self.phase.changed() => {
                    if changed.is_err() {
                        break;
                    }
                },
            }

            let phase = *self.phase.borrow();
            self.refresh(phase);
            if phase.is_finished() {
                break;
            }
        }

        let phase = *self.phase.borrow();
        self.refresh(phase);
        for (_, bar) in &self.lines {
            bar.finish();
        }
        self.footer.finish();
        if let Err(e) = self.multi.clear() {
            tracing::debug!(error = %e, "Could not clear status display");
        }
        phase
    }

    fn refresh(&self, phase: Phase) {
        for (handle, bar) in &self.lines {
            bar.set_message(render_line(handle, &handle.receiver.borrow()));
        }
        self.footer.set_message(self.footer_text(phase));
    }

    fn footer_text(&self, phase: Phase) -> String {
        match phase {
            Phase::Fetching => String::new(),
            Phase::Archiving => format!("Writing archive to {} ...", self.output.display()),
            Phase::Done => format!("Finished writing to {}", self.output.display()),
            Phase::Cancelled => "Cancelled".to_string(),
        }
    }

    /// Lines as currently drawn, in endpoint order
    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().map(|(_, bar)| bar.message()).collect()
    }
}

fn line_style() -> ProgressStyle {
    ProgressStyle::with_template(LINE_TEMPLATE).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// `<icon> <endpoint>: <status>` with the password redacted
pub fn render_line(handle: &StatusHandle, snapshot: &TaskSnapshot) -> String {
    format!(
        "{} {}: {}",
        snapshot.state.icon(),
        handle.target.endpoint,
        snapshot.status
    )
}

/// Format bytes into human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    match unit {
        0 => format!("{} B", bytes),
        _ => format!("{:.2} {}", size, UNITS[unit]),
    }
}
