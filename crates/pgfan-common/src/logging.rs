//! Diagnostic logging
//!
//! The terminal belongs to the live status display while a run is in
//! progress, so diagnostics never go to the console by default. They are
//! either suppressed entirely or written to a local file:
//!
//! - `DEBUG` set to any non-empty value writes debug-level diagnostics to
//!   `./debug.log`
//! - otherwise nothing is logged
//!
//! The `LOG_*` variables read by [`LogConfig::from_env`] override both, for
//! example `LOG_OUTPUT=console` when running non-interactively.
//!
//! Attach endpoints and counts as fields rather than formatting them into the
//! message, and only ever log the redacted form of a descriptor:
//!
//! ```rust
//! use tracing::{info, warn};
//!
//! # let entry = "db1_sales.csv"; let rows = 10; let err = "timeout";
//! info!(entry = %entry, rows, "Fetch complete");
//! warn!(entry = %entry, error = %err, "Connect failed");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use pgfan_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     // buffered lines are flushed when the guard drops
//!     let _guard = init_logging(&config)?;
//!
//!     tracing::info!("Run started");
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{self, format::FmtSpan, MakeWriter};
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment toggle enabling the diagnostic log file
pub const DEBUG_ENV_VAR: &str = "DEBUG";

/// File that diagnostics are written to when [`DEBUG_ENV_VAR`] is set
pub const DEBUG_LOG_FILE: &str = "debug.log";

/// Where diagnostics go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Off,
    /// Standard error
    Console,
    File,
    Both,
}

impl LogOutput {
    fn to_console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn to_file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

impl std::str::FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        choose(
            "log output",
            s,
            &[
                ("off", LogOutput::Off),
                ("none", LogOutput::Off),
                ("console", LogOutput::Console),
                ("stderr", LogOutput::Console),
                ("file", LogOutput::File),
                ("both", LogOutput::Both),
            ],
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        choose(
            "log format",
            s,
            &[("text", LogFormat::Text), ("json", LogFormat::Json)],
        )
    }
}

/// When the log file is rolled over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogRotation {
    /// One fixed file, appended to across runs
    #[default]
    Never,
    /// A new `<file>.<date>` every day
    Daily,
}

impl std::str::FromStr for LogRotation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        choose(
            "log rotation",
            s,
            &[("never", LogRotation::Never), ("daily", LogRotation::Daily)],
        )
    }
}

/// Case-insensitive lookup of `value` among named choices
fn choose<T: Copy>(what: &str, value: &str, choices: &[(&str, T)]) -> Result<T> {
    choices
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(value.trim()))
        .map(|(_, choice)| *choice)
        .ok_or_else(|| {
            let names: Vec<&str> = choices.iter().map(|(name, _)| *name).collect();
            anyhow!("Invalid {} '{}', expected one of: {}", what, value, names.join(", "))
        })
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Directory holding the log file
    pub log_dir: PathBuf,
    /// Log file name, or its prefix under daily rotation
    pub log_file: String,
    pub rotation: LogRotation,
    /// Extra directives, e.g. `sqlx=warn,pgfan_cli=trace`
    pub filter_directives: Option<String>,
    pub include_location: bool,
    pub include_thread_ids: bool,
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            output: LogOutput::Off,
            format: LogFormat::Text,
            log_dir: PathBuf::from("."),
            log_file: DEBUG_LOG_FILE.to_string(),
            rotation: LogRotation::Never,
            filter_directives: None,
            include_location: false,
            include_thread_ids: true,
            include_targets: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration implied by the `DEBUG` toggle alone
    pub fn diagnostics_from_env() -> Self {
        let enabled = std::env::var(DEBUG_ENV_VAR).is_ok_and(|v| !v.is_empty());
        Self::diagnostics(enabled)
    }

    /// Debug-level lines to `./debug.log` when enabled, nothing otherwise
    pub fn diagnostics(enabled: bool) -> Self {
        if !enabled {
            return Self::new();
        }

        Self::builder()
            .level(Level::DEBUG)
            .output(LogOutput::File)
            .filter_directives("sqlx=warn")
            .build()
    }

    /// [`LogConfig::diagnostics_from_env`] with `LOG_*` overrides applied.
    ///
    /// - `LOG_LEVEL`: trace, debug, info, warn, error
    /// - `LOG_OUTPUT`: off, console, file, both
    /// - `LOG_FORMAT`: text, json
    /// - `LOG_DIR`, `LOG_FILE`: log file location
    /// - `LOG_ROTATION`: never, daily
    /// - `LOG_FILTER`: extra filter directives
    /// - `LOG_INCLUDE_LOCATION`, `LOG_INCLUDE_THREAD_IDS`,
    ///   `LOG_INCLUDE_TARGETS`: true/false
    pub fn from_env() -> Result<Self> {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        let flag = |key: &str, current: bool| {
            var(key).map_or(current, |v| v.parse().unwrap_or(current))
        };

        let mut config = Self::diagnostics_from_env();

        if let Some(level) = var("LOG_LEVEL") {
            config.level = level
                .parse()
                .map_err(|_| anyhow!("Invalid log level '{}'", level))?;
        }
        if let Some(output) = var("LOG_OUTPUT") {
            config.output = output.parse()?;
        }
        if let Some(format) = var("LOG_FORMAT") {
            config.format = format.parse()?;
        }
        if let Some(dir) = var("LOG_DIR") {
            config.log_dir = dir.into();
        }
        if let Some(file) = var("LOG_FILE") {
            config.log_file = file;
        }
        if let Some(rotation) = var("LOG_ROTATION") {
            config.rotation = rotation.parse()?;
        }
        if let Some(filter) = var("LOG_FILTER") {
            config.filter_directives = Some(filter);
        }

        config.include_location = flag("LOG_INCLUDE_LOCATION", config.include_location);
        config.include_thread_ids = flag("LOG_INCLUDE_THREAD_IDS", config.include_thread_ids);
        config.include_targets = flag("LOG_INCLUDE_TARGETS", config.include_targets);

        Ok(config)
    }

    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    /// Whether anything will be recorded at all
    pub fn is_enabled(&self) -> bool {
        self.output != LogOutput::Off
    }

    fn filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::from_default_env().add_directive(self.level.into());

        let extra = self.filter_directives.as_deref().unwrap_or_default();
        for directive in extra.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            filter = filter.add_directive(
                directive
                    .parse()
                    .with_context(|| format!("Invalid filter directive '{}'", directive))?,
            );
        }

        Ok(filter)
    }
}

/// Builder for [`LogConfig`]
#[derive(Debug, Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: Level) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn log_file(mut self, file: impl Into<String>) -> Self {
        self.config.log_file = file.into();
        self
    }

    pub fn rotation(mut self, rotation: LogRotation) -> Self {
        self.config.rotation = rotation;
        self
    }

    pub fn filter_directives(mut self, filter: impl Into<String>) -> Self {
        self.config.filter_directives = Some(filter.into());
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Flushes buffered file output when dropped.
///
/// Hold it for the life of the process; dropping it early stops file logging.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

type Filtered = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Filtered> + Send + Sync>;

/// Install the global subscriber described by `config`.
///
/// Call once at startup. With [`LogOutput::Off`] nothing is installed.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuard> {
    if !config.is_enabled() {
        return Ok(LoggingGuard { _file: None });
    }

    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if config.output.to_console() {
        layers.push(fmt_layer(config, std::io::stderr, true));
    }

    if config.output.to_file() {
        std::fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("Failed to create log directory {}", config.log_dir.display())
        })?;

        let appender = match config.rotation {
            LogRotation::Never => {
                tracing_appender::rolling::never(&config.log_dir, &config.log_file)
            },
            LogRotation::Daily => {
                tracing_appender::rolling::daily(&config.log_dir, &config.log_file)
            },
        };
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt_layer(config, writer, false));
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(config.filter()?)
        .with(layers)
        .try_init()?;

    Ok(LoggingGuard { _file: guard })
}

fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.include_targets)
        .with_thread_ids(config.include_thread_ids)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE);

    match config.format {
        LogFormat::Text => Box::new(layer),
        LogFormat::Json => Box::new(layer.json()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_output_parsing() {
        assert_eq!("off".parse::<LogOutput>().unwrap(), LogOutput::Off);
        assert_eq!("STDERR".parse::<LogOutput>().unwrap(), LogOutput::Console);
        assert_eq!("both".parse::<LogOutput>().unwrap(), LogOutput::Both);

        let err = "stdout".parse::<LogOutput>().unwrap_err();
        assert!(err.to_string().contains("expected one of"));
    }

    #[test]
    fn test_rotation_and_format_parsing() {
        assert_eq!("Daily".parse::<LogRotation>().unwrap(), LogRotation::Daily);
        assert!("hourly".parse::<LogRotation>().is_err());
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
    }

    #[test]
    fn test_diagnostics_enabled_writes_debug_file() {
        let config = LogConfig::diagnostics(true);
        assert!(config.is_enabled());
        assert_eq!(config.output, LogOutput::File);
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.log_dir, PathBuf::from("."));
        assert_eq!(config.log_file, DEBUG_LOG_FILE);
        assert_eq!(config.rotation, LogRotation::Never);
    }

    #[test]
    fn test_diagnostics_disabled_is_off() {
        assert!(!LogConfig::diagnostics(false).is_enabled());
    }

    #[test]
    fn test_init_logging_off_installs_nothing() {
        assert!(init_logging(&LogConfig::diagnostics(false)).is_ok());
    }

    #[test]
    fn test_bad_filter_directive_is_reported() {
        let config = LogConfig::builder()
            .output(LogOutput::Console)
            .filter_directives("sqlx=warn,,pgfan_cli=loud")
            .build();
        assert!(config.filter().is_err());
    }

    #[test]
    fn test_builder() {
        let config = LogConfig::builder()
            .level(Level::TRACE)
            .output(LogOutput::Both)
            .format(LogFormat::Json)
            .log_dir("/var/log/pgfan")
            .log_file("pgfan.log")
            .rotation(LogRotation::Daily)
            .build();

        assert_eq!(config.level, Level::TRACE);
        assert!(config.output.to_console() && config.output.to_file());
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.log_file, "pgfan.log");
    }
}
