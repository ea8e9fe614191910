//! Run configuration for pgfan
//!
//! Defaults live in the constants below. [`RunConfig::from_env`] applies the
//! `PGFAN_*` environment variables on top, and command-line flags override
//! both.

use crate::error::{CliError, Result};
use crate::plan::CollisionPolicy;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Run Configuration Constants
// ============================================================================

/// Connect attempts are abandoned after this long.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Interval between status display refreshes (six frames per second).
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 166;

/// Run configuration
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Upper bound on establishing each connection. Queries and row
    /// streaming are not bounded.
    pub connect_timeout: Duration,

    /// Maximum endpoints worked on at once; `None` means one worker per
    /// endpoint with no limit
    pub max_concurrency: Option<usize>,

    pub collision_policy: CollisionPolicy,

    /// Status display refresh tick
    pub refresh_interval: Duration,

    /// Where temporary per-endpoint files are written; the system temp
    /// directory when unset
    pub artifact_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_concurrency: None,
            collision_policy: CollisionPolicy::default(),
            refresh_interval: Duration::from_millis(DEFAULT_REFRESH_INTERVAL_MS),
            artifact_dir: None,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load config from environment variables
    ///
    /// - `PGFAN_CONNECT_TIMEOUT`: seconds
    /// - `PGFAN_MAX_CONCURRENCY`: positive integer, `0` for unlimited
    /// - `PGFAN_ON_COLLISION`: `suffix` or `reject`
    /// - `PGFAN_REFRESH_MS`: milliseconds
    /// - `PGFAN_TEMP_DIR`: directory for temporary files
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new();

        if let Ok(secs) = std::env::var("PGFAN_CONNECT_TIMEOUT") {
            config.set_connect_timeout_secs(parse_number("PGFAN_CONNECT_TIMEOUT", &secs)?)?;
        }

        if let Ok(limit) = std::env::var("PGFAN_MAX_CONCURRENCY") {
            config.set_max_concurrency(Some(parse_number("PGFAN_MAX_CONCURRENCY", &limit)? as usize));
        }

        if let Ok(policy) = std::env::var("PGFAN_ON_COLLISION") {
            config.collision_policy = policy.parse()?;
        }

        if let Ok(ms) = std::env::var("PGFAN_REFRESH_MS") {
            let ms = parse_number("PGFAN_REFRESH_MS", &ms)?;
            if ms == 0 {
                return Err(CliError::config("PGFAN_REFRESH_MS must be greater than zero"));
            }
            config.refresh_interval = Duration::from_millis(ms);
        }

        if let Ok(dir) = std::env::var("PGFAN_TEMP_DIR") {
            config.artifact_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }

    pub fn set_connect_timeout_secs(&mut self, secs: u64) -> Result<()> {
        if secs == 0 {
            return Err(CliError::config("connect timeout must be at least one second"));
        }
        self.connect_timeout = Duration::from_secs(secs);
        Ok(())
    }

    /// Set the concurrency bound; `Some(0)` is treated as unlimited
    pub fn set_max_concurrency(&mut self, limit: Option<usize>) {
        self.max_concurrency = limit.filter(|n| *n > 0);
    }

    pub fn set_collision_policy(&mut self, policy: CollisionPolicy) {
        self.collision_policy = policy;
    }

    pub fn set_artifact_dir(&mut self, dir: Option<PathBuf>) {
        self.artifact_dir = dir;
    }
}

fn parse_number(var: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| CliError::config(format!("{} must be a non-negative integer, got '{}'", var, value)))
}
