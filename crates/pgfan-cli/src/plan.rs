//! Endpoint planning
//!
//! Turns the raw descriptor list into [`Target`]s before anything connects:
//! every descriptor is parsed, and every target is assigned the archive entry
//! name it will be stored under. Entry names are resolved here, up front, so
//! that collisions are a parameter error (or a deterministic rename) instead
//! of one endpoint silently replacing another inside the archive.

use crate::error::{CliError, Result};
use pgfan_common::Endpoint;
use std::collections::{HashMap, HashSet};

/// Extension of every archive entry
pub const ENTRY_EXTENSION: &str = "csv";

/// What to do when two endpoints share `<host>_<database>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CollisionPolicy {
    /// Keep both; later endpoints get `-2`, `-3`, ... appended
    #[default]
    Suffix,
    /// Refuse to start
    Reject,
}

impl std::str::FromStr for CollisionPolicy {
    type Err = CliError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "suffix" | "rename" => Ok(CollisionPolicy::Suffix),
            "reject" | "error" => Ok(CollisionPolicy::Reject),
            _ => Err(CliError::config(format!(
                "Invalid collision policy '{}', expected 'suffix' or 'reject'",
                s
            ))),
        }
    }
}

impl std::fmt::Display for CollisionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollisionPolicy::Suffix => write!(f, "suffix"),
            CollisionPolicy::Reject => write!(f, "reject"),
        }
    }
}

/// One endpoint scheduled for a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Position in the original endpoint list
    pub index: usize,
    pub endpoint: Endpoint,
    /// Archive entry name, unique within the run
    pub entry_name: String,
}

impl Target {
    pub fn new(index: usize, endpoint: Endpoint, entry_name: impl Into<String>) -> Self {
        Self {
            index,
            endpoint,
            entry_name: entry_name.into(),
        }
    }
}

/// Parse every descriptor and assign unique entry names.
///
/// Order is preserved. With [`CollisionPolicy::Suffix`] the first endpoint
/// keeps the plain name and later ones are numbered, skipping any number
/// that would collide with another endpoint's plain name. Names do not depend
/// on outcomes: a numbered endpoint keeps its suffix even when the one that
/// owns the plain name fails.
pub fn plan_targets(descriptors: &[String], policy: CollisionPolicy) -> Result<Vec<Target>> {
    if descriptors.is_empty() {
        return Err(CliError::invalid_parameters(
            "at least one endpoint connection descriptor is required",
        ));
    }

    let endpoints = descriptors
        .iter()
        .map(|d| Endpoint::parse(d))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let base_names: Vec<String> = endpoints.iter().map(Endpoint::canonical_name).collect();
    let redacted: Vec<String> = endpoints.iter().map(Endpoint::redacted).collect();

    let mut first_owner: HashMap<&str, usize> = HashMap::new();
    for (idx, name) in base_names.iter().enumerate() {
        first_owner.entry(name.as_str()).or_insert(idx);
    }

    let mut taken: HashSet<String> = base_names
        .iter()
        .map(|name| entry_file_name(name))
        .collect();

    let mut targets = Vec::with_capacity(endpoints.len());
    for (idx, endpoint) in endpoints.into_iter().enumerate() {
        let base = &base_names[idx];
        let owner = first_owner[base.as_str()];

        let entry_name = if owner == idx {
            entry_file_name(base)
        } else {
            match policy {
                CollisionPolicy::Reject => {
                    return Err(CliError::EntryCollision {
                        entry: entry_file_name(base),
                        first: redacted[owner].clone(),
                        second: redacted[idx].clone(),
                    });
                },
                CollisionPolicy::Suffix => {
                    let mut n = 2;
                    loop {
                        let candidate = entry_file_name(&format!("{}-{}", base, n));
                        if taken.insert(candidate.clone()) {
                            break candidate;
                        }
                        n += 1;
                    }
                },
            }
        };

        targets.push(Target::new(idx, endpoint, entry_name));
    }

    Ok(targets)
}

fn entry_file_name(stem: &str) -> String {
    format!("{}.{}", stem, ENTRY_EXTENSION)
}
