//! Archive assembly
//!
//! Runs strictly after every task is terminal. Complete outcomes with rows
//! are copied into one deflated zip, in endpoint order. The zip is built in a
//! temporary file next to the output and only moved into place once every
//! entry has been attempted, so a cancelled or failed run never leaves a
//! half-written archive at the output path.

use crate::artifact::CompletedArtifact;
use crate::dispatch::Phase;
use crate::error::{CliError, Result};
use crate::task::TaskOutcome;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Entries at or above this size need zip64 headers
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// One entry written to the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedEntry {
    pub name: String,
    pub rows: u64,
    pub bytes: u64,
}

/// An entry that could not be copied; the rest of the archive is unaffected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub name: String,
    pub reason: String,
}

/// What ended up in the archive
#[derive(Debug, Clone)]
pub struct ArchiveReport {
    pub path: PathBuf,
    pub entries: Vec<ArchivedEntry>,
    pub failures: Vec<EntryFailure>,
}

/// Builds the output archive from finished task outcomes
pub struct Aggregator {
    output: PathBuf,
    cancel: CancellationToken,
}

impl Aggregator {
    pub fn new(output: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            output: output.into(),
            cancel,
        }
    }

    /// Write the archive and move it to the output path.
    ///
    /// Artifacts are taken out of `outcomes` and deleted whether or not they
    /// were copied. Emits [`Phase::Done`] on success.
    pub async fn run(
        &self,
        outcomes: &mut [TaskOutcome],
        phase: &watch::Sender<Phase>,
    ) -> Result<ArchiveReport> {
        let pending: Vec<(String, CompletedArtifact)> = outcomes
            .iter_mut()
            .filter(|o| o.is_complete())
            .filter_map(|o| {
                o.artifact
                    .take()
                    .map(|artifact| (o.target.entry_name.clone(), artifact))
            })
            .collect();

        if self.cancel.is_cancelled() {
            phase.send_replace(Phase::Cancelled);
            return Err(CliError::Cancelled);
        }

        let temp = archive_builder()
            .tempfile_in(archive_dir(&self.output))
            .map_err(|e| CliError::archive_create(&self.output, e))?;
        info!(
            output = %self.output.display(),
            entries = pending.len(),
            "Writing archive"
        );

        let cancel = self.cancel.clone();
        let output = self.output.clone();
        let written = tokio::task::spawn_blocking(move || write_archive(temp, pending, &cancel))
            .await
            .map_err(|e| CliError::archive_finalize(&output, e))?;

        let (temp, entries, failures) = match written {
            Ok(written) => written,
            Err(ArchiveAbort::Cancelled) => {
                info!("Archiving cancelled; discarding partial archive");
                phase.send_replace(Phase::Cancelled);
                return Err(CliError::Cancelled);
            },
            Err(ArchiveAbort::Io(e)) => return Err(CliError::archive_finalize(&self.output, e)),
        };

        temp.persist(&self.output)
            .map_err(|e| CliError::archive_finalize(&self.output, e.error))?;

        info!(
            output = %self.output.display(),
            entries = entries.len(),
            failures = failures.len(),
            "Archive written"
        );
        phase.send_replace(Phase::Done);

        Ok(ArchiveReport {
            path: self.output.clone(),
            entries,
            failures,
        })
    }
}

enum ArchiveAbort {
    Cancelled,
    Io(io::Error),
}

impl From<zip::result::ZipError> for ArchiveAbort {
    fn from(e: zip::result::ZipError) -> Self {
        ArchiveAbort::Io(io::Error::other(e))
    }
}

impl From<io::Error> for ArchiveAbort {
    fn from(e: io::Error) -> Self {
        ArchiveAbort::Io(e)
    }
}

type Written = (NamedTempFile, Vec<ArchivedEntry>, Vec<EntryFailure>);

fn write_archive(
    temp: NamedTempFile,
    pending: Vec<(String, CompletedArtifact)>,
    cancel: &CancellationToken,
) -> std::result::Result<Written, ArchiveAbort> {
    let file = temp.reopen()?;
    let mut zip = ZipWriter::new(file);
    let mut entries = Vec::new();
    let mut failures = Vec::new();

    for (name, artifact) in pending {
        if cancel.is_cancelled() {
            // remaining artifacts are removed as the iterator drops
            return Err(ArchiveAbort::Cancelled);
        }

        match copy_entry(&mut zip, &name, &artifact) {
            Ok(bytes) => {
                debug!(entry = %name, bytes, "Archived entry");
                entries.push(ArchivedEntry {
                    name,
                    rows: artifact.rows(),
                    bytes,
                });
            },
            Err(e) => {
                warn!(entry = %name, error = %e, "Failed to archive entry");
                failures.push(EntryFailure {
                    name,
                    reason: e.to_string(),
                });
            },
        }

        if let Err(e) = artifact.remove() {
            debug!(error = %e, "Could not remove artifact");
        }
    }

    let file = zip.finish()?;
    file.sync_all()?;

    Ok((temp, entries, failures))
}

/// Copy one artifact into the zip. On error the entry is aborted so the
/// archive stays well formed.
fn copy_entry(
    zip: &mut ZipWriter<File>,
    name: &str,
    artifact: &CompletedArtifact,
) -> io::Result<u64> {
    let mut source = artifact.open()?;
    let size = source.metadata()?.len();

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(size >= ZIP64_THRESHOLD);

    zip.start_file(name, options).map_err(io::Error::other)?;

    match io::copy(&mut source, zip) {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            if let Err(abort) = zip.abort_file() {
                debug!(error = %abort, "Could not abort entry");
            }
            Err(e)
        },
    }
}

/// Temp file settings for the archive. It is persisted in place, so it gets
/// the mode a plain created file would have (0666 less the umask) rather than
/// the private default.
fn archive_builder() -> tempfile::Builder<'static, 'static> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(".pgfan-").suffix(".zip.part");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o666));
    }
    builder
}

fn archive_dir(output: &Path) -> &Path {
    match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
