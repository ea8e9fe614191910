//! Per-endpoint temporary CSV output
//!
//! An artifact is created with a result set's first batch of rows and owned
//! by exactly one task. The backing file is deleted when the artifact (or the
//! [`CompletedArtifact`] it turns into) is dropped, so every exit path, whether
//! failure, cancellation or a successful copy into the archive, releases it.

use std::fs::File;
use std::io;
use std::path::Path;
use tempfile::TempPath;
use tracing::debug;

const ARTIFACT_PREFIX: &str = "pgfan-";
const ARTIFACT_SUFFIX: &str = ".csv";

/// Temporary CSV file still being written
pub struct OutputArtifact {
    writer: csv::Writer<File>,
    path: TempPath,
    rows: u64,
}

impl OutputArtifact {
    /// Create the file in `dir` (the system temp dir when `None`) and write
    /// the header row.
    pub fn create(dir: Option<&Path>, header: &[String]) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(ARTIFACT_PREFIX).suffix(ARTIFACT_SUFFIX);

        let temp = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let (file, path) = temp.into_parts();
        debug!(path = %path.display(), "Created artifact");

        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(file);
        writer.write_record(header).map_err(io::Error::from)?;

        Ok(Self {
            writer,
            path,
            rows: 0,
        })
    }

    /// Append one rendered row.
    ///
    /// Fails if the row's width differs from the header's.
    pub fn write_row(&mut self, row: &[String]) -> io::Result<()> {
        self.writer.write_record(row).map_err(io::Error::from)?;
        self.rows += 1;
        Ok(())
    }

    /// Data rows written so far, header excluded
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush everything to disk and hand the file over for archiving
    pub fn finish(self) -> io::Result<CompletedArtifact> {
        let file = self
            .writer
            .into_inner()
            .map_err(|e| io::Error::new(e.error().kind(), e.error().to_string()))?;
        file.sync_all()?;

        Ok(CompletedArtifact {
            path: self.path,
            rows: self.rows,
        })
    }
}

/// Fully written artifact awaiting the aggregator
#[derive(Debug)]
pub struct CompletedArtifact {
    path: TempPath,
    rows: u64,
}

impl CompletedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn open(&self) -> io::Result<File> {
        File::open(&self.path)
    }

    /// Delete the file now, reporting failure instead of ignoring it on drop
    pub fn remove(self) -> io::Result<()> {
        self.path.close()
    }
}
