use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::errors::{Error, ParseError};


/// The change classes a delta file can carry. Every (job, source, action)
/// triple maps to exactly one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    New,
    Update,
    Delete,
    Kill,
    Enrich,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::New => "new",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Kill => "kill",
            Action::Enrich => "enrich",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}


/// Append-only JSONL writer for one delta file.
///
/// Files are named `{prefix}-{index}-{action}.json` where the prefix is the
/// job id (or a timestamp when a file is imported outside a job). Appending
/// keeps a retried job idempotent: the same job id produces the same path.
pub struct DeltaWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    count: usize,
}

impl DeltaWriter {
    pub fn open(dir: &Path, prefix: &str, index: &str, action: Action) -> Result<DeltaWriter, Error> {
        let path = dir.join(format!("{prefix}-{index}-{action}.json"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "Opened delta file");

        Ok(DeltaWriter {
            path,
            writer: BufWriter::new(file),
            count: 0,
        })
    }

    /// Appends one record as a single JSON line
    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<(), Error> {
        let line = serde_json::to_string(record).map_err(ParseError::Json)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(mut self) -> Result<PathBuf, Error> {
        self.writer.flush()?;
        Ok(self.path)
    }
}
