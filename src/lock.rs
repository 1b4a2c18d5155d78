use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{Error, ParseError};


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub job: PathBuf,
    pub pid: u32,
}

#[derive(Debug)]
pub enum LockStatus {
    Free,
    /// The recorded pid still runs, another runner owns the cycle
    Live(LockRecord),
    /// The recorded pid is gone, the previous run crashed
    Stale(LockRecord),
}


/// Serialises job runners through a `.lock` file in the jobs directory.
/// The lock carries the manifest path and the owning pid so a later runner
/// can tell a busy predecessor from a crashed one.
#[derive(Debug, Clone)]
pub struct JobLock {
    path: PathBuf,
}

impl JobLock {
    pub fn new(jobs_dir: &Path) -> JobLock {
        JobLock {
            path: jobs_dir.join(".lock"),
        }
    }

    pub fn status(&self) -> Result<LockStatus, Error> {
        if !self.path.exists() {
            return Ok(LockStatus::Free);
        }

        let text = std::fs::read_to_string(&self.path)?;
        let record: LockRecord = serde_json::from_str(&text).map_err(ParseError::Json)?;

        if pid_alive(record.pid) {
            info!(pid = record.pid, job = %record.job.display(), "Runner still processing");
            Ok(LockStatus::Live(record))
        }
        else {
            Ok(LockStatus::Stale(record))
        }
    }

    /// Create-if-absent acquisition. Fails when a lock file already exists,
    /// whether live or stale; callers resolve staleness through status().
    pub fn acquire(&self, job: &Path) -> Result<(), Error> {
        let record = LockRecord {
            job: job.to_path_buf(),
            pid: std::process::id(),
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        file.write_all(serde_json::to_string(&record).map_err(ParseError::Json)?.as_bytes())?;
        Ok(())
    }

    pub fn release(&self) -> Result<(), Error> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    pub fn remove_stale(&self) -> Result<(), Error> {
        self.release()
    }
}

/// Signal-zero style liveness probe. The runner only ever runs on one
/// machine, so looking up the pid on the local procfs is enough.
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}
