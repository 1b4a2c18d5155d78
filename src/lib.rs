pub mod audit;
pub mod dedupe;
pub mod delta;
pub mod differ;
pub mod enrich;
pub mod errors;
pub mod lock;
pub mod manifest;
pub mod meta;
pub mod mutator;
pub mod notifier;
pub mod registry;
pub mod runner;
pub mod settings;
pub mod stager;
pub mod store;
pub mod utils;

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::audit::AuditLog;
use crate::delta::{Action, DeltaWriter};
use crate::enrich::cache::TaxonCache;
use crate::errors::{ConfigError, Error};
use crate::lock::JobLock;
use crate::meta::PercolatorMeta;
use crate::notifier::Notifier;
use crate::settings::{Settings, Source};
use crate::store::Store;


/// The job currently being processed
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: String,
    pub supplier: String,
    pub date: DateTime<Utc>,
    pub tabula_rasa: bool,
}

impl Default for JobContext {
    fn default() -> JobContext {
        JobContext {
            id: String::new(),
            supplier: String::new(),
            date: Utc::now(),
            tabula_rasa: false,
        }
    }
}


/// Everything a job needs, created once at startup and passed around
/// explicitly. The store is the only component holding relational state;
/// the cache is wiped on construction so stale taxa cannot survive a
/// restart.
pub struct Pipeline<S> {
    pub settings: Settings,
    pub store: S,
    pub cache: TaxonCache,
    pub audit: AuditLog,
    pub notifier: Notifier,
    pub lock: JobLock,
    pub meta: PercolatorMeta,
    pub job: JobContext,

    /// The source and filename currently being processed, used to scope
    /// meta breadcrumbs
    pub source: String,
    pub filename: String,
}

impl<S: Store> Pipeline<S> {
    pub fn new(settings: Settings, store: S) -> Result<Pipeline<S>, Error> {
        if !settings.paths.delta.is_dir() {
            return Err(ConfigError::MissingDeltaDir(settings.paths.delta.display().to_string()).into());
        }

        let cache = TaxonCache::open(&settings.paths.cache)?;
        let lock = JobLock::new(&settings.paths.jobs);

        Ok(Pipeline {
            settings,
            store,
            cache,
            audit: AuditLog::connect()?,
            notifier: Notifier::from_env(),
            lock,
            meta: PercolatorMeta::default(),
            job: JobContext::default(),
            source: String::new(),
            filename: String::new(),
        })
    }

    /// Selects the source for subsequent file work
    pub fn set_source(&mut self, name: &str) -> Result<(), Error> {
        let source = self.settings.source(name)?;
        self.source = source.name.clone();
        Ok(())
    }

    /// The configuration of the currently selected source
    pub fn current_source(&self) -> Result<Source, Error> {
        Ok(self.settings.source(&self.source)?.clone())
    }

    /// Delta files are named after the job when there is one, otherwise a
    /// timestamp keeps concurrent manual imports apart
    pub fn delta_prefix(&self) -> String {
        if self.job.id.is_empty() {
            Utc::now().format("%Y%m%d%H%M%S").to_string()
        }
        else {
            self.job.id.clone()
        }
    }

    /// Opens a delta file and registers it with the job's produced outputs
    pub fn open_delta(&mut self, index: &str, action: Action) -> Result<DeltaWriter, Error> {
        let writer = DeltaWriter::open(&self.settings.paths.delta, &self.delta_prefix(), index, action)?;
        self.meta.add_outfile(writer.path());
        Ok(writer)
    }

    /// Runs `work` inside one store transaction, rolling back on failure
    pub fn transaction<T, F>(&mut self, work: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Self) -> Result<T, Error>,
    {
        self.store.begin()?;
        match work(self) {
            Ok(value) => {
                self.store.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self.store.rollback() {
                    tracing::error!(%rollback, "Failed to roll back after an error");
                }
                Err(err)
            }
        }
    }

    /// Moves a staged input out of the incoming directory
    pub fn move_to_processed(&self, filename: &str) -> Result<PathBuf, Error> {
        let from = self.settings.paths.incoming_file(filename);
        let to = self.settings.paths.processed_file(filename);
        move_file(&from, &to)?;
        Ok(to)
    }
}

/// Rename with a copy fallback for when the directories live on
/// different filesystems
pub(crate) fn move_file(from: &std::path::Path, to: &std::path::Path) -> Result<(), Error> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)?;
            Ok(())
        }
    }
}
