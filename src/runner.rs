use std::path::Path;
use std::time::Instant;

use serde_json::Value;
use tracing::{error, info};

use crate::audit::AuditState;
use crate::delta::Action;
use crate::errors::Error;
use crate::lock::{LockRecord, LockStatus};
use crate::manifest::{JobFile, JobManifest};
use crate::meta::ActionMeta;
use crate::store::{Store, TableKind};
use crate::{move_file, JobContext, Pipeline};


impl<S: Store> Pipeline<S> {
    /// Processes one job manifest end to end.
    ///
    /// Returns false without side effects when another runner holds a live
    /// lock. A stale lock from a crashed run is recovered first: the
    /// recorded manifest is quarantined and the lock removed, then this
    /// job proceeds.
    pub fn run_job(&mut self, job_file: &Path, tabula_rasa: bool) -> Result<bool, Error> {
        let text = std::fs::read_to_string(job_file)?;
        let manifest = JobManifest::parse(&text)?;

        // resolve every referenced source up front, an unknown source is a
        // configuration error and must fail before anything runs
        for file in manifest.imports.iter().chain(manifest.deletes.iter()) {
            self.settings.source(&file.source)?;
        }

        self.job = JobContext {
            id: manifest.id.clone(),
            supplier: manifest.data_supplier.clone(),
            date: manifest.date,
            tabula_rasa: manifest.tabula_rasa || tabula_rasa,
        };
        self.audit.set_job(&manifest.id, manifest.date);

        match self.lock.status()? {
            LockStatus::Live(record) => {
                info!(job = %record.job.display(), pid = record.pid, "Another runner is active, backing off");
                return Ok(false);
            }
            LockStatus::Stale(record) => self.recover_crashed_run(&record)?,
            LockStatus::Free => {}
        }

        self.lock.acquire(job_file)?;
        self.notifier
            .post(&format!("*Percolator* started `{}`", job_file.display()));
        self.audit.job_event(AuditState::Start, &job_file.display().to_string());

        self.process_import_files(&manifest.imports);
        self.process_delete_files(&manifest.deletes);

        self.finish_job(&manifest)?;
        Ok(true)
    }

    /// A lock without a living process means the previous run died
    /// mid-job. Its manifest moves to the failed directory so the
    /// scheduler cannot pick it up again, then the lock goes away.
    fn recover_crashed_run(&mut self, record: &LockRecord) -> Result<(), Error> {
        error!(
            job = %record.job.display(),
            pid = record.pid,
            "Previous run crashed, quarantining its job file"
        );

        if record.job.is_file() {
            let name = record
                .job
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| "unknown.json".to_string());
            move_file(&record.job, &self.settings.paths.failed.join(name))?;
        }

        self.audit.job_event(
            AuditState::Fail,
            &format!("crashed run quarantined: {}", record.job.display()),
        );
        self.lock.remove_stale()?;
        Ok(())
    }

    fn process_import_files(&mut self, files: &[JobFile]) {
        for file in files {
            if let Err(err) = self.import_file(file) {
                self.mark_file_failed(file, &err);
            }
        }
    }

    fn process_delete_files(&mut self, files: &[JobFile]) {
        for file in files {
            if let Err(err) = self.delete_file(file) {
                self.mark_file_failed(file, &err);
            }
        }
    }

    /// A failed file never aborts the job, the remaining files still run
    fn mark_file_failed(&mut self, file: &JobFile, err: &Error) {
        error!(
            file = file.filename,
            source = file.source,
            %err,
            "Import of file failed"
        );
        self.meta.set_text(&file.source, &file.filename, "status", "failed");

        let (index, code) = match self.settings.source(&file.source) {
            Ok(source) => (source.index().to_string(), source.code.clone()),
            Err(_) => (String::new(), String::new()),
        };
        self.audit
            .record(AuditState::Fail, "percolator", &index, &code, &err.to_string());
    }

    fn import_file(&mut self, file: &JobFile) -> Result<(), Error> {
        self.set_source(&file.source)?;
        self.filename = file.filename.clone();

        let in_path = self.settings.paths.incoming_file(&file.filename);
        self.meta
            .set_text(&file.source, &file.filename, "in", &in_path.display().to_string());

        if self.job.tabula_rasa {
            self.tabula_rasa_import(&in_path)
        }
        else {
            self.normal_import(&in_path)
        }
    }

    /// Stage into import, move the input aside, then dedupe, diff and
    /// apply
    fn normal_import(&mut self, in_path: &Path) -> Result<(), Error> {
        let source = self.current_source()?;

        self.stage(TableKind::Import, in_path)?;
        self.audit.record(
            AuditState::Import,
            "percolator",
            source.index(),
            &source.code,
            &in_path.display().to_string(),
        );

        let filename = self.filename.clone();
        let processed = self.move_to_processed(&filename)?;
        let scope_source = self.source.clone();
        self.meta
            .set_text(&scope_source, &filename, "out", &processed.display().to_string());

        self.dedupe(TableKind::Import)?;
        let changes = self.diff()?;
        self.handle_changes(&changes)
    }

    /// Full rebuild: current is truncated and reloaded straight from the
    /// file, and the whole table is emitted as one new delta. The taxon
    /// cache restarts empty because every cached group may have changed.
    fn tabula_rasa_import(&mut self, in_path: &Path) -> Result<(), Error> {
        let source = self.current_source()?;
        let start = Instant::now();

        self.stage(TableKind::Current, in_path)?;
        self.audit.record(
            AuditState::Import,
            "percolator",
            source.index(),
            &source.code,
            &in_path.display().to_string(),
        );

        let filename = self.filename.clone();
        let processed = self.move_to_processed(&filename)?;
        let scope_source = self.source.clone();
        self.meta
            .set_text(&scope_source, &filename, "out", &processed.display().to_string());

        self.dedupe(TableKind::Current)?;
        self.store.build_indexes(&source, TableKind::Current)?;
        self.cache.clear()?;

        let mut delta = self.open_delta(source.index(), Action::New)?;
        let records = self.store.current_records(&source)?;
        let count = records.len();
        for rec in records {
            let rec: Value = if source.consumes_enrichments() {
                self.enrich_record(rec, &source.src_enrich)?
            }
            else {
                rec
            };
            delta.append(&rec)?;
        }

        let file = delta.finish()?;
        info!(file = %file.display(), count, "Wrote tabula rasa export");
        self.meta.set_action(
            &scope_source,
            &filename,
            "new",
            ActionMeta {
                count,
                file: Some(file.display().to_string()),
                elapsed: start.elapsed().as_secs_f64(),
            },
        );

        Ok(())
    }

    fn delete_file(&mut self, file: &JobFile) -> Result<(), Error> {
        self.set_source(&file.source)?;
        self.filename = file.filename.clone();

        let in_path = self.settings.paths.incoming_file(&file.filename);
        self.meta
            .set_text(&file.source, &file.filename, "in", &in_path.display().to_string());

        self.handle_explicit_deletes(&in_path)?;

        let processed = self.move_to_processed(&file.filename)?;
        self.meta
            .set_text(&file.source, &file.filename, "out", &processed.display().to_string());
        Ok(())
    }

    /// Writes the finalized manifest with the percolator meta into the
    /// done directory and hands the cycle back by releasing the lock
    fn finish_job(&mut self, manifest: &JobManifest) -> Result<(), Error> {
        let done = manifest.finalize(&self.meta)?;
        let done_path = self.settings.paths.done.join(format!("{}.json", self.job.id));
        std::fs::write(&done_path, serde_json::to_string(&done).map_err(crate::errors::ParseError::Json)?)?;

        let pretty = serde_json::to_string_pretty(&serde_json::to_value(&self.meta).unwrap_or_default())
            .unwrap_or_default();
        self.notifier.post(&format!(
            "*Percolator* finished `{job}` ```{pretty}```",
            job = self.job.id
        ));
        self.audit.job_event(AuditState::Finish, &done_path.display().to_string());
        info!(job = self.job.id, done = %done_path.display(), "Job finished");

        self.lock.release()?;
        Ok(())
    }
}
