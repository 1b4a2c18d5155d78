use std::io::BufRead;
use std::path::Path;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::audit::AuditState;
use crate::delta::Action;
use crate::differ::ChangeSet;
use crate::errors::Error;
use crate::meta::ActionMeta;
use crate::registry::{DeleteRecord, DeleteStatus};
use crate::store::{Store, TableKind};
use crate::utils::new_progress_bar;
use crate::Pipeline;


impl<S: Store> Pipeline<S> {
    /// Applies a classified change set to current, in the order the delta
    /// consumers rely on: inserts land first, then replacements, and
    /// deletions last so their fan-out sees the settled table.
    pub fn handle_changes(&mut self, changes: &ChangeSet) -> Result<(), Error> {
        if !changes.new.is_empty() {
            self.handle_new(changes)?;
        }
        if !changes.update.is_empty() {
            self.handle_updates(changes)?;
        }

        // only sources shipping complete datasets delete implicitly
        let source = self.current_source()?;
        if !source.incremental && !changes.delete.is_empty() {
            self.handle_deletes(changes)?;
        }

        Ok(())
    }

    /// Copies every new row from import into current and appends the
    /// (optionally enriched) record to the new delta file. Taxon records
    /// also land in the enrichment cache so later lookups see them.
    pub fn handle_new(&mut self, changes: &ChangeSet) -> Result<(), Error> {
        let source = self.current_source()?;
        let mut delta = self.open_delta(source.index(), Action::New)?;
        let bar = new_progress_bar(changes.new.len(), "Inserting new records");
        let start = Instant::now();

        self.transaction(|pp| {
            for (logical_id, import_id) in &changes.new {
                let Some(row) = pp.store.fetch(&source, TableKind::Import, *import_id)? else {
                    warn!(logical_id, import_id, "New record vanished from import");
                    continue;
                };

                let mut rec = row.rec;
                if source.consumes_enrichments() {
                    rec = pp.enrich_record(rec, &source.src_enrich)?;
                }

                pp.store.copy_to_current(&source, *import_id)?;
                delta.append(&rec)?;

                if source.produces_enrichments() {
                    pp.cache_taxon(&rec, &source.code)?;
                }

                pp.audit
                    .record(AuditState::New, logical_id, source.index(), &source.code, "");
                debug!(recordid = logical_id, source = source.name, "New record inserted");
                bar.inc(1);
            }

            // the batch insert invalidates nothing but grows the table,
            // refresh the indexes for the fan-out queries that follow
            pp.store.build_indexes(&source, TableKind::Current)?;
            Ok(())
        })?;

        bar.finish();
        let file = delta.finish()?;
        let scope_source = self.source.clone();
        let scope_file = self.filename.clone();
        self.meta.set_action(
            &scope_source,
            &scope_file,
            "new",
            ActionMeta {
                count: changes.new.len(),
                file: Some(file.display().to_string()),
                elapsed: start.elapsed().as_secs_f64(),
            },
        );

        Ok(())
    }

    /// Replaces the matched current rows with their import counterparts.
    /// Changed taxon records additionally refresh the cache and fan out to
    /// every downstream source.
    pub fn handle_updates(&mut self, changes: &ChangeSet) -> Result<(), Error> {
        let source = self.current_source()?;
        let mut delta = self.open_delta(source.index(), Action::Update)?;
        let bar = new_progress_bar(changes.update.len(), "Updating records");
        let start = Instant::now();

        self.transaction(|pp| {
            for (logical_id, pair) in &changes.update {
                let Some(import_row) = pp.store.fetch(&source, TableKind::Import, pair.import_id)? else {
                    warn!(logical_id, "Updated record vanished from import");
                    continue;
                };
                // current is authoritative for what is being replaced; a
                // missing row means the pair is stale and gets skipped
                if pp.store.fetch(&source, TableKind::Current, pair.current_id)?.is_none() {
                    warn!(logical_id, current_id = pair.current_id, "Update target missing from current");
                    continue;
                }

                let mut rec = import_row.rec;
                if source.consumes_enrichments() {
                    rec = pp.enrich_record(rec, &source.src_enrich)?;
                }

                pp.store.replace_current(&source, pair.import_id, pair.current_id)?;
                delta.append(&rec)?;

                if source.produces_enrichments() {
                    pp.cache_taxon(&rec, &source.code)?;
                    for downstream in &source.dst_enrich {
                        debug!(source = downstream, "Enriching downstream source");
                        pp.handle_impacted(downstream, &rec)?;
                    }
                }

                pp.audit
                    .record(AuditState::Update, logical_id, source.index(), &source.code, "");
                debug!(recordid = logical_id, source = source.name, "Updated record");
                bar.inc(1);
            }
            Ok(())
        })?;

        bar.finish();
        let file = delta.finish()?;
        let scope_source = self.source.clone();
        let scope_file = self.filename.clone();
        self.meta.set_action(
            &scope_source,
            &scope_file,
            "update",
            ActionMeta {
                count: changes.update.len(),
                file: Some(file.display().to_string()),
                elapsed: start.elapsed().as_secs_f64(),
            },
        );

        Ok(())
    }

    /// Removes records that disappeared from a complete dataset. Each one
    /// is registered as REJECTED, written to the delete delta file as a
    /// structured delete record, and fanned out when it was a taxon.
    pub fn handle_deletes(&mut self, changes: &ChangeSet) -> Result<(), Error> {
        let source = self.current_source()?;
        let mut delta = self.open_delta(source.index(), Action::Delete)?;
        let bar = new_progress_bar(changes.delete.len(), "Removing records");
        let start = Instant::now();

        self.transaction(|pp| {
            for (logical_id, current_id) in &changes.delete {
                let Some(row) = pp.store.fetch(&source, TableKind::Current, *current_id)? else {
                    continue;
                };

                delta.append(&DeleteRecord::new(logical_id, &source.code, DeleteStatus::Rejected))?;
                pp.store.upsert_deletion(logical_id, DeleteStatus::Rejected)?;
                pp.store.delete_row(&source, TableKind::Current, *current_id)?;

                pp.audit
                    .record(AuditState::Delete, logical_id, source.index(), &source.code, "");

                if source.produces_enrichments() {
                    pp.evict_taxon(&row.rec, &source.code)?;
                    for downstream in &source.dst_enrich {
                        debug!(source = downstream, "Enriching downstream source");
                        pp.handle_impacted(downstream, &row.rec)?;
                    }
                }

                info!(recordid = logical_id, source = source.name, "Temporarily deleted record");
                bar.inc(1);
            }
            Ok(())
        })?;

        bar.finish();
        let file = delta.finish()?;
        let scope_source = self.source.clone();
        let scope_file = self.filename.clone();
        self.meta.set_action(
            &scope_source,
            &scope_file,
            "delete",
            ActionMeta {
                count: changes.delete.len(),
                file: Some(file.display().to_string()),
                elapsed: start.elapsed().as_secs_f64(),
            },
        );

        Ok(())
    }

    /// Processes a supplier's explicit delete list: one logical id per
    /// line. Every id is registered as REMOVED and written to the kill
    /// delta file whether or not current still holds the record.
    pub fn handle_explicit_deletes(&mut self, datafile: &Path) -> Result<(), Error> {
        let source = self.current_source()?;

        let file = std::fs::File::open(datafile)?;
        let mut delete_ids = Vec::new();
        for line in std::io::BufReader::new(file).lines() {
            let line = line?;
            let id = line.trim();
            if !id.is_empty() {
                delete_ids.push(id.to_string());
            }
        }

        let mut delta = self.open_delta(source.index(), Action::Kill)?;
        let start = Instant::now();

        self.transaction(|pp| {
            for delete_id in &delete_ids {
                delta.append(&DeleteRecord::new(delete_id, &source.code, DeleteStatus::Removed))?;
                pp.store.upsert_deletion(delete_id, DeleteStatus::Removed)?;

                pp.audit
                    .record(AuditState::Kill, delete_id, source.index(), &source.code, "");

                let old = pp.store.find_by_logical_id(&source, TableKind::Current, delete_id)?;
                if let Some(row) = old {
                    pp.store.delete_row(&source, TableKind::Current, row.id)?;

                    if source.produces_enrichments() {
                        pp.evict_taxon(&row.rec, &source.code)?;
                        for downstream in &source.dst_enrich {
                            debug!(source = downstream, "Enriching downstream source");
                            pp.handle_impacted(downstream, &row.rec)?;
                        }
                    }

                    info!(recordid = delete_id, source = source.name, "Permanently deleted record");
                }
            }
            Ok(())
        })?;

        let file = delta.finish()?;
        let scope_source = self.source.clone();
        let scope_file = self.filename.clone();
        self.meta.set_action(
            &scope_source,
            &scope_file,
            "kill",
            ActionMeta {
                count: delete_ids.len(),
                file: Some(file.display().to_string()),
                elapsed: start.elapsed().as_secs_f64(),
            },
        );

        Ok(())
    }

    /// Streams every current record of the selected source as JSONL,
    /// enriched when the source consumes enrichments. Serves the export
    /// command and the tabula rasa delta.
    pub fn export_records<W: std::io::Write>(&mut self, out: &mut W) -> Result<usize, Error> {
        let source = self.current_source()?;
        let records = self.store.current_records(&source)?;

        let mut count = 0;
        for rec in records {
            let rec: Value = if source.consumes_enrichments() {
                self.enrich_record(rec, &source.src_enrich)?
            }
            else {
                rec
            };
            serde_json::to_writer(&mut *out, &rec).map_err(crate::errors::ParseError::Json)?;
            out.write_all(b"\n")?;
            count += 1;
        }

        Ok(count)
    }
}
