use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, error, info};

use crate::audit::AuditState;
use crate::errors::Error;
use crate::store::{Store, TableKind};
use crate::Pipeline;


/// A matched update: the replacement row in import and the row it
/// supersedes in current
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdatePair {
    pub import_id: i64,
    pub current_id: i64,
}

/// The differ's verdict over one import set, three disjoint maps keyed by
/// logical id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Logical id absent from current, mapped to the import row
    pub new: BTreeMap<String, i64>,

    /// Logical id present in current with different content
    pub update: BTreeMap<String, UpdatePair>,

    /// Logical id present in current but gone from a complete import
    pub delete: BTreeMap<String, i64>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

impl<S: Store> Pipeline<S> {
    /// Classifies every record in the import set by comparing content
    /// hashes against current.
    ///
    /// Import rows whose hash is unknown to current are new or updated;
    /// which of the two is decided by looking up the logical id. Current
    /// rows whose hash is unknown to the import set are updated or deleted,
    /// but only for sources shipping complete datasets: incremental
    /// suppliers never announce deletions implicitly, so for them the
    /// second pass is skipped and the delete map stays empty.
    pub fn diff(&mut self) -> Result<ChangeSet, Error> {
        let source = self.current_source()?;
        let mut changes = ChangeSet::default();

        let lap = Instant::now();
        let candidates = self.store.import_orphans(&source)?;
        debug!(
            source = source.name,
            count = candidates.len(),
            elapsed = lap.elapsed().as_secs_f64(),
            "Finished left outer join on import"
        );

        for candidate in candidates {
            if candidate.hash.is_none() {
                error!(row = candidate.id, "Empty hash in import candidate");
                self.audit.record(
                    AuditState::Fail,
                    "percolator",
                    source.index(),
                    &source.code,
                    &format!("empty hash on import row {}", candidate.id),
                );
                continue;
            }

            let Some(row) = self.store.fetch(&source, TableKind::Import, candidate.id)? else {
                continue;
            };
            let Some(logical_id) = row.logical_id(&source) else {
                error!(row = candidate.id, "Record is missing the id attribute");
                self.audit.record(
                    AuditState::Fail,
                    "percolator",
                    source.index(),
                    &source.code,
                    &format!("missing {} on import row {}", source.id_field, candidate.id),
                );
                continue;
            };

            let existing = self.store.find_by_logical_id(&source, TableKind::Current, &logical_id)?;
            match existing {
                Some(old) if source.incremental => {
                    debug!(oldid = old.id, newid = row.id, "Update");
                    changes.update.insert(
                        logical_id,
                        UpdatePair {
                            import_id: row.id,
                            current_id: old.id,
                        },
                    );
                }
                // for complete datasets the matching current row turns up
                // in the second pass and promotes this entry to an update
                _ => {
                    changes.new.insert(logical_id, row.id);
                }
            }
        }

        if !source.incremental {
            let lap = Instant::now();
            let candidates = self.store.current_orphans(&source)?;
            debug!(
                source = source.name,
                count = candidates.len(),
                elapsed = lap.elapsed().as_secs_f64(),
                "Finished right outer join on current"
            );

            for candidate in candidates {
                if candidate.hash.is_none() {
                    error!(row = candidate.id, "Empty hash in current candidate");
                    self.audit.record(
                        AuditState::Fail,
                        "percolator",
                        source.index(),
                        &source.code,
                        &format!("empty hash on current row {}", candidate.id),
                    );
                    continue;
                }

                let Some(row) = self.store.fetch(&source, TableKind::Current, candidate.id)? else {
                    continue;
                };
                let Some(logical_id) = row.logical_id(&source) else {
                    continue;
                };

                match changes.new.remove(&logical_id) {
                    Some(import_id) => {
                        changes.update.insert(
                            logical_id,
                            UpdatePair {
                                import_id,
                                current_id: row.id,
                            },
                        );
                    }
                    None => {
                        changes.delete.insert(logical_id, row.id);
                    }
                }
            }
        }

        if changes.is_empty() {
            info!(source = source.name, elapsed = lap.elapsed().as_secs_f64(), "No changes");
        }
        else {
            info!(
                source = source.name,
                new = changes.new.len(),
                updated = changes.update.len(),
                removed = changes.delete.len(),
                "Classified changes"
            );
        }

        Ok(changes)
    }
}
