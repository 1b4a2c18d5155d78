pub mod memory;
pub mod postgres;

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::Error;
use crate::registry::{DeleteStatus, DeletionEntry};
use crate::settings::Source;

pub use memory::MemoryStore;
pub use postgres::PgStore;


/// Which of a source's sibling tables an operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Import,
    Current,
}

impl TableKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            TableKind::Import => "import",
            TableKind::Current => "current",
        }
    }

    pub fn table(&self, source: &Source) -> String {
        format!("{}_{}", source.table, self.suffix())
    }
}


/// One row of an import or current table
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: i64,
    pub rec: Value,
    pub hash: Option<String>,
    pub datum: DateTime<Utc>,
}

impl StoredRecord {
    /// The value of the source's id attribute, when the record carries one
    pub fn logical_id(&self, source: &Source) -> Option<String> {
        self.rec
            .get(&source.id_field)
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// A row id paired with its content hash, as returned by the diff joins
#[derive(Debug, Clone, PartialEq)]
pub struct HashedId {
    pub id: i64,
    pub hash: Option<String>,
}

/// Rows sharing one logical id, ids in insertion order
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateGroup {
    pub logical_id: String,
    pub row_ids: Vec<i64>,
}


/// The seam between the pipeline and the relational store.
///
/// The Postgres implementation is authoritative; the in-memory one mirrors
/// its observable behavior so the pipeline logic can be tested hermetically.
/// All DDL is idempotent and every method is one atomic store call, the
/// transaction boundary is managed explicitly by the caller.
pub trait Store {
    /// Triggers creation of all table pairs and the delete registry
    fn ensure_schema(&mut self, sources: &[Source]) -> Result<(), Error>;

    fn truncate(&mut self, source: &Source, kind: TableKind) -> Result<(), Error>;

    /// Drops the indexes and relaxes NOT NULL on the hash column so the
    /// bulk load runs unencumbered
    fn prepare_load(&mut self, source: &Source, kind: TableKind) -> Result<(), Error>;

    /// Loads a newline-delimited JSON file, one document per row. Returns
    /// the number of rows loaded.
    fn bulk_load(&mut self, source: &Source, kind: TableKind, datafile: &Path) -> Result<usize, Error>;

    /// Sets `hash = md5(rec::text)` on every row
    fn hash_rows(&mut self, source: &Source, kind: TableKind) -> Result<usize, Error>;

    /// Rebuilds the hash btree, the logical id expression index, and the
    /// GIN indexes the source's enrichment wiring calls for
    fn build_indexes(&mut self, source: &Source, kind: TableKind) -> Result<(), Error>;

    fn count(&mut self, source: &Source, kind: TableKind) -> Result<usize, Error>;

    /// Logical ids that appear on more than one row
    fn duplicate_groups(&mut self, source: &Source, kind: TableKind) -> Result<Vec<DuplicateGroup>, Error>;

    fn delete_rows(&mut self, source: &Source, kind: TableKind, row_ids: &[i64]) -> Result<usize, Error>;

    /// Import rows whose hash does not occur in current (new or updated)
    fn import_orphans(&mut self, source: &Source) -> Result<Vec<HashedId>, Error>;

    /// Current rows whose hash does not occur in import (updated or deleted)
    fn current_orphans(&mut self, source: &Source) -> Result<Vec<HashedId>, Error>;

    fn fetch(&mut self, source: &Source, kind: TableKind, row_id: i64) -> Result<Option<StoredRecord>, Error>;

    fn find_by_logical_id(
        &mut self,
        source: &Source,
        kind: TableKind,
        logical_id: &str,
    ) -> Result<Option<StoredRecord>, Error>;

    fn delete_row(&mut self, source: &Source, kind: TableKind, row_id: i64) -> Result<(), Error>;

    /// Insert-select of one import row into current, hash and datum included
    fn copy_to_current(&mut self, source: &Source, import_id: i64) -> Result<(), Error>;

    /// Update-select replacing a current row with an import row in place
    fn replace_current(&mut self, source: &Source, import_id: i64, current_id: i64) -> Result<(), Error>;

    /// Every record in current, insertion order
    fn current_records(&mut self, source: &Source) -> Result<Vec<Value>, Error>;

    /// Taxon records matching `acceptedName @> {"scientificNameGroup": …}`
    fn taxa_by_name_group(&mut self, source: &Source, name_group: &str) -> Result<Vec<Value>, Error>;

    /// Consumer records whose identifications reference the name group,
    /// `identifications @> [{"scientificName":{"scientificNameGroup": …}}]`
    fn impacted_records(&mut self, source: &Source, name_group: &str) -> Result<Vec<StoredRecord>, Error>;

    /// Upsert into the delete registry: create with count 1, or increment
    /// and let REMOVED supersede REJECTED
    fn upsert_deletion(&mut self, recid: &str, status: DeleteStatus) -> Result<(), Error>;

    fn deletion(&mut self, recid: &str) -> Result<Option<DeletionEntry>, Error>;

    fn truncate_deletions(&mut self) -> Result<(), Error>;

    fn begin(&mut self) -> Result<(), Error>;
    fn commit(&mut self) -> Result<(), Error>;
    fn rollback(&mut self) -> Result<(), Error>;
}
