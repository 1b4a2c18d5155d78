use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

use chrono::Utc;
use serde_json::Value;

use super::{DuplicateGroup, HashedId, Store, StoredRecord, TableKind};
use crate::errors::{Error, ParseError};
use crate::registry::{DeleteStatus, DeletionEntry};
use crate::settings::Source;


#[derive(Debug, Clone, Default)]
struct Table {
    rows: Vec<StoredRecord>,
    next_id: i64,
}

impl Table {
    fn insert(&mut self, rec: Value, hash: Option<String>) -> i64 {
        self.next_id += 1;
        self.rows.push(StoredRecord {
            id: self.next_id,
            rec,
            hash,
            datum: Utc::now(),
        });
        self.next_id
    }
}

#[derive(Debug, Clone, Default)]
struct State {
    tables: HashMap<String, Table>,
    deletions: HashMap<String, DeletionEntry>,
}


/// An in-memory mirror of the Postgres store used by the test suite.
///
/// Hashing matches the server-side `md5(rec::text)` by digesting the
/// compact JSON text, and row ids are monotonic per table so the
/// last-insert-wins rules behave the same.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: State,
    snapshots: Vec<State>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    fn table(&mut self, source: &Source, kind: TableKind) -> &mut Table {
        self.state.tables.entry(kind.table(source)).or_default()
    }

    /// Inserts a record directly, the shortcut tests use to seed state
    pub fn insert(&mut self, source: &Source, kind: TableKind, rec: Value) -> i64 {
        let hash = Some(content_hash(&rec));
        self.table(source, kind).insert(rec, hash)
    }
}

pub fn content_hash(rec: &Value) -> String {
    let text = serde_json::to_string(rec).unwrap_or_default();
    format!("{:x}", md5::compute(text.as_bytes()))
}

fn logical_id(source: &Source, rec: &Value) -> Option<String> {
    rec.get(&source.id_field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// jsonb `@>` containment for the two shapes the pipeline queries
fn accepted_name_matches(rec: &Value, name_group: &str) -> bool {
    rec.pointer("/acceptedName/scientificNameGroup")
        .and_then(Value::as_str)
        == Some(name_group)
}

fn identifications_match(rec: &Value, name_group: &str) -> bool {
    let Some(identifications) = rec.get("identifications").and_then(Value::as_array) else {
        return false;
    };
    identifications.iter().any(|identification| {
        identification
            .pointer("/scientificName/scientificNameGroup")
            .and_then(Value::as_str)
            == Some(name_group)
    })
}

impl Store for MemoryStore {
    fn ensure_schema(&mut self, sources: &[Source]) -> Result<(), Error> {
        for source in sources {
            for kind in [TableKind::Import, TableKind::Current] {
                self.state.tables.entry(kind.table(source)).or_default();
            }
        }
        Ok(())
    }

    fn truncate(&mut self, source: &Source, kind: TableKind) -> Result<(), Error> {
        let table = self.table(source, kind);
        table.rows.clear();
        Ok(())
    }

    fn prepare_load(&mut self, _source: &Source, _kind: TableKind) -> Result<(), Error> {
        Ok(())
    }

    fn bulk_load(&mut self, source: &Source, kind: TableKind, datafile: &Path) -> Result<usize, Error> {
        let file = std::fs::File::open(datafile)?;
        let reader = BufReader::new(file);

        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let rec: Value = serde_json::from_str(&line).map_err(ParseError::Json)?;
            records.push(rec);
        }

        let table = self.table(source, kind);
        let count = records.len();
        for rec in records {
            table.insert(rec, None);
        }
        Ok(count)
    }

    fn hash_rows(&mut self, source: &Source, kind: TableKind) -> Result<usize, Error> {
        let table = self.table(source, kind);
        for row in table.rows.iter_mut() {
            row.hash = Some(content_hash(&row.rec));
        }
        Ok(table.rows.len())
    }

    fn build_indexes(&mut self, _source: &Source, _kind: TableKind) -> Result<(), Error> {
        Ok(())
    }

    fn count(&mut self, source: &Source, kind: TableKind) -> Result<usize, Error> {
        Ok(self.table(source, kind).rows.len())
    }

    fn duplicate_groups(&mut self, source: &Source, kind: TableKind) -> Result<Vec<DuplicateGroup>, Error> {
        let mut groups: Vec<(String, Vec<i64>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for row in &self.table(source, kind).rows {
            let Some(recid) = logical_id(source, &row.rec) else {
                continue;
            };
            match index.get(&recid) {
                Some(at) => groups[*at].1.push(row.id),
                None => {
                    index.insert(recid.clone(), groups.len());
                    groups.push((recid, vec![row.id]));
                }
            }
        }

        Ok(groups
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(logical_id, row_ids)| DuplicateGroup { logical_id, row_ids })
            .collect())
    }

    fn delete_rows(&mut self, source: &Source, kind: TableKind, row_ids: &[i64]) -> Result<usize, Error> {
        let table = self.table(source, kind);
        let before = table.rows.len();
        table.rows.retain(|row| !row_ids.contains(&row.id));
        Ok(before - table.rows.len())
    }

    fn import_orphans(&mut self, source: &Source) -> Result<Vec<HashedId>, Error> {
        let current_hashes: Vec<String> = self
            .table(source, TableKind::Current)
            .rows
            .iter()
            .filter_map(|row| row.hash.clone())
            .collect();

        Ok(self
            .table(source, TableKind::Import)
            .rows
            .iter()
            .filter(|row| match &row.hash {
                Some(hash) => !current_hashes.contains(hash),
                None => true,
            })
            .map(|row| HashedId {
                id: row.id,
                hash: row.hash.clone(),
            })
            .collect())
    }

    fn current_orphans(&mut self, source: &Source) -> Result<Vec<HashedId>, Error> {
        let import_hashes: Vec<String> = self
            .table(source, TableKind::Import)
            .rows
            .iter()
            .filter_map(|row| row.hash.clone())
            .collect();

        Ok(self
            .table(source, TableKind::Current)
            .rows
            .iter()
            .filter(|row| match &row.hash {
                Some(hash) => !import_hashes.contains(hash),
                None => true,
            })
            .map(|row| HashedId {
                id: row.id,
                hash: row.hash.clone(),
            })
            .collect())
    }

    fn fetch(&mut self, source: &Source, kind: TableKind, row_id: i64) -> Result<Option<StoredRecord>, Error> {
        Ok(self
            .table(source, kind)
            .rows
            .iter()
            .find(|row| row.id == row_id)
            .cloned())
    }

    fn find_by_logical_id(
        &mut self,
        source: &Source,
        kind: TableKind,
        needle: &str,
    ) -> Result<Option<StoredRecord>, Error> {
        Ok(self
            .table(source, kind)
            .rows
            .iter()
            .find(|row| logical_id(source, &row.rec).as_deref() == Some(needle))
            .cloned())
    }

    fn delete_row(&mut self, source: &Source, kind: TableKind, row_id: i64) -> Result<(), Error> {
        self.table(source, kind).rows.retain(|row| row.id != row_id);
        Ok(())
    }

    fn copy_to_current(&mut self, source: &Source, import_id: i64) -> Result<(), Error> {
        let Some(row) = self.fetch(source, TableKind::Import, import_id)? else {
            return Ok(());
        };
        let table = self.table(source, TableKind::Current);
        table.next_id += 1;
        table.rows.push(StoredRecord {
            id: table.next_id,
            rec: row.rec,
            hash: row.hash,
            datum: row.datum,
        });
        Ok(())
    }

    fn replace_current(&mut self, source: &Source, import_id: i64, current_id: i64) -> Result<(), Error> {
        let Some(import_row) = self.fetch(source, TableKind::Import, import_id)? else {
            return Ok(());
        };
        let table = self.table(source, TableKind::Current);
        if let Some(row) = table.rows.iter_mut().find(|row| row.id == current_id) {
            row.rec = import_row.rec;
            row.hash = import_row.hash;
            row.datum = import_row.datum;
        }
        Ok(())
    }

    fn current_records(&mut self, source: &Source) -> Result<Vec<Value>, Error> {
        Ok(self
            .table(source, TableKind::Current)
            .rows
            .iter()
            .map(|row| row.rec.clone())
            .collect())
    }

    fn taxa_by_name_group(&mut self, source: &Source, name_group: &str) -> Result<Vec<Value>, Error> {
        Ok(self
            .table(source, TableKind::Current)
            .rows
            .iter()
            .filter(|row| accepted_name_matches(&row.rec, name_group))
            .map(|row| row.rec.clone())
            .collect())
    }

    fn impacted_records(&mut self, source: &Source, name_group: &str) -> Result<Vec<StoredRecord>, Error> {
        Ok(self
            .table(source, TableKind::Current)
            .rows
            .iter()
            .filter(|row| identifications_match(&row.rec, name_group))
            .cloned()
            .collect())
    }

    fn upsert_deletion(&mut self, recid: &str, status: DeleteStatus) -> Result<(), Error> {
        self.state
            .deletions
            .entry(recid.to_string())
            .and_modify(|entry| {
                entry.count += 1;
                entry.status = DeleteStatus::supersede(entry.status, status);
                entry.datum = Utc::now();
            })
            .or_insert_with(|| DeletionEntry {
                recid: recid.to_string(),
                status,
                count: 1,
                datum: Utc::now(),
            });
        Ok(())
    }

    fn deletion(&mut self, recid: &str) -> Result<Option<DeletionEntry>, Error> {
        Ok(self.state.deletions.get(recid).cloned())
    }

    fn truncate_deletions(&mut self) -> Result<(), Error> {
        self.state.deletions.clear();
        Ok(())
    }

    fn begin(&mut self) -> Result<(), Error> {
        self.snapshots.push(self.state.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.snapshots.pop();
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        if let Some(snapshot) = self.snapshots.pop() {
            self.state = snapshot;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn specimen_source() -> Source {
        Source {
            name: "test-specimen".to_string(),
            table: "testspecimen".to_string(),
            id_field: "id".to_string(),
            code: "TEST".to_string(),
            index: Some("specimen".to_string()),
            incremental: false,
            src_enrich: vec![],
            dst_enrich: vec![],
        }
    }

    #[test]
    fn hashes_match_between_equal_documents() {
        let source = specimen_source();
        let mut store = MemoryStore::new();

        store.insert(&source, TableKind::Current, json!({"id": "a", "v": 1}));
        store.insert(&source, TableKind::Import, json!({"id": "a", "v": 1}));
        store.hash_rows(&source, TableKind::Import).unwrap();

        assert!(store.import_orphans(&source).unwrap().is_empty());
        assert!(store.current_orphans(&source).unwrap().is_empty());
    }

    #[test]
    fn unhashed_rows_are_orphans() {
        let source = specimen_source();
        let mut store = MemoryStore::new();

        let dir = tempfile::tempdir().unwrap();
        let datafile = dir.path().join("in.json");
        std::fs::write(&datafile, "{\"id\": \"a\"}\n{\"id\": \"b\"}\n").unwrap();

        let count = store.bulk_load(&source, TableKind::Import, &datafile).unwrap();
        assert_eq!(count, 2);

        // before hashing every loaded row has a null hash
        let orphans = store.import_orphans(&source).unwrap();
        assert_eq!(orphans.len(), 2);
        assert!(orphans.iter().all(|orphan| orphan.hash.is_none()));
    }

    #[test]
    fn rollback_restores_the_snapshot() {
        let source = specimen_source();
        let mut store = MemoryStore::new();
        store.insert(&source, TableKind::Current, json!({"id": "a"}));

        store.begin().unwrap();
        store.insert(&source, TableKind::Current, json!({"id": "b"}));
        store.upsert_deletion("a", DeleteStatus::Rejected).unwrap();
        store.rollback().unwrap();

        assert_eq!(store.count(&source, TableKind::Current).unwrap(), 1);
        assert!(store.deletion("a").unwrap().is_none());
    }

    #[test]
    fn containment_queries() {
        let source = specimen_source();
        let mut store = MemoryStore::new();

        store.insert(
            &source,
            TableKind::Current,
            json!({
                "id": "t1",
                "acceptedName": {"scientificNameGroup": "larus fuscus"},
            }),
        );
        store.insert(
            &source,
            TableKind::Current,
            json!({
                "id": "s1",
                "identifications": [
                    {"scientificName": {"scientificNameGroup": "larus fuscus"}}
                ],
            }),
        );

        let taxa = store.taxa_by_name_group(&source, "larus fuscus").unwrap();
        assert_eq!(taxa.len(), 1);
        assert_eq!(taxa[0]["id"], "t1");

        let impacted = store.impacted_records(&source, "larus fuscus").unwrap();
        assert_eq!(impacted.len(), 1);
        assert_eq!(impacted[0].rec["id"], "s1");

        assert!(store.taxa_by_name_group(&source, "unknown").unwrap().is_empty());
    }
}
