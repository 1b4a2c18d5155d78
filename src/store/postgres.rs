use std::path::Path;

use chrono::{DateTime, Utc};
use diesel::connection::{AnsiTransactionManager, TransactionManager};
use diesel::pg::PgConnection;
use diesel::sql_types::{Array, BigInt, Jsonb, Nullable, Text, Timestamptz};
use diesel::{Connection, OptionalExtension, QueryableByName, RunQueryDsl};
use serde_json::{json, Value};
use tracing::debug;

use super::{DuplicateGroup, HashedId, Store, StoredRecord, TableKind};
use crate::errors::Error;
use crate::registry::{DeleteStatus, DeletionEntry};
use crate::settings::Source;


#[derive(QueryableByName)]
struct RecordRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Jsonb)]
    rec: Value,
    #[diesel(sql_type = Nullable<Text>)]
    hash: Option<String>,
    #[diesel(sql_type = Timestamptz)]
    datum: DateTime<Utc>,
}

impl From<RecordRow> for StoredRecord {
    fn from(row: RecordRow) -> StoredRecord {
        StoredRecord {
            id: row.id,
            rec: row.rec,
            hash: row.hash,
            datum: row.datum,
        }
    }
}

#[derive(QueryableByName)]
struct HashedIdRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Nullable<Text>)]
    hash: Option<String>,
}

#[derive(QueryableByName)]
struct DoublesRow {
    #[diesel(sql_type = Array<BigInt>)]
    importids: Vec<i64>,
    #[diesel(sql_type = Text)]
    recid: String,
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    total: i64,
}

#[derive(QueryableByName)]
struct JsonRow {
    #[diesel(sql_type = Jsonb)]
    rec: Value,
}

#[derive(QueryableByName)]
struct DeletionRow {
    #[diesel(sql_type = Text)]
    recid: String,
    #[diesel(sql_type = Text)]
    status: String,
    #[diesel(sql_type = BigInt)]
    count: i64,
    #[diesel(sql_type = Timestamptz)]
    datum: DateTime<Utc>,
}


/// The authoritative store: a single Postgres connection, raw SQL over the
/// per-source table pairs. The pipeline is the sole writer so one
/// connection carries the whole job, which is also what lets the explicit
/// transaction boundary span several calls.
pub struct PgStore {
    conn: PgConnection,
}

impl PgStore {
    pub fn connect(url: &str) -> Result<PgStore, Error> {
        debug!("Connecting to database");
        let conn = PgConnection::establish(url)?;
        Ok(PgStore { conn })
    }

    fn execute(&mut self, sql: String) -> Result<usize, Error> {
        Ok(diesel::sql_query(sql).execute(&mut self.conn)?)
    }
}

impl Store for PgStore {
    fn ensure_schema(&mut self, sources: &[Source]) -> Result<(), Error> {
        for source in sources {
            for kind in [TableKind::Import, TableKind::Current] {
                let table = kind.table(source);
                self.execute(format!(
                    "CREATE TABLE IF NOT EXISTS public.{table} ( \
                     id BIGSERIAL PRIMARY KEY, \
                     rec JSONB, \
                     hash TEXT, \
                     datum TIMESTAMPTZ NOT NULL DEFAULT now())"
                ))?;
            }
        }

        self.execute(
            "CREATE TABLE IF NOT EXISTS public.deleted_records ( \
             id BIGSERIAL PRIMARY KEY, \
             recid TEXT NOT NULL, \
             status TEXT NOT NULL, \
             count BIGINT NOT NULL DEFAULT 1, \
             datum TIMESTAMPTZ NOT NULL DEFAULT now())"
                .to_string(),
        )?;
        self.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_deleted_records__recid \
             ON public.deleted_records (recid)"
                .to_string(),
        )?;

        Ok(())
    }

    fn truncate(&mut self, source: &Source, kind: TableKind) -> Result<(), Error> {
        let table = kind.table(source);
        self.execute(format!("TRUNCATE TABLE public.{table}"))?;
        debug!(table, "Truncated table");
        Ok(())
    }

    fn prepare_load(&mut self, source: &Source, kind: TableKind) -> Result<(), Error> {
        let table = kind.table(source);
        self.execute(format!("DROP INDEX IF EXISTS public.idx_{table}__jsonid"))?;
        self.execute(format!("DROP INDEX IF EXISTS public.idx_{table}__hash"))?;
        self.execute(format!("DROP INDEX IF EXISTS public.idx_{table}__gin"))?;
        self.execute(format!("DROP INDEX IF EXISTS public.idx_{table}__sciname"))?;
        self.execute(format!("ALTER TABLE public.{table} ALTER COLUMN hash DROP NOT NULL"))?;
        Ok(())
    }

    fn bulk_load(&mut self, source: &Source, kind: TableKind, datafile: &Path) -> Result<usize, Error> {
        let table = kind.table(source);
        // jsonlines read as a one column csv, quote and delimiter picked
        // from control characters that cannot occur in a JSON payload
        let count = self.execute(format!(
            "COPY public.{table} (rec) FROM '{datafile}' CSV QUOTE e'\\x01' DELIMITER e'\\x02'",
            datafile = datafile.display()
        ))?;
        Ok(count)
    }

    fn hash_rows(&mut self, source: &Source, kind: TableKind) -> Result<usize, Error> {
        let table = kind.table(source);
        self.execute(format!("UPDATE public.{table} SET hash = md5(rec::text)"))
    }

    fn build_indexes(&mut self, source: &Source, kind: TableKind) -> Result<(), Error> {
        let table = kind.table(source);

        self.execute(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}__hash ON public.{table} USING BTREE(hash)"
        ))?;
        self.execute(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}__jsonid \
             ON public.{table} USING BTREE((rec->>'{id_field}'))",
            id_field = source.id_field
        ))?;

        // identifications are present in records that receive enrichments
        if source.consumes_enrichments() {
            self.execute(format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}__gin \
                 ON public.{table} USING gin((rec->'identifications') jsonb_path_ops)"
            ))?;
        }

        // taxonomic sources carry the scientificNameGroup under acceptedName
        if source.produces_enrichments() {
            self.execute(format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}__sciname \
                 ON public.{table} USING gin((rec->'acceptedName') jsonb_path_ops)"
            ))?;
        }

        Ok(())
    }

    fn count(&mut self, source: &Source, kind: TableKind) -> Result<usize, Error> {
        let table = kind.table(source);
        let row: CountRow = diesel::sql_query(format!("SELECT COUNT(*) AS total FROM public.{table}"))
            .get_result(&mut self.conn)?;
        Ok(row.total as usize)
    }

    fn duplicate_groups(&mut self, source: &Source, kind: TableKind) -> Result<Vec<DuplicateGroup>, Error> {
        let table = kind.table(source);
        let rows: Vec<DoublesRow> = diesel::sql_query(format!(
            "SELECT array_agg(id ORDER BY id) AS importids, rec->>'{id_field}' AS recid \
             FROM public.{table} \
             WHERE rec->>'{id_field}' IS NOT NULL \
             GROUP BY rec->>'{id_field}' HAVING COUNT(*) > 1",
            id_field = source.id_field
        ))
        .load(&mut self.conn)?;

        Ok(rows
            .into_iter()
            .map(|row| DuplicateGroup {
                logical_id: row.recid,
                row_ids: row.importids,
            })
            .collect())
    }

    fn delete_rows(&mut self, source: &Source, kind: TableKind, row_ids: &[i64]) -> Result<usize, Error> {
        let table = kind.table(source);
        let deleted = diesel::sql_query(format!("DELETE FROM public.{table} WHERE id = ANY($1)"))
            .bind::<Array<BigInt>, _>(row_ids)
            .execute(&mut self.conn)?;
        Ok(deleted)
    }

    fn import_orphans(&mut self, source: &Source) -> Result<Vec<HashedId>, Error> {
        let import = TableKind::Import.table(source);
        let current = TableKind::Current.table(source);

        let rows: Vec<HashedIdRow> = diesel::sql_query(format!(
            "SELECT {import}.id AS id, {import}.hash AS hash \
             FROM {import} \
             FULL OUTER JOIN {current} ON {import}.hash = {current}.hash \
             WHERE {current}.hash IS NULL AND {import}.id IS NOT NULL"
        ))
        .load(&mut self.conn)?;

        Ok(rows
            .into_iter()
            .map(|row| HashedId {
                id: row.id,
                hash: row.hash,
            })
            .collect())
    }

    fn current_orphans(&mut self, source: &Source) -> Result<Vec<HashedId>, Error> {
        let import = TableKind::Import.table(source);
        let current = TableKind::Current.table(source);

        let rows: Vec<HashedIdRow> = diesel::sql_query(format!(
            "SELECT {current}.id AS id, {current}.hash AS hash \
             FROM {import} \
             FULL OUTER JOIN {current} ON {import}.hash = {current}.hash \
             WHERE {import}.hash IS NULL AND {current}.id IS NOT NULL"
        ))
        .load(&mut self.conn)?;

        Ok(rows
            .into_iter()
            .map(|row| HashedId {
                id: row.id,
                hash: row.hash,
            })
            .collect())
    }

    fn fetch(&mut self, source: &Source, kind: TableKind, row_id: i64) -> Result<Option<StoredRecord>, Error> {
        let table = kind.table(source);
        let row: Option<RecordRow> = diesel::sql_query(format!(
            "SELECT id, rec, hash, datum FROM public.{table} WHERE id = $1"
        ))
        .bind::<BigInt, _>(row_id)
        .get_result(&mut self.conn)
        .optional()?;

        Ok(row.map(StoredRecord::from))
    }

    fn find_by_logical_id(
        &mut self,
        source: &Source,
        kind: TableKind,
        logical_id: &str,
    ) -> Result<Option<StoredRecord>, Error> {
        let table = kind.table(source);
        let row: Option<RecordRow> = diesel::sql_query(format!(
            "SELECT id, rec, hash, datum FROM public.{table} \
             WHERE rec->>'{id_field}' = $1 \
             ORDER BY id LIMIT 1",
            id_field = source.id_field
        ))
        .bind::<Text, _>(logical_id)
        .get_result(&mut self.conn)
        .optional()?;

        Ok(row.map(StoredRecord::from))
    }

    fn delete_row(&mut self, source: &Source, kind: TableKind, row_id: i64) -> Result<(), Error> {
        let table = kind.table(source);
        diesel::sql_query(format!("DELETE FROM public.{table} WHERE id = $1"))
            .bind::<BigInt, _>(row_id)
            .execute(&mut self.conn)?;
        Ok(())
    }

    fn copy_to_current(&mut self, source: &Source, import_id: i64) -> Result<(), Error> {
        let import = TableKind::Import.table(source);
        let current = TableKind::Current.table(source);
        diesel::sql_query(format!(
            "INSERT INTO public.{current} (rec, hash, datum) \
             SELECT rec, hash, datum FROM public.{import} WHERE id = $1"
        ))
        .bind::<BigInt, _>(import_id)
        .execute(&mut self.conn)?;
        Ok(())
    }

    fn replace_current(&mut self, source: &Source, import_id: i64, current_id: i64) -> Result<(), Error> {
        let import = TableKind::Import.table(source);
        let current = TableKind::Current.table(source);
        diesel::sql_query(format!(
            "UPDATE public.{current} SET (rec, hash, datum) = \
             (SELECT rec, hash, datum FROM public.{import} WHERE {import}.id = $1) \
             WHERE {current}.id = $2"
        ))
        .bind::<BigInt, _>(import_id)
        .bind::<BigInt, _>(current_id)
        .execute(&mut self.conn)?;
        Ok(())
    }

    fn current_records(&mut self, source: &Source) -> Result<Vec<Value>, Error> {
        let current = TableKind::Current.table(source);
        let rows: Vec<JsonRow> =
            diesel::sql_query(format!("SELECT rec FROM public.{current} ORDER BY id"))
                .load(&mut self.conn)?;
        Ok(rows.into_iter().map(|row| row.rec).collect())
    }

    fn taxa_by_name_group(&mut self, source: &Source, name_group: &str) -> Result<Vec<Value>, Error> {
        let current = TableKind::Current.table(source);
        let rows: Vec<JsonRow> = diesel::sql_query(format!(
            "SELECT rec FROM public.{current} WHERE rec->'acceptedName' @> $1 ORDER BY id"
        ))
        .bind::<Jsonb, _>(json!({ "scientificNameGroup": name_group }))
        .load(&mut self.conn)?;
        Ok(rows.into_iter().map(|row| row.rec).collect())
    }

    fn impacted_records(&mut self, source: &Source, name_group: &str) -> Result<Vec<StoredRecord>, Error> {
        let current = TableKind::Current.table(source);
        let rows: Vec<RecordRow> = diesel::sql_query(format!(
            "SELECT id, rec, hash, datum FROM public.{current} \
             WHERE rec->'identifications' @> $1 ORDER BY id"
        ))
        .bind::<Jsonb, _>(json!([{ "scientificName": { "scientificNameGroup": name_group } }]))
        .load(&mut self.conn)?;
        Ok(rows.into_iter().map(StoredRecord::from).collect())
    }

    fn upsert_deletion(&mut self, recid: &str, status: DeleteStatus) -> Result<(), Error> {
        diesel::sql_query(
            "INSERT INTO public.deleted_records (recid, status, count) VALUES ($1, $2, 1) \
             ON CONFLICT (recid) DO UPDATE SET \
             count = deleted_records.count + 1, \
             status = CASE WHEN deleted_records.status = 'REMOVED' \
                      THEN 'REMOVED' ELSE EXCLUDED.status END, \
             datum = now()",
        )
        .bind::<Text, _>(recid)
        .bind::<Text, _>(status.as_str())
        .execute(&mut self.conn)?;
        Ok(())
    }

    fn deletion(&mut self, recid: &str) -> Result<Option<DeletionEntry>, Error> {
        let row: Option<DeletionRow> = diesel::sql_query(
            "SELECT recid, status, count, datum FROM public.deleted_records WHERE recid = $1",
        )
        .bind::<Text, _>(recid)
        .get_result(&mut self.conn)
        .optional()?;

        match row {
            None => Ok(None),
            Some(row) => {
                let status = row
                    .status
                    .parse::<DeleteStatus>()
                    .map_err(crate::errors::ParseError::InvalidValue)
                    .map_err(Error::Parsing)?;
                Ok(Some(DeletionEntry {
                    recid: row.recid,
                    status,
                    count: row.count,
                    datum: row.datum,
                }))
            }
        }
    }

    fn truncate_deletions(&mut self) -> Result<(), Error> {
        self.execute("TRUNCATE TABLE public.deleted_records".to_string())?;
        Ok(())
    }

    fn begin(&mut self) -> Result<(), Error> {
        AnsiTransactionManager::begin_transaction(&mut self.conn)?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        AnsiTransactionManager::commit_transaction(&mut self.conn)?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        AnsiTransactionManager::rollback_transaction(&mut self.conn)?;
        Ok(())
    }
}

