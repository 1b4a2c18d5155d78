use std::path::Path;
use std::time::Instant;

use tracing::{debug, info};

use crate::errors::Error;
use crate::store::{Store, TableKind};
use crate::utils::new_spinner;
use crate::Pipeline;


impl<S: Store> Pipeline<S> {
    /// Bulk-loads a newline-delimited JSON file into one of the source's
    /// tables and leaves it hashed and indexed.
    ///
    /// The table is reset first: truncated, indexes dropped and the NOT
    /// NULL on the hash column relaxed, so the load is a straight append of
    /// unvalidated rows. Hashes and indexes are rebuilt afterwards, which
    /// is considerably faster than maintaining them during the copy.
    pub fn stage(&mut self, kind: TableKind, datafile: &Path) -> Result<usize, Error> {
        let source = self.current_source()?;
        let table = kind.table(&source);
        let spinner = new_spinner(&format!("Staging {}", datafile.display()));

        let lap = Instant::now();
        self.store.truncate(&source, kind)?;
        self.store.prepare_load(&source, kind)?;
        debug!(table, elapsed = lap.elapsed().as_secs_f64(), "Reset table for import");

        let lap = Instant::now();
        let count = self.store.bulk_load(&source, kind, datafile)?;
        debug!(
            table,
            count,
            elapsed = lap.elapsed().as_secs_f64(),
            "Loaded data file"
        );

        let lap = Instant::now();
        self.store.hash_rows(&source, kind)?;
        debug!(table, elapsed = lap.elapsed().as_secs_f64(), "Hashed records");

        let lap = Instant::now();
        self.store.build_indexes(&source, kind)?;
        debug!(table, elapsed = lap.elapsed().as_secs_f64(), "Rebuilt indexes");

        spinner.finish();
        info!(table, count, "Staged records");
        Ok(count)
    }
}
