use std::time::Instant;

use tracing::{debug, info};

use crate::errors::Error;
use crate::meta::ActionMeta;
use crate::store::{Store, TableKind};
use crate::Pipeline;


impl<S: Store> Pipeline<S> {
    /// Collapses duplicate logical ids within one table.
    ///
    /// Suppliers occasionally ship the same record twice in one batch. For
    /// every group sharing a logical id the last-inserted row wins and the
    /// earlier rows are removed, which establishes the uniqueness the
    /// differ relies on. Returns the number of collapsed groups.
    pub fn dedupe(&mut self, kind: TableKind) -> Result<usize, Error> {
        let source = self.current_source()?;
        let start = Instant::now();

        let groups = self.store.duplicate_groups(&source, kind)?;
        debug!(elapsed = start.elapsed().as_secs_f64(), "Found duplicate groups");

        let mut count = 0;
        for group in &groups {
            // ids arrive in insertion order, everything but the newest goes
            let losers = &group.row_ids[..group.row_ids.len() - 1];
            self.store.delete_rows(&source, kind, losers)?;
            count += 1;
        }

        info!(
            doubles = count,
            elapsed = start.elapsed().as_secs_f64(),
            "Removed records with more than one entry in the source data"
        );

        let scope_source = self.source.clone();
        let scope_file = self.filename.clone();
        self.meta.set_action(
            &scope_source,
            &scope_file,
            "doubles",
            ActionMeta {
                count,
                file: None,
                elapsed: start.elapsed().as_secs_f64(),
            },
        );

        Ok(count)
    }
}
