use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Error, ParseError};


/// Disk-backed key/value store for taxon lookups.
///
/// Keys are `{systemCode}_{scientificNameGroup}`, values are the full list
/// of taxon documents sharing that name group. A stored empty list is an
/// authoritative negative, distinct from a miss. Entries have no TTL;
/// the whole cache is wiped when a process starts so nothing stale can
/// survive a restart.
pub struct TaxonCache {
    dir: PathBuf,
    entries: HashMap<String, Vec<Value>>,
}

impl TaxonCache {
    pub fn open(dir: &Path) -> Result<TaxonCache, Error> {
        std::fs::create_dir_all(dir)?;
        let mut cache = TaxonCache {
            dir: dir.to_path_buf(),
            entries: HashMap::new(),
        };
        cache.clear()?;
        Ok(cache)
    }

    pub fn clear(&mut self) -> Result<(), Error> {
        self.entries.clear();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    pub fn get(&mut self, key: &str) -> Result<Option<Vec<Value>>, Error> {
        if let Some(taxa) = self.entries.get(key) {
            debug!(key, "Taxon cache hit");
            return Ok(Some(taxa.clone()));
        }

        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let text = std::fs::read_to_string(path)?;
        let taxa: Vec<Value> = serde_json::from_str(&text).map_err(ParseError::Json)?;
        self.entries.insert(key.to_string(), taxa.clone());
        Ok(Some(taxa))
    }

    pub fn set(&mut self, key: &str, taxa: &[Value]) -> Result<(), Error> {
        let text = serde_json::to_string(taxa).map_err(ParseError::Json)?;
        std::fs::write(self.entry_path(key), text)?;
        self.entries.insert(key.to_string(), taxa.to_vec());
        debug!(key, records = taxa.len(), "Stored taxa in cache");
        Ok(())
    }

    pub fn evict(&mut self, key: &str) -> Result<(), Error> {
        self.entries.remove(key);
        let path = self.entry_path(key);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Name groups contain spaces and arbitrary unicode, so entries are
    /// filed under a digest of the key
    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{:x}.json", md5::compute(key.as_bytes())))
    }
}

pub fn taxon_key(code: &str, name_group: &str) -> String {
    format!("{code}_{name_group}")
}
