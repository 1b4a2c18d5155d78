use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::{ConfigError, Error, ParseError};


/// A named logical input stream and its enrichment wiring.
///
/// Every source owns a pair of identically shaped tables, `{table}_import`
/// and `{table}_current`. The `id` attribute names the JSON field that
/// identifies a record within the stream.
#[derive(Debug, Clone, Deserialize)]
pub struct Source {
    #[serde(skip)]
    pub name: String,

    pub table: String,

    /// The JSON attribute carrying the logical record id
    #[serde(rename = "id")]
    pub id_field: String,

    /// Short system code used in audit events and cache keys. Eg. COL
    pub code: String,

    /// Document index the delta files are destined for
    pub index: Option<String>,

    /// Incremental suppliers only send changes, so records missing from an
    /// import are not deletions. Deletes must arrive explicitly.
    #[serde(default = "default_incremental")]
    pub incremental: bool,

    /// Taxonomic sources whose records enrich this source
    #[serde(default, rename = "src-enrich")]
    pub src_enrich: Vec<String>,

    /// Sources that consume this source's taxonomy
    #[serde(default, rename = "dst-enrich")]
    pub dst_enrich: Vec<String>,
}

fn default_incremental() -> bool {
    true
}

impl Source {
    pub fn import_table(&self) -> String {
        format!("{}_import", self.table)
    }

    pub fn current_table(&self) -> String {
        format!("{}_current", self.table)
    }

    pub fn index(&self) -> &str {
        self.index.as_deref().unwrap_or("noindex")
    }

    /// True when this source's records receive taxonomic enrichments
    pub fn consumes_enrichments(&self) -> bool {
        !self.src_enrich.is_empty()
    }

    /// True when this source's records are the taxonomy other sources consume
    pub fn produces_enrichments(&self) -> bool {
        !self.dst_enrich.is_empty()
    }
}


#[derive(Debug, Clone, Deserialize)]
pub struct Paths {
    pub incoming: PathBuf,
    pub processed: PathBuf,
    pub jobs: PathBuf,
    pub failed: PathBuf,
    pub done: PathBuf,
    pub delta: PathBuf,
    pub cache: PathBuf,
}

impl Paths {
    pub fn incoming_file(&self, filename: &str) -> PathBuf {
        self.incoming.join(filename)
    }

    pub fn processed_file(&self, filename: &str) -> PathBuf {
        self.processed.join(filename)
    }
}


#[derive(Debug, Clone, Default, Deserialize)]
pub struct Postgres {
    pub url: Option<String>,
}


#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub paths: Paths,

    #[serde(default)]
    pub postgres: Postgres,

    pub sources: BTreeMap<String, Source>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::Unreadable(path.display().to_string()))?;
        let mut settings: Settings =
            toml::from_str(&text).map_err(|err| Error::Parsing(ParseError::Toml(err)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks the source registry before any work starts: enrichment lists
    /// must point at configured sources and the dependency graph between
    /// producers and consumers must be acyclic.
    pub fn validate(&mut self) -> Result<(), Error> {
        for (name, source) in self.sources.iter_mut() {
            source.name = name.clone();
        }

        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for (name, source) in &self.sources {
            for dst in &source.dst_enrich {
                if !self.sources.contains_key(dst) {
                    return Err(ConfigError::UnknownEnrichmentSource(name.clone(), dst.clone()).into());
                }
                edges.entry(name.as_str()).or_default().push(dst.as_str());
            }
            for src in &source.src_enrich {
                if !self.sources.contains_key(src) {
                    return Err(ConfigError::UnknownEnrichmentSource(name.clone(), src.clone()).into());
                }
                // src-enrich points the other way, normalise to producer -> consumer
                edges.entry(src.as_str()).or_default().push(name.as_str());
            }
        }

        // depth first walk with an on-stack marker to detect cycles
        let mut visited: HashMap<&str, bool> = HashMap::new();
        for name in self.sources.keys() {
            detect_cycle(name.as_str(), &edges, &mut visited)?;
        }

        Ok(())
    }

    pub fn source(&self, name: &str) -> Result<&Source, Error> {
        self.sources
            .get(&name.to_lowercase())
            .ok_or_else(|| Error::Source(name.to_string()))
    }

    pub fn database_url(&self) -> Result<String, Error> {
        if let Some(url) = &self.postgres.url {
            return Ok(url.clone());
        }
        std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl.into())
    }
}

fn detect_cycle<'a>(
    node: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashMap<&'a str, bool>,
) -> Result<(), Error> {
    match visited.get(node) {
        Some(true) => return Ok(()),
        Some(false) => return Err(ConfigError::EnrichmentCycle(node.to_string()).into()),
        None => {}
    }

    visited.insert(node, false);

    if let Some(targets) = edges.get(node) {
        for target in targets {
            detect_cycle(target, edges, visited)?;
        }
    }

    visited.insert(node, true);
    Ok(())
}
