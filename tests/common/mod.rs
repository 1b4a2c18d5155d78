#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tempfile::TempDir;

use percolator::audit::AuditLog;
use percolator::enrich::cache::TaxonCache;
use percolator::lock::JobLock;
use percolator::meta::PercolatorMeta;
use percolator::notifier::Notifier;
use percolator::settings::{Paths, Postgres, Settings, Source};
use percolator::store::MemoryStore;
use percolator::{JobContext, Pipeline};


pub struct Fixture {
    pub dir: TempDir,
    pub pipeline: Pipeline<MemoryStore>,
}

impl Fixture {
    pub fn incoming(&self) -> PathBuf {
        self.pipeline.settings.paths.incoming.clone()
    }

    pub fn jobs(&self) -> PathBuf {
        self.pipeline.settings.paths.jobs.clone()
    }

    pub fn delta(&self) -> PathBuf {
        self.pipeline.settings.paths.delta.clone()
    }

    /// Writes a jsonlines file into the incoming directory
    pub fn write_incoming(&self, filename: &str, records: &[Value]) -> PathBuf {
        let path = self.incoming().join(filename);
        write_jsonl(&path, records);
        path
    }
}

pub fn write_jsonl(path: &Path, records: &[Value]) {
    let mut text = String::new();
    for rec in records {
        text.push_str(&serde_json::to_string(rec).unwrap());
        text.push('\n');
    }
    std::fs::write(path, text).unwrap();
}

pub fn read_jsonl(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn source(table: &str, code: &str, index: &str, incremental: bool) -> Source {
    Source {
        name: String::new(),
        table: table.to_string(),
        id_field: "id".to_string(),
        code: code.to_string(),
        index: Some(index.to_string()),
        incremental,
        src_enrich: vec![],
        dst_enrich: vec![],
    }
}

/// A pipeline over the in-memory store with three wired sources:
/// a complete-dataset specimen stream, an incremental specimen stream
/// consuming enrichments, and the taxon stream feeding it.
pub fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();

    let paths = Paths {
        incoming: dir.path().join("incoming"),
        processed: dir.path().join("processed"),
        jobs: dir.path().join("jobs"),
        failed: dir.path().join("failed"),
        done: dir.path().join("done"),
        delta: dir.path().join("delta"),
        cache: dir.path().join("cache"),
    };
    for path in [
        &paths.incoming,
        &paths.processed,
        &paths.jobs,
        &paths.failed,
        &paths.done,
        &paths.delta,
        &paths.cache,
    ] {
        std::fs::create_dir_all(path).unwrap();
    }

    let mut specimen = source("xenocantospecimen", "XC", "specimen", false);
    specimen.name = "xc-specimen".to_string();

    let mut consumer = source("testspecimen", "CRS", "specimen", true);
    consumer.name = "test-specimen".to_string();
    consumer.src_enrich = vec!["test-taxa".to_string()];

    let mut taxa = source("testtaxa", "COL", "taxon", false);
    taxa.name = "test-taxa".to_string();
    taxa.dst_enrich = vec!["test-specimen".to_string()];

    let mut settings = Settings {
        paths: paths.clone(),
        postgres: Postgres::default(),
        sources: BTreeMap::from([
            ("xc-specimen".to_string(), specimen),
            ("test-specimen".to_string(), consumer),
            ("test-taxa".to_string(), taxa),
        ]),
    };
    settings.validate().unwrap();

    let pipeline = Pipeline {
        settings,
        store: MemoryStore::new(),
        cache: TaxonCache::open(&paths.cache).unwrap(),
        audit: AuditLog::disabled(),
        notifier: Notifier::disabled(),
        lock: JobLock::new(&paths.jobs),
        meta: PercolatorMeta::default(),
        job: JobContext {
            id: "testjob".to_string(),
            ..JobContext::default()
        },
        source: String::new(),
        filename: String::new(),
    };

    Fixture { dir, pipeline }
}

/// A deterministic specimen record
pub fn specimen(seq: usize) -> Value {
    json!({
        "id": format!("XC.{seq:04}@TEST"),
        "unitID": format!("XC.{seq:04}"),
        "sourceSystem": {"code": "XC"},
        "collector": format!("collector {}", seq % 7),
        "locality": "Amsterdamse Waterleidingduinen",
    })
}

/// The same specimen with a mutated payload (same logical id, new hash)
pub fn mutated_specimen(seq: usize) -> Value {
    let mut rec = specimen(seq);
    rec["locality"] = json!("Oostvaardersplassen");
    rec
}

/// A specimen identified against a scientific name group
pub fn identified_specimen(seq: usize, name_group: &str) -> Value {
    json!({
        "id": format!("CRS.{seq:04}@TEST"),
        "sourceSystem": {"code": "CRS"},
        "identifications": [
            {"scientificName": {"scientificNameGroup": name_group}}
        ],
    })
}

/// A taxon record owned by the taxonomic source
pub fn taxon(id: &str, name_group: &str) -> Value {
    json!({
        "id": id,
        "acceptedName": {"scientificNameGroup": name_group},
        "sourceSystem": {"code": "COL"},
        "defaultClassification": {"kingdom": "Animalia"},
        "vernacularNames": [{"name": "herring gull", "language": "en", "preferred": true}],
        "synonyms": [{
            "fullScientificName": "Larus argentatus Pontoppidan, 1763",
            "taxonomicStatus": "synonym",
            "genusOrMonomial": "Larus",
        }],
    })
}

pub fn records(range: std::ops::Range<usize>) -> Vec<Value> {
    range.map(specimen).collect()
}
