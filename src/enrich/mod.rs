pub mod cache;

use std::time::Instant;

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::audit::AuditState;
use crate::delta::Action;
use crate::errors::Error;
use crate::meta::ActionMeta;
use crate::store::Store;
use crate::Pipeline;

use cache::taxon_key;


/// The fields a vernacular name keeps in an enrichment
static NAME_FIELDS: &[&str] = &["name", "language"];

/// The fields a synonym keeps in an enrichment
static SCIENTIFIC_FIELDS: &[&str] = &[
    "fullScientificName",
    "taxonomicStatus",
    "genusOrMonomial",
    "subgenus",
    "specificEpithet",
    "infraspecificEpithet",
    "authorshipVerbatim",
];

fn trim_to_fields(value: &Value, fields: &[&str]) -> Value {
    let mut summary = Map::new();
    for field in fields {
        if let Some(found) = value.get(*field) {
            if !found.is_null() {
                summary.insert((*field).to_string(), found.clone());
            }
        }
    }
    Value::Object(summary)
}

/// The trimmed vernacular name carried inside an enrichment
pub fn name_summary(vernacular_name: &Value) -> Value {
    trim_to_fields(vernacular_name, NAME_FIELDS)
}

/// The trimmed synonym carried inside an enrichment
pub fn scientific_summary(scientific_name: &Value) -> Value {
    trim_to_fields(scientific_name, SCIENTIFIC_FIELDS)
}

/// Projects taxon records down to the compact form attached to consumer
/// records. The full classification rides along only for the catalogue of
/// life, the other systems carry their own.
pub fn build_enrichments(taxa: &[Value]) -> Vec<Value> {
    let mut enrichments = Vec::with_capacity(taxa.len());

    for taxon in taxa {
        let mut enrichment = Map::new();

        if let Some(names) = taxon.get("vernacularNames").and_then(Value::as_array) {
            let summaries: Vec<Value> = names.iter().map(name_summary).collect();
            enrichment.insert("vernacularNames".to_string(), Value::Array(summaries));
        }

        enrichment.insert("taxonId".to_string(), taxon.get("id").cloned().unwrap_or(Value::Null));

        if let Some(synonyms) = taxon.get("synonyms").and_then(Value::as_array) {
            let summaries: Vec<Value> = synonyms.iter().map(scientific_summary).collect();
            enrichment.insert("synonyms".to_string(), Value::Array(summaries));
        }

        if let Some(code) = taxon.pointer("/sourceSystem/code").and_then(Value::as_str) {
            enrichment.insert("sourceSystem".to_string(), json!({ "code": code }));

            if code == "COL" {
                if let Some(classification) = taxon.get("defaultClassification") {
                    enrichment.insert("defaultClassification".to_string(), classification.clone());
                }
            }
        }

        enrichments.push(Value::Object(enrichment));
    }

    enrichments
}

fn accepted_name_group(rec: &Value) -> Option<&str> {
    rec.pointer("/acceptedName/scientificNameGroup").and_then(Value::as_str)
}

impl<S: Store> Pipeline<S> {
    /// Taxa sharing a scientific name group, served from the cache when
    /// possible. A cold miss queries the taxon source's current table and
    /// stores the result, a stored empty list included.
    pub fn taxa_for(&mut self, name_group: &str, source_name: &str) -> Result<Vec<Value>, Error> {
        let source = self.settings.source(source_name)?.clone();
        let key = taxon_key(&source.code, name_group);

        if let Some(taxa) = self.cache.get(&key)? {
            return Ok(taxa);
        }

        let taxa = self.store.taxa_by_name_group(&source, name_group)?;
        self.cache.set(&key, &taxa)?;
        Ok(taxa)
    }

    /// The enrichments one name group receives from one taxonomic source
    pub fn enrichments_for(&mut self, name_group: &str, source_name: &str) -> Result<Vec<Value>, Error> {
        let taxa = self.taxa_for(name_group, source_name)?;
        if taxa.is_empty() {
            debug!(name_group, source = source_name, "No enrichment for name group");
        }
        Ok(build_enrichments(&taxa))
    }

    /// Enriches a consumer record in place: every identification carrying a
    /// scientific name group collects enrichments from the configured taxon
    /// sources under `taxonomicEnrichments`. The record is otherwise
    /// untouched, which also makes the operation idempotent.
    pub fn enrich_record(&mut self, mut rec: Value, sources: &[String]) -> Result<Value, Error> {
        let groups: Vec<(usize, String)> = match rec.get("identifications").and_then(Value::as_array) {
            None => return Ok(rec),
            Some(identifications) => identifications
                .iter()
                .enumerate()
                .filter_map(|(at, identification)| {
                    identification
                        .pointer("/scientificName/scientificNameGroup")
                        .and_then(Value::as_str)
                        .map(|group| (at, group.to_string()))
                })
                .collect(),
        };

        for (at, name_group) in groups {
            let mut enrichments = Vec::new();
            for source_name in sources {
                enrichments.extend(self.enrichments_for(&name_group, source_name)?);
            }

            if !enrichments.is_empty() {
                if let Some(identification) = rec
                    .get_mut("identifications")
                    .and_then(Value::as_array_mut)
                    .and_then(|identifications| identifications.get_mut(at))
                {
                    identification["taxonomicEnrichments"] = Value::Array(enrichments);
                }
            }
        }

        Ok(rec)
    }

    /// Rebuilds the cache entry for a freshly written taxon record: the
    /// entry with the same document id is replaced, anything else is kept,
    /// a missing entry starts a new list.
    pub fn cache_taxon(&mut self, rec: &Value, code: &str) -> Result<(), Error> {
        let Some(name_group) = accepted_name_group(rec) else {
            return Ok(());
        };
        let key = taxon_key(code, name_group);

        let taxa = match self.cache.get(&key)? {
            Some(mut taxa) if !taxa.is_empty() => {
                let mut replaced = false;
                for taxon in taxa.iter_mut() {
                    if taxon.get("id") == rec.get("id") {
                        *taxon = rec.clone();
                        replaced = true;
                    }
                }
                if !replaced {
                    taxa.push(rec.clone());
                }
                taxa
            }
            _ => vec![rec.clone()],
        };

        self.cache.set(&key, &taxa)?;
        Ok(())
    }

    /// Drops the cache entry covering a deleted taxon so the next lookup
    /// refetches the post-delete state from the store
    pub fn evict_taxon(&mut self, rec: &Value, code: &str) -> Result<(), Error> {
        if let Some(name_group) = accepted_name_group(rec) {
            self.cache.evict(&taxon_key(code, name_group))?;
        }
        Ok(())
    }

    /// Fans a taxon change out to one downstream source: every current
    /// record whose identifications reference the taxon's name group is
    /// re-enriched and appended to that source's enrich delta file.
    pub fn handle_impacted(&mut self, source_name: &str, taxon: &Value) -> Result<(), Error> {
        let Some(name_group) = accepted_name_group(taxon).map(str::to_string) else {
            return Ok(());
        };

        let source = self.settings.source(source_name)?.clone();
        let start = Instant::now();

        let impacted = self.store.impacted_records(&source, &name_group)?;
        if impacted.is_empty() {
            info!(source = source_name, name_group, "Found no impacted records");
            return Ok(());
        }
        info!(
            number = impacted.len(),
            source = source_name,
            name_group,
            "Found impacted records"
        );

        let mut delta = self.open_delta(source.index(), Action::Enrich)?;
        let count = impacted.len();

        for record in impacted {
            let rec = if source.consumes_enrichments() {
                self.enrich_record(record.rec, &source.src_enrich)?
            }
            else {
                record.rec
            };

            delta.append(&rec)?;

            let recid = rec
                .get(&source.id_field)
                .and_then(Value::as_str)
                .unwrap_or_default();
            self.audit
                .record(AuditState::Enrich, recid, source.index(), &source.code, "");
        }

        let file = delta.finish()?;
        let scope_source = self.source.clone();
        let scope_file = self.filename.clone();
        self.meta.merge_action(
            &scope_source,
            &scope_file,
            &format!("enrich:{}", source.index()),
            ActionMeta {
                count,
                file: Some(file.display().to_string()),
                elapsed: start.elapsed().as_secs_f64(),
            },
        );

        Ok(())
    }
}
