use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;


/// Per-action breadcrumbs recorded in the finalized manifest
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionMeta {
    pub count: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Elapsed wall time in seconds
    pub elapsed: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetaValue {
    Text(String),
    Action(ActionMeta),
}


/// Per-job, per-source, per-file key/value breadcrumbs. Serialized into the
/// finalized manifest under `percolator`, with the produced delta files in a
/// sibling `outfiles` list.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PercolatorMeta {
    #[serde(flatten)]
    sources: BTreeMap<String, BTreeMap<String, BTreeMap<String, MetaValue>>>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    outfiles: Vec<String>,
}

impl PercolatorMeta {
    pub fn set(&mut self, source: &str, filename: &str, key: &str, value: MetaValue) {
        self.sources
            .entry(source.to_string())
            .or_default()
            .entry(filename.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn set_text(&mut self, source: &str, filename: &str, key: &str, value: &str) {
        self.set(source, filename, key, MetaValue::Text(value.to_string()));
    }

    pub fn set_action(&mut self, source: &str, filename: &str, key: &str, action: ActionMeta) {
        self.set(source, filename, key, MetaValue::Action(action));
    }

    pub fn get(&self, source: &str, filename: &str, key: &str) -> Option<&MetaValue> {
        self.sources.get(source)?.get(filename)?.get(key)
    }

    /// Fan-out counts accumulate across taxon changes within one file, so
    /// an existing entry is merged rather than replaced.
    pub fn merge_action(&mut self, source: &str, filename: &str, key: &str, action: ActionMeta) {
        let entry = self
            .sources
            .entry(source.to_string())
            .or_default()
            .entry(filename.to_string())
            .or_default()
            .entry(key.to_string());

        use std::collections::btree_map::Entry;
        match entry {
            Entry::Occupied(mut found) => {
                if let MetaValue::Action(existing) = found.get_mut() {
                    existing.count += action.count;
                    existing.elapsed += action.elapsed;
                }
                else {
                    found.insert(MetaValue::Action(action));
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(MetaValue::Action(action));
            }
        }
    }

    pub fn add_outfile(&mut self, path: &Path) {
        let path = path.display().to_string();
        if !self.outfiles.contains(&path) {
            self.outfiles.push(path);
        }
    }

    pub fn outfiles(&self) -> &[String] {
        &self.outfiles
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_keys_serialize_flat() {
        let mut meta = PercolatorMeta::default();
        meta.set_text("brahms-specimen", "1-base.json", "in", "/data/incoming/1-base.json");
        meta.set_action(
            "brahms-specimen",
            "1-base.json",
            "new",
            ActionMeta {
                count: 89,
                file: Some("/data/delta/job1-specimen-new.json".to_string()),
                elapsed: 0.5,
            },
        );
        meta.add_outfile(Path::new("/data/delta/job1-specimen-new.json"));

        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["brahms-specimen"]["1-base.json"]["in"], "/data/incoming/1-base.json");
        assert_eq!(json["brahms-specimen"]["1-base.json"]["new"]["count"], 89);
        assert_eq!(json["outfiles"][0], "/data/delta/job1-specimen-new.json");
    }

    #[test]
    fn merge_action_accumulates() {
        let mut meta = PercolatorMeta::default();
        let action = |count, elapsed| ActionMeta {
            count,
            file: Some("enrich.json".to_string()),
            elapsed,
        };

        meta.merge_action("col-taxa", "t.json", "enrich:specimen", action(3, 1.0));
        meta.merge_action("col-taxa", "t.json", "enrich:specimen", action(2, 0.5));

        match meta.get("col-taxa", "t.json", "enrich:specimen") {
            Some(MetaValue::Action(merged)) => {
                assert_eq!(merged.count, 5);
                assert!((merged.elapsed - 1.5).abs() < f64::EPSILON);
            }
            other => panic!("expected merged action meta, got {other:?}"),
        }
    }

    #[test]
    fn outfiles_do_not_repeat() {
        let mut meta = PercolatorMeta::default();
        meta.add_outfile(Path::new("/delta/a.json"));
        meta.add_outfile(Path::new("/delta/a.json"));
        meta.add_outfile(Path::new("/delta/b.json"));
        assert_eq!(meta.outfiles().len(), 2);
    }
}
