use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::{Error, ParseError};
use crate::meta::PercolatorMeta;


/// One input file scheduled by a job manifest, resolved to the lowercased
/// source name `{data_supplier}-{kind}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFile {
    pub source: String,
    pub filename: String,
}


/// A parsed job manifest.
///
/// The raw document is kept alongside the typed fields so the finalized
/// manifest written to the done directory preserves everything the
/// validator put in, with the percolator meta grafted on.
#[derive(Debug, Clone)]
pub struct JobManifest {
    raw: Value,

    pub id: String,
    pub data_supplier: String,
    pub date: DateTime<Utc>,
    pub tabula_rasa: bool,
    pub imports: Vec<JobFile>,
    pub deletes: Vec<JobFile>,
}

impl JobManifest {
    pub fn parse(text: &str) -> Result<JobManifest, Error> {
        let raw: Value = serde_json::from_str(text).map_err(ParseError::Json)?;

        let id = required_str(&raw, "id")?.to_string();
        let data_supplier = required_str(&raw, "data_supplier")?.to_string();

        let date = match raw.get("date").and_then(Value::as_str) {
            Some(value) => parse_date_time(value).map_err(Error::Parsing)?,
            None => Utc::now(),
        };

        let tabula_rasa = raw
            .get("tabula_rasa")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut imports = Vec::new();
        if let Some(validator) = raw.get("validator").and_then(Value::as_object) {
            for (kind, export) in validator {
                let valid = export
                    .pointer("/results/outfiles/valid")
                    .and_then(Value::as_array);

                for file in valid.into_iter().flatten() {
                    let Some(path) = file.as_str() else { continue };
                    imports.push(JobFile {
                        source: source_name(&data_supplier, kind),
                        filename: basename(path),
                    });
                }
            }
        }

        let mut deletes = Vec::new();
        if let Some(delete) = raw.get("delete").and_then(Value::as_object) {
            for (kind, files) in delete {
                for file in files.as_array().into_iter().flatten() {
                    let Some(path) = file.as_str() else { continue };
                    deletes.push(JobFile {
                        source: source_name(&data_supplier, kind),
                        filename: basename(path),
                    });
                }
            }
        }

        Ok(JobManifest {
            raw,
            id,
            data_supplier,
            date,
            tabula_rasa,
            imports,
            deletes,
        })
    }

    /// The original manifest with the percolator meta map attached
    pub fn finalize(&self, meta: &PercolatorMeta) -> Result<Value, Error> {
        let mut doc = self.raw.clone();
        doc["percolator"] = serde_json::to_value(meta).map_err(ParseError::Json)?;
        Ok(doc)
    }
}

fn required_str<'a>(raw: &'a Value, field: &str) -> Result<&'a str, Error> {
    raw.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ParseError::InvalidManifest(format!("missing field \"{field}\"")).into())
}

fn source_name(supplier: &str, kind: &str) -> String {
    format!("{supplier}-{kind}").to_lowercase()
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

/// Suppliers are sloppy about date formats, so try the deviations we have
/// seen in the wild before falling back to strict rfc3339.
pub fn parse_date_time(value: &str) -> Result<DateTime<Utc>, ParseError> {
    if let Ok(datetime) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%z") {
        return Ok(datetime.into());
    }
    if let Ok(datetime) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%#z") {
        return Ok(datetime.into());
    }
    // rfc3339 doesn't include millis so we support the deviation here
    if let Ok(datetime) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.3f%#z") {
        return Ok(datetime.into());
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(datetime) = date.and_hms_opt(0, 0, 0) {
            return Ok(datetime.and_utc());
        }
    }

    Ok(DateTime::parse_from_rfc3339(value)?.into())
}


#[cfg(test)]
mod tests {
    use super::*;

    static MANIFEST: &str = r#"{
        "id": "Job-20180501",
        "data_supplier": "BRAHMS",
        "date": "2018-05-01T12:00:00+00:00",
        "validator": {
            "specimen": {
                "results": {
                    "outfiles": {
                        "valid": ["/validator/out/2-same.json", "/validator/out/3-new.json"]
                    }
                }
            },
            "media": {
                "results": {
                    "outfiles": { "valid": ["/validator/out/media.json"] }
                }
            }
        },
        "delete": {
            "specimen": ["/validator/out/gone.txt"]
        }
    }"#;

    #[test]
    fn parses_imports_and_deletes() {
        let manifest = JobManifest::parse(MANIFEST).unwrap();

        assert_eq!(manifest.id, "Job-20180501");
        assert_eq!(manifest.data_supplier, "BRAHMS");
        assert!(!manifest.tabula_rasa);

        assert_eq!(
            manifest.imports,
            vec![
                JobFile {
                    source: "brahms-specimen".to_string(),
                    filename: "2-same.json".to_string(),
                },
                JobFile {
                    source: "brahms-specimen".to_string(),
                    filename: "3-new.json".to_string(),
                },
                JobFile {
                    source: "brahms-media".to_string(),
                    filename: "media.json".to_string(),
                },
            ]
        );
        assert_eq!(
            manifest.deletes,
            vec![JobFile {
                source: "brahms-specimen".to_string(),
                filename: "gone.txt".to_string(),
            }]
        );
    }

    #[test]
    fn missing_id_is_invalid() {
        let err = JobManifest::parse(r#"{"data_supplier": "XC"}"#).unwrap_err();
        assert!(matches!(err, Error::Parsing(ParseError::InvalidManifest(_))));
    }

    #[test]
    fn finalize_keeps_the_original_document() {
        let manifest = JobManifest::parse(MANIFEST).unwrap();
        let mut meta = PercolatorMeta::default();
        meta.set_text("brahms-specimen", "2-same.json", "in", "/incoming/2-same.json");

        let done = manifest.finalize(&meta).unwrap();
        assert_eq!(done["id"], "Job-20180501");
        assert!(done["validator"]["specimen"]["results"]["outfiles"]["valid"].is_array());
        assert_eq!(
            done["percolator"]["brahms-specimen"]["2-same.json"]["in"],
            "/incoming/2-same.json"
        );
    }

    #[test]
    fn date_formats_are_forgiving() {
        parse_date_time("2018-05-01T12:00:00+00:00").unwrap();
        parse_date_time("2018-05-01 12:00:00+0000").unwrap();
        parse_date_time("2018-05-01").unwrap();
        assert!(parse_date_time("last tuesday").is_err());
    }
}
