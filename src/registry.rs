use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};


/// Whether a record disappeared from a complete dataset (soft) or was
/// explicitly killed by the supplier (hard). REMOVED supersedes REJECTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteStatus {
    #[serde(rename = "REJECTED")]
    Rejected,

    #[serde(rename = "REMOVED")]
    Removed,
}

impl DeleteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeleteStatus::Rejected => "REJECTED",
            DeleteStatus::Removed => "REMOVED",
        }
    }

    /// The status that wins when a new observation lands on an existing entry
    pub fn supersede(current: DeleteStatus, observed: DeleteStatus) -> DeleteStatus {
        match (current, observed) {
            (DeleteStatus::Removed, _) => DeleteStatus::Removed,
            (_, observed) => observed,
        }
    }
}

impl std::str::FromStr for DeleteStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<DeleteStatus, Self::Err> {
        match value {
            "REJECTED" => Ok(DeleteStatus::Rejected),
            "REMOVED" => Ok(DeleteStatus::Removed),
            other => Err(format!("unknown delete status: {other}")),
        }
    }
}


/// One row of the persistent delete registry. The counter increments on
/// every observation of the same logical id; entries never expire.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletionEntry {
    pub recid: String,
    pub status: DeleteStatus,
    pub count: i64,
    pub datum: DateTime<Utc>,
}


/// The structured record appended to `delete` and `kill` delta files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRecord {
    #[serde(rename = "unitID")]
    pub unit_id: String,

    #[serde(rename = "sourceSystemCode")]
    pub source_system_code: String,

    pub status: DeleteStatus,
}

impl DeleteRecord {
    pub fn new(unit_id: &str, code: &str, status: DeleteStatus) -> DeleteRecord {
        DeleteRecord {
            unit_id: unit_id.to_string(),
            source_system_code: code.to_string(),
            status,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_record_wire_format() {
        let record = DeleteRecord::new("L.123@BRAHMS", "BRAHMS", DeleteStatus::Rejected);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "unitID": "L.123@BRAHMS",
                "sourceSystemCode": "BRAHMS",
                "status": "REJECTED",
            })
        );
    }

    #[test]
    fn removed_supersedes_rejected() {
        use DeleteStatus::*;
        assert_eq!(DeleteStatus::supersede(Rejected, Removed), Removed);
        assert_eq!(DeleteStatus::supersede(Removed, Rejected), Removed);
        assert_eq!(DeleteStatus::supersede(Rejected, Rejected), Rejected);
        assert_eq!(DeleteStatus::supersede(Removed, Removed), Removed);
    }
}
