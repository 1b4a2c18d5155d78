use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error};
use ureq::Agent;

use crate::errors::{ConfigError, Error};


/// The lifecycle states an audit event can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditState {
    Start,
    Finish,
    Fail,
    Import,
    New,
    Update,
    Delete,
    Kill,
    Enrich,
}

#[derive(Debug, Serialize)]
struct AuditEvent<'a> {
    #[serde(rename = "@timestamp")]
    timestamp: String,

    /// The job date, distinct from the moment the event was shipped
    ppd_timestamp: String,

    state: AuditState,

    #[serde(rename = "type")]
    kind: &'a str,

    source: &'a str,

    comment: &'a str,
}


/// Ships per-record and per-job events to the external document log.
///
/// Events land under an index named after the lowercased job id with the
/// logical record id as document id. The log is diagnostics, not state:
/// transport failures are logged locally and never abort the pipeline.
pub struct AuditLog {
    agent: Agent,
    host: Option<String>,
    index: String,
    job_date: DateTime<Utc>,
}

impl AuditLog {
    /// Connects using `LOGGING_HOST`; without it the log is disabled, which
    /// is the configuration used by the test suite.
    pub fn connect() -> Result<AuditLog, Error> {
        let host = std::env::var("LOGGING_HOST").ok();
        let agent: Agent = Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();

        if let Some(host) = &host {
            debug!(host, "Connecting to the audit log");
            agent
                .get(host)
                .call()
                .map_err(|_| ConfigError::UnreachableLogSink(host.clone()))?;
        }

        Ok(AuditLog {
            agent,
            host,
            index: String::from("percolator"),
            job_date: Utc::now(),
        })
    }

    #[doc(hidden)]
    pub fn disabled() -> AuditLog {
        AuditLog {
            agent: Agent::config_builder()
                .http_status_as_error(false)
                .build()
                .into(),
            host: None,
            index: String::from("percolator"),
            job_date: Utc::now(),
        }
    }

    pub fn set_job(&mut self, job_id: &str, job_date: DateTime<Utc>) {
        self.index = job_id.to_lowercase();
        self.job_date = job_date;
    }

    /// Record a state change. `recid` becomes the document id and defaults
    /// to "percolator" for job level events.
    pub fn record(&self, state: AuditState, recid: &str, kind: &str, source: &str, comment: &str) {
        let event = AuditEvent {
            timestamp: Utc::now().to_rfc3339(),
            ppd_timestamp: self.job_date.to_rfc3339(),
            state,
            kind,
            source,
            comment,
        };

        let Some(host) = &self.host else {
            debug!(?state, recid, source, "Audit logging disabled");
            return;
        };

        let recid = if recid.is_empty() { "percolator" } else { recid };
        let url = format!("{host}/{index}/logging/{recid}", index = self.index);

        match self.agent.put(&url).send_json(&event) {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                error!(status = %response.status(), url, "Failed to ship audit event");
            }
            Err(err) => {
                error!(%err, url, "Timeout shipping audit event");
            }
        }
    }

    pub fn job_event(&self, state: AuditState, comment: &str) {
        self.record(state, "percolator", "", "", comment);
    }
}
