use serde_json::json;
use tracing::error;
use ureq::Agent;

use crate::errors::Error;


/// Human readable progress messages to a chat webhook. Stays silent when no
/// webhook is configured.
pub struct Notifier {
    agent: Agent,
    webhook: Option<String>,
}

impl Notifier {
    pub fn from_env() -> Notifier {
        Notifier {
            agent: Agent::config_builder()
                .http_status_as_error(false)
                .build()
                .into(),
            webhook: std::env::var("SLACK_WEBHOOK").ok(),
        }
    }

    #[doc(hidden)]
    pub fn disabled() -> Notifier {
        Notifier {
            agent: Agent::config_builder()
                .http_status_as_error(false)
                .build()
                .into(),
            webhook: None,
        }
    }

    /// Posts a message; a non-200 response is an error for the caller to
    /// decide on
    pub fn send(&self, message: &str) -> Result<(), Error> {
        let Some(webhook) = &self.webhook else {
            return Ok(());
        };

        let response = self.agent.post(webhook).send_json(json!({ "text": message }))?;
        if response.status().as_u16() != 200 {
            return Err(std::io::Error::other(format!(
                "chat webhook returned {status}",
                status = response.status()
            ))
            .into());
        }
        Ok(())
    }

    /// Fire-and-forget variant used by the pipeline, chat being down should
    /// never stop a job
    pub fn post(&self, message: &str) {
        if let Err(err) = self.send(message) {
            error!(%err, "Failed to notify chat");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_without_webhook() {
        let notifier = Notifier::disabled();
        notifier.send("*Percolator* started `job`").unwrap();
        notifier.post("*Percolator* finished");
    }
}
