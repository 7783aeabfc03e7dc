//! Agent delegating each turn to a user-implemented HTTP endpoint.
//!
//! Every caller turn is POSTed as `{"human_input", "conversation_id"}`. The
//! endpoint answers with `{"type": "text", "response": ...}` to speak, or
//! `{"type": "end"}` to hang up. A failed request also ends the call.

use crate::agent::{Agent, AgentInput, Generation, ResponseFragment};
use crate::config::AgentConfig;
use crate::defaults;
use crate::error::{Result, VoxlineError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct RestfulAgent {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct RestfulInput {
    human_input: String,
    conversation_id: String,
}

/// Reply of the endpoint. Unknown fields such as `metadata` are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RestfulOutput {
    Text { response: String },
    End,
}

impl RestfulAgent {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout: Duration::from_millis(defaults::RESTFUL_AGENT_TIMEOUT_MS),
        }
    }

    /// Builds the agent from `agent.respond_url`.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let url = config
            .respond_url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| VoxlineError::ConfigInvalidValue {
                key: "agent.respond_url".to_string(),
                message: "required for the user-implemented agent".to_string(),
            })?;
        Ok(Self::new(url))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

async fn respond(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    input: &RestfulInput,
) -> Result<RestfulOutput> {
    let response = client.post(url).timeout(timeout).json(input).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(VoxlineError::Backend {
            message: format!("user-implemented agent returned HTTP {}", status),
        });
    }
    Ok(response.json().await?)
}

impl Agent for RestfulAgent {
    fn generate_response(&self, input: AgentInput, cancel: CancellationToken) -> Generation {
        let client = self.client.clone();
        let url = self.url.clone();
        let timeout = self.timeout;
        let body = RestfulInput {
            human_input: input.human_input,
            conversation_id: input.conversation_id,
        };

        Generation::spawn(&cancel, move |tx| async move {
            let fragment = match respond(&client, &url, timeout, &body).await {
                Ok(RestfulOutput::Text { response }) => ResponseFragment::Text(response),
                Ok(RestfulOutput::End) => ResponseFragment::End,
                Err(e) => {
                    tracing::error!(
                        conversation_id = %body.conversation_id,
                        error = %e,
                        "user-implemented agent failed, ending conversation"
                    );
                    ResponseFragment::End
                }
            };
            tx.send(fragment).await
        })
    }

    fn name(&self) -> &'static str {
        "restful"
    }
}
