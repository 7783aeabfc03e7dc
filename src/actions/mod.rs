//! Side-effect actions invoked by the agent.
//!
//! Each action declares an [`ActionConfig`] and a parameter schema and is
//! registered by name on an [`ActionsWorker`] before the conversation
//! starts.

pub mod dtmf;
pub mod worker;

pub use dtmf::{
    DtmfAction, DtmfDelivery, DtmfParameters, InBandTones, MockSignalingClient, SignalingClient,
};
#[cfg(feature = "http")]
pub use dtmf::HttpSignalingClient;
pub use worker::{ActionRequest, ActionResult, ActionsWorker};

use crate::agent::FunctionDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Declared surface of an action type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionConfig {
    pub name: String,
    pub description: String,
    /// Exported to the agent as a callable function.
    #[serde(default = "default_agent_invocable")]
    pub agent_invocable: bool,
}

fn default_agent_invocable() -> bool {
    true
}

impl ActionConfig {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            agent_invocable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionInput {
    pub action_config: ActionConfig,
    pub conversation_id: String,
    pub params: serde_json::Value,
    /// Identifier of the live call, when the conversation runs on one.
    pub call_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutput {
    pub success: bool,
    pub message: String,
}

impl ActionOutput {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// A side effect the agent can trigger.
///
/// Validation failures are reported as a failed [`ActionOutput`], never as
/// a panic or an error past the action boundary.
#[async_trait]
pub trait Action: Send + Sync {
    fn config(&self) -> &ActionConfig;

    /// JSON schema of `params`.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn run(&self, input: ActionInput) -> ActionOutput;

    fn name(&self) -> &str {
        &self.config().name
    }

    fn function_definition(&self) -> FunctionDefinition {
        FunctionDefinition {
            name: self.config().name.clone(),
            description: self.config().description.clone(),
            parameters: self.parameters_schema(),
        }
    }
}

#[async_trait]
impl<T: Action + ?Sized> Action for Arc<T> {
    fn config(&self) -> &ActionConfig {
        (**self).config()
    }

    fn parameters_schema(&self) -> serde_json::Value {
        (**self).parameters_schema()
    }

    async fn run(&self, input: ActionInput) -> ActionOutput {
        (**self).run(input).await
    }
}
