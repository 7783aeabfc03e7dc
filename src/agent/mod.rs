//! Response generation.
//!
//! An [`Agent`] turns the transcript into a [`Generation`]: a single-pass,
//! cancellable stream of [`ResponseFragment`]s.

pub mod backend;
pub mod chat;
pub mod context_tracker;
pub mod generation;
pub mod goodbye;
#[cfg(feature = "http")]
pub mod openai;
pub mod prompt;
#[cfg(feature = "http")]
pub mod restful;

pub use backend::{
    ChatBackend, ChatDelta, ChatMessage, ChatRequest, DeltaReceiver, FunctionDefinition,
    MockChatBackend,
};
pub use chat::ChatAgent;
pub use context_tracker::ContextTracker;
pub use generation::{FragmentSender, Generation};
pub use goodbye::{GoodbyeDetector, PhraseGoodbyeDetector};
#[cfg(feature = "http")]
pub use openai::OpenAiChatBackend;
#[cfg(feature = "http")]
pub use restful::{RestfulAgent, RestfulOutput};

use crate::transcript::Transcript;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Structured request from the agent to run an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCall {
    pub name: String,
    pub params: serde_json::Value,
}

/// One piece of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFragment {
    Text(String),
    ActionCall(ActionCall),
    /// The agent wants the conversation to end after this response.
    End,
}

impl ResponseFragment {
    pub fn text(text: impl Into<String>) -> Self {
        ResponseFragment::Text(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseFragment::Text(text) => Some(text),
            ResponseFragment::ActionCall(_) | ResponseFragment::End => None,
        }
    }
}

/// Everything an agent sees when asked to respond.
#[derive(Debug, Clone)]
pub struct AgentInput {
    pub human_input: String,
    pub conversation_id: String,
    pub is_interrupt: bool,
    /// Snapshot taken after the human turn was appended.
    pub transcript: Transcript,
}

/// Produces responses for a conversation.
pub trait Agent: Send + Sync {
    /// Starts a response. Must be called from within a tokio runtime.
    ///
    /// `cancel` aborts the generation; the agent stops forwarding fragments
    /// and releases any backend request at its next await point.
    fn generate_response(&self, input: AgentInput, cancel: CancellationToken) -> Generation;

    fn name(&self) -> &'static str;

    /// Detector run against each text fragment while the response streams.
    fn goodbye_detector(&self) -> Option<Arc<dyn GoodbyeDetector>> {
        None
    }
}

impl<T: Agent + ?Sized> Agent for Arc<T> {
    fn generate_response(&self, input: AgentInput, cancel: CancellationToken) -> Generation {
        (**self).generate_response(input, cancel)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn goodbye_detector(&self) -> Option<Arc<dyn GoodbyeDetector>> {
        (**self).goodbye_detector()
    }
}
