//! Filters caller utterances that are not part of the call.
//!
//! Background speech picked up on the caller's line (people talking nearby)
//! is asked about with a yes/no style prompt before it becomes a turn.

use crate::agent::{ChatBackend, ChatMessage, ChatRequest};
use crate::error::Result;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default instruction for the classification prompt.
pub const DEFAULT_CONTEXT_PROMPT: &str = "You are listening to the caller side of a phone call \
between an agent and a customer. Decide whether the last message is a response to the agent \
or just other people talking near the customer. Answer TRUE if it is related to the call, or \
FALSE if it is not. Answer with exactly one of these words.";

pub struct ContextTracker {
    backend: Arc<dyn ChatBackend>,
    model: String,
    history: Mutex<Vec<ChatMessage>>,
}

impl ContextTracker {
    pub fn new(backend: Arc<dyn ChatBackend>, model: &str, prompt: Option<&str>) -> Self {
        let prompt = prompt.unwrap_or(DEFAULT_CONTEXT_PROMPT);
        Self {
            backend,
            model: model.to_string(),
            history: Mutex::new(vec![ChatMessage::system(prompt)]),
        }
    }

    /// Asks the backend whether `user_message` belongs to the conversation.
    ///
    /// The exchange is kept so later decisions see earlier ones.
    pub async fn is_part_of_context(&self, user_message: &str) -> Result<bool> {
        let mut history = self.history.lock().await;
        history.push(ChatMessage::user(user_message));

        let request = ChatRequest {
            model: self.model.clone(),
            messages: history.clone(),
            functions: Vec::new(),
            max_tokens: 4,
            temperature: 0.0,
        };
        let reply = self.backend.complete(&request).await?;
        history.push(ChatMessage::assistant(reply.clone()));

        let related = reply.to_lowercase().contains("true");
        tracing::debug!(message = user_message, related, "context tracker decision");
        Ok(related)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockChatBackend;

    #[tokio::test]
    async fn test_true_reply_is_related() {
        let backend = MockChatBackend::new().with_completion("TRUE");
        let tracker = ContextTracker::new(Arc::new(backend), "mock", None);
        assert!(tracker.is_part_of_context("My name is Dana").await.unwrap());
    }

    #[tokio::test]
    async fn test_false_reply_is_unrelated_and_history_grows() {
        let backend = MockChatBackend::new()
            .with_completion("FALSE")
            .with_completion("true.");
        let tracker = ContextTracker::new(Arc::new(backend.clone()), "mock", Some("custom"));

        assert!(!tracker.is_part_of_context("pass the salt").await.unwrap());
        assert!(tracker.is_part_of_context("yes, that's me").await.unwrap());

        let requests = backend.requests();
        assert_eq!(requests[0].messages.len(), 2);
        assert_eq!(requests[0].messages[0].content, "custom");
        assert_eq!(requests[1].messages.len(), 4);
        assert_eq!(requests[1].messages[2].content, "FALSE");
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let tracker = ContextTracker::new(Arc::new(MockChatBackend::new().with_failure()), "mock", None);
        assert!(tracker.is_part_of_context("hello").await.is_err());
    }
}
