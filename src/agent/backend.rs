//! Chat completion backend contract.

use crate::error::{Result, VoxlineError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn function(name: &str, content: impl Into<String>) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::new("function", content)
        }
    }

    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            name: None,
        }
    }
}

/// Function exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub functions: Vec<FunctionDefinition>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Incremental piece of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatDelta {
    Text(String),
    /// Function-call pieces; the name usually arrives only in the first.
    FunctionCall {
        name: Option<String>,
        arguments: String,
    },
}

pub type DeltaReceiver = mpsc::Receiver<Result<ChatDelta>>;

/// LLM backend producing single completions or delta streams.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Returns the full completion text.
    async fn complete(&self, request: &ChatRequest) -> Result<String>;

    /// Streams completion deltas. The backend stops reading and releases the
    /// request once `cancel` fires or the receiver is dropped.
    async fn stream(&self, request: &ChatRequest, cancel: CancellationToken)
    -> Result<DeltaReceiver>;
}

#[async_trait]
impl<T: ChatBackend + ?Sized> ChatBackend for Arc<T> {
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        (**self).complete(request).await
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaReceiver> {
        (**self).stream(request, cancel).await
    }
}

/// Scripted backend for tests.
///
/// Each `stream` call pops the next scripted response; each `complete` call
/// pops the next scripted completion. Requests are recorded.
#[derive(Debug, Clone, Default)]
pub struct MockChatBackend {
    responses: Arc<Mutex<VecDeque<Vec<ChatDelta>>>>,
    completions: Arc<Mutex<VecDeque<String>>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
    calls: Arc<AtomicUsize>,
    delta_delay: Duration,
    should_fail: bool,
}

impl MockChatBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a streamed response made of text deltas
    pub fn with_text_response(self, deltas: &[&str]) -> Self {
        let deltas = deltas.iter().map(|d| ChatDelta::Text(d.to_string())).collect();
        self.with_response(deltas)
    }

    /// Queue a streamed response
    pub fn with_response(self, deltas: Vec<ChatDelta>) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(deltas);
        }
        self
    }

    /// Queue a non-streamed completion
    pub fn with_completion(self, text: &str) -> Self {
        if let Ok(mut completions) = self.completions.lock() {
            completions.push_back(text.to_string());
        }
        self
    }

    /// Pause between streamed deltas
    pub fn with_delta_delay(mut self, delay: Duration) -> Self {
        self.delta_delay = delay;
        self
    }

    /// Configure every call to fail
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Number of backend calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn record(&self, request: &ChatRequest) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if self.should_fail {
            return Err(VoxlineError::Backend {
                message: "mock backend failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatBackend for MockChatBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        self.record(request)?;
        let next = self.completions.lock().ok().and_then(|mut c| c.pop_front());
        Ok(next.unwrap_or_default())
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaReceiver> {
        self.record(request)?;
        let deltas = self
            .responses
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .unwrap_or_default();
        let delay = self.delta_delay;
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            for delta in deltas {
                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() || tx.send(Ok(delta)).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "mock".to_string(),
            messages: vec![ChatMessage::user("hi")],
            functions: Vec::new(),
            max_tokens: 16,
            temperature: 0.0,
        }
    }

    #[tokio::test]
    async fn test_mock_streams_scripted_deltas() {
        let backend = MockChatBackend::new().with_text_response(&["Sure,", " let me help."]);
        let mut rx = backend
            .stream(&request(), CancellationToken::new())
            .await
            .unwrap();

        let mut deltas = Vec::new();
        while let Some(delta) = rx.recv().await {
            deltas.push(delta.unwrap());
        }
        assert_eq!(
            deltas,
            vec![
                ChatDelta::Text("Sure,".to_string()),
                ChatDelta::Text(" let me help.".to_string())
            ]
        );
        assert_eq!(backend.calls(), 1);
        assert_eq!(backend.requests()[0].messages[0].content, "hi");
    }

    #[tokio::test]
    async fn test_mock_stream_stops_on_cancel() {
        let backend = MockChatBackend::new()
            .with_text_response(&["a", "b", "c"])
            .with_delta_delay(Duration::from_millis(200));
        let cancel = CancellationToken::new();
        let mut rx = backend.stream(&request(), cancel.clone()).await.unwrap();
        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_mock_completion_and_failure() {
        let backend = MockChatBackend::new().with_completion("TRUE");
        assert_eq!(backend.complete(&request()).await.unwrap(), "TRUE");

        let failing = MockChatBackend::new().with_failure();
        assert!(failing.complete(&request()).await.is_err());
        assert!(
            failing
                .stream(&request(), CancellationToken::new())
                .await
                .is_err()
        );
    }

    #[test]
    fn test_function_message_serializes_name() {
        let json = serde_json::to_value(ChatMessage::function("send_dtmf", "ok")).unwrap();
        assert_eq!(json["role"], "function");
        assert_eq!(json["name"], "send_dtmf");
        let plain = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert!(plain.get("name").is_none());
    }
}
