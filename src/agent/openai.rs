//! OpenAI-compatible chat completion backend.
//!
//! Streaming responses are read as server-sent events; each `data:` line
//! carries one JSON chunk and `data: [DONE]` ends the stream.

use crate::agent::{
    ChatBackend, ChatDelta, ChatMessage, ChatRequest, DeltaReceiver, FunctionDefinition,
};
use crate::config::AgentConfig;
use crate::error::{Result, VoxlineError};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DELTA_BUFFER: usize = 64;

pub struct OpenAiChatBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct RequestBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "no_functions")]
    functions: &'a [FunctionDefinition],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

fn no_functions(functions: &&[FunctionDefinition]) -> bool {
    functions.is_empty()
}

impl<'a> RequestBody<'a> {
    fn new(request: &'a ChatRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            messages: &request.messages,
            functions: &request.functions,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream,
        }
    }
}

#[derive(Deserialize)]
struct Completion {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCallDelta>,
}

#[derive(Deserialize)]
struct FunctionCallDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

impl OpenAiChatBackend {
    /// Fails with [`VoxlineError::MissingCredential`] when no API key is set.
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| VoxlineError::MissingCredential {
                name: "agent.api_key".to_string(),
            })?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn post(&self, body: &RequestBody<'_>) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(VoxlineError::Backend {
                message: format!("HTTP {}: {}", status, text),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatBackend for OpenAiChatBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let response = self.post(&RequestBody::new(request, false)).await?;
        let completion: Completion = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| VoxlineError::Backend {
                message: "completion without choices".to_string(),
            })
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaReceiver> {
        let body = RequestBody::new(request, true);
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(VoxlineError::Cancelled),
            response = self.post(&body) => response?,
        };
        tracing::debug!(model = %request.model, "chat stream established");

        let (tx, rx) = mpsc::channel(DELTA_BUFFER);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            // Raw bytes: a multi-byte character may span two chunks.
            let mut buffer: Vec<u8> = Vec::new();

            loop {
                let chunk = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        tracing::debug!("chat stream cancelled");
                        return;
                    }
                    chunk = stream.next() => chunk,
                };
                let bytes = match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        if tx.send(Err(e.into())).await.is_err() {
                            tracing::debug!("chat stream error after receiver left");
                        }
                        return;
                    }
                    None => return,
                };
                buffer.extend_from_slice(&bytes);

                while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&raw);

                    match parse_line(line.trim()) {
                        SseLine::Done => return,
                        SseLine::Skip => {}
                        SseLine::Deltas(deltas) => {
                            for delta in deltas {
                                if tx.send(Ok(delta)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

enum SseLine {
    Done,
    Skip,
    Deltas(Vec<ChatDelta>),
}

fn parse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:").map(str::trim_start) else {
        return SseLine::Skip;
    };
    if data == "[DONE]" {
        return SseLine::Done;
    }

    let chunk = match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::debug!(error = %e, data, "skipping unparseable stream chunk");
            return SseLine::Skip;
        }
    };

    let mut deltas = Vec::new();
    for choice in chunk.choices.into_iter().take(1) {
        if let Some(content) = choice.delta.content
            && !content.is_empty()
        {
            deltas.push(ChatDelta::Text(content));
        }
        if let Some(call) = choice.delta.function_call {
            deltas.push(ChatDelta::FunctionCall {
                name: call.name,
                arguments: call.arguments.unwrap_or_default(),
            });
        }
    }
    SseLine::Deltas(deltas)
}
