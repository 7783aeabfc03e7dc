//! Chat-model agent streaming collated text and function calls.

use crate::agent::prompt::build_messages;
use crate::agent::{
    ActionCall, Agent, AgentInput, ChatBackend, ChatDelta, ChatMessage, ChatRequest,
    DeltaReceiver, FragmentSender, FunctionDefinition, Generation, GoodbyeDetector,
    PhraseGoodbyeDetector, ResponseFragment,
};
use crate::config::AgentConfig;
use crate::defaults;
use crate::error::{Result, VoxlineError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Characters that end a speakable chunk.
const CHUNK_BOUNDARIES: &[char] = &['.', '!', '?', ',', ';', ':', '\n'];

pub struct ChatAgent {
    backend: Arc<dyn ChatBackend>,
    preamble: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    last_messages_cnt: usize,
    max_context_turns: usize,
    cut_off: Option<String>,
    functions: Vec<FunctionDefinition>,
    goodbye: Option<Arc<dyn GoodbyeDetector>>,
    expected_first_prompt: Option<String>,
    first_response: Mutex<Option<String>>,
    first_turn_taken: AtomicBool,
}

impl ChatAgent {
    pub fn new(config: &AgentConfig, backend: Arc<dyn ChatBackend>) -> Self {
        let cut_off = config.send_filler_on_interrupt.then(|| {
            config
                .cut_off_response
                .first()
                .cloned()
                .unwrap_or_else(|| defaults::CUT_OFF_RESPONSE.to_string())
        });
        let goodbye = config
            .goodbye_phrase
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| Arc::new(PhraseGoodbyeDetector::new(p)) as Arc<dyn GoodbyeDetector>);

        Self {
            backend,
            preamble: config.prompt_preamble.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            last_messages_cnt: config.last_messages_cnt,
            max_context_turns: config.max_context_turns,
            cut_off,
            functions: Vec::new(),
            goodbye,
            expected_first_prompt: config
                .expected_first_prompt
                .clone()
                .filter(|p| !p.is_empty()),
            first_response: Mutex::new(None),
            first_turn_taken: AtomicBool::new(false),
        }
    }

    /// Generates the reply to `expected_first_prompt` before the call, so
    /// the first caller turn is answered without a model round trip.
    /// Does nothing when no first prompt is configured.
    pub async fn prepare_first_response(&self) -> Result<()> {
        let Some(prompt) = &self.expected_first_prompt else {
            return Ok(());
        };
        let mut messages = Vec::with_capacity(2);
        if !self.preamble.is_empty() {
            messages.push(ChatMessage::system(self.preamble.clone()));
        }
        messages.push(ChatMessage::user(prompt.clone()));
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            functions: self.functions.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let text = self.backend.complete(&request).await?;
        tracing::debug!(chars = text.len(), "first response cached");
        if let Ok(mut slot) = self.first_response.lock() {
            *slot = Some(text);
        }
        Ok(())
    }

    /// The cached reply, only ever for the first turn.
    fn take_first_response(&self) -> Option<String> {
        if self.first_turn_taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.first_response
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .filter(|text| !text.trim().is_empty())
    }

    /// Functions the model may call.
    pub fn with_functions(mut self, functions: Vec<FunctionDefinition>) -> Self {
        self.functions = functions;
        self
    }

    /// Replace the goodbye detector
    pub fn with_goodbye_detector(mut self, detector: Arc<dyn GoodbyeDetector>) -> Self {
        self.goodbye = Some(detector);
        self
    }

    fn request(&self, input: &AgentInput) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: build_messages(
                &input.transcript,
                &self.preamble,
                self.last_messages_cnt,
                self.max_context_turns,
            ),
            functions: self.functions.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

impl Agent for ChatAgent {
    fn generate_response(&self, input: AgentInput, cancel: CancellationToken) -> Generation {
        if input.is_interrupt
            && let Some(cut_off) = &self.cut_off
        {
            tracing::debug!(
                conversation_id = %input.conversation_id,
                "interrupted, sending cut-off response"
            );
            return Generation::from_fragments(vec![ResponseFragment::text(cut_off.clone())]);
        }
        if let Some(text) = self.take_first_response() {
            tracing::debug!(
                conversation_id = %input.conversation_id,
                "answering with cached first response"
            );
            return Generation::from_fragments(vec![ResponseFragment::text(text)]);
        }

        let request = self.request(&input);
        let backend = self.backend.clone();
        Generation::spawn(&cancel, move |tx| async move {
            let deltas = backend.stream(&request, tx.cancellation_token()).await?;
            forward(deltas, tx).await
        })
    }

    fn name(&self) -> &'static str {
        "chat"
    }

    fn goodbye_detector(&self) -> Option<Arc<dyn GoodbyeDetector>> {
        self.goodbye.clone()
    }
}

#[derive(Default)]
struct PendingCall {
    name: String,
    arguments: String,
}

/// Collates deltas into fragments in stream order. A call is complete once
/// text or another named call follows it.
async fn forward(mut deltas: DeltaReceiver, tx: FragmentSender) -> Result<()> {
    let mut buffer = String::new();
    let mut call: Option<PendingCall> = None;

    while let Some(delta) = deltas.recv().await {
        match delta? {
            ChatDelta::Text(text) => {
                if let Some(pending) = call.take() {
                    send_call(pending, &tx).await?;
                }
                buffer.push_str(&text);
                if buffer.trim_end_matches(' ').ends_with(CHUNK_BOUNDARIES) {
                    flush(&mut buffer, &tx).await?;
                }
            }
            ChatDelta::FunctionCall { name, arguments } => {
                flush(&mut buffer, &tx).await?;
                if let Some(name) = name.filter(|n| !n.is_empty()) {
                    if let Some(pending) = call.take() {
                        send_call(pending, &tx).await?;
                    }
                    call = Some(PendingCall {
                        name,
                        arguments: String::new(),
                    });
                }
                call.get_or_insert_with(PendingCall::default)
                    .arguments
                    .push_str(&arguments);
            }
        }
    }

    flush(&mut buffer, &tx).await?;
    if let Some(pending) = call {
        send_call(pending, &tx).await?;
    }
    Ok(())
}

async fn send_call(pending: PendingCall, tx: &FragmentSender) -> Result<()> {
    tx.send(ResponseFragment::ActionCall(parse_call(pending)?)).await
}

async fn flush(buffer: &mut String, tx: &FragmentSender) -> Result<()> {
    let chunk = buffer.trim().to_string();
    buffer.clear();
    if chunk.is_empty() {
        return Ok(());
    }
    tx.send(ResponseFragment::Text(chunk)).await
}

fn parse_call(pending: PendingCall) -> Result<ActionCall> {
    if pending.name.is_empty() {
        return Err(VoxlineError::Backend {
            message: "function call without a name".to_string(),
        });
    }
    let params = if pending.arguments.trim().is_empty() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_str(&pending.arguments).map_err(|e| VoxlineError::Backend {
            message: format!("invalid arguments for {}: {}", pending.name, e),
        })?
    };
    Ok(ActionCall {
        name: pending.name,
        params,
    })
}
