use crate::actions::{ActionResult, ActionsWorker};
use crate::agent::{Agent, AgentInput, ContextTracker, Generation, ResponseFragment};
use crate::audio::AudioFrame;
use crate::config::Config;
use crate::conversation::response::{ResponseEvent, ResponseJob, ResponseTask};
use crate::conversation::state::{
    ConversationEvent, ConversationState, Effect, TransitionContext, transition,
};
use crate::defaults;
use crate::error::{Result, VoxlineError};
use crate::output::{OutputDevice, OutputSender};
use crate::synthesizer::Synthesizer;
use crate::transcriber::{AudioInput, Transcriber, Transcription};
use crate::transcript::Transcript;
use crate::worker::{TaskWorker, WorkerHandle};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Turn-taking settings of one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationConfig {
    pub min_confidence: f32,
    pub interrupt_on_partial: bool,
    pub mute_during_agent_speech: bool,
    pub allow_interruptions: bool,
    /// Spoken as the first agent turn.
    pub initial_message: Option<String>,
    /// Best-effort line spoken when the recognition session fails.
    pub closing_message: Option<String>,
    pub drain_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ConversationConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_confidence: config.transcriber.min_confidence,
            interrupt_on_partial: config.transcriber.interrupt_on_partial,
            mute_during_agent_speech: config.transcriber.mute_during_agent_speech,
            allow_interruptions: config.agent.allow_interruptions,
            initial_message: config.agent.initial_message.clone(),
            closing_message: Some(defaults::ERROR_CLOSING_MESSAGE.to_string()),
            drain_timeout: Duration::from_millis(defaults::OUTPUT_DRAIN_TIMEOUT_MS),
            shutdown_timeout: Duration::from_millis(defaults::WORKER_SHUTDOWN_TIMEOUT_MS),
        }
    }
}

/// Wires a transcriber, an agent, synthesis, actions and an output device
/// into one conversation.
///
/// Nothing runs until [`start`](Self::start) hands the parts to the
/// conversation task.
pub struct ConversationPipeline {
    transcriber: Transcriber,
    agent: Arc<dyn Agent>,
    synthesizer: Arc<dyn Synthesizer>,
    output: OutputDevice,
    actions: Option<ActionsWorker>,
    context_tracker: Option<ContextTracker>,
    config: ConversationConfig,
    conversation_id: String,
    transcript: Transcript,
}

impl ConversationPipeline {
    pub fn new(
        transcriber: Transcriber,
        agent: Arc<dyn Agent>,
        synthesizer: Arc<dyn Synthesizer>,
        output: OutputDevice,
    ) -> Self {
        Self {
            transcriber,
            agent,
            synthesizer,
            output,
            actions: None,
            context_tracker: None,
            config: ConversationConfig::default(),
            conversation_id: uuid::Uuid::new_v4().to_string(),
            transcript: Transcript::new(),
        }
    }

    /// Runs agent-requested actions on a cooperative worker.
    pub fn with_actions(mut self, actions: ActionsWorker) -> Self {
        self.actions = Some(actions);
        self
    }

    /// Filters final utterances through `tracker` before they become turns.
    pub fn with_context_tracker(mut self, tracker: ContextTracker) -> Self {
        self.context_tracker = Some(tracker);
        self
    }

    pub fn with_config(mut self, config: ConversationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = conversation_id.into();
        self
    }

    /// Seeds the transcript, typically with a system preamble.
    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = transcript;
        self
    }

    /// Starts every worker and the conversation task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<ConversationHandle> {
        let actions = self.actions.map(TaskWorker::new);
        self.output.start()?;
        self.transcriber.start()?;
        if let Some(actions) = &actions {
            actions.start()?;
        }

        let (state_tx, state_rx) = watch::channel(ConversationState::Idle);
        let (transcript_tx, transcript_rx) = watch::channel(self.transcript.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let end = CancellationToken::new();
        let audio = self.transcriber.audio_input();

        tracing::info!(conversation_id = %self.conversation_id, "starting conversation");
        let conversation = Conversation {
            context: TransitionContext {
                allow_interruptions: self.config.allow_interruptions,
            },
            sender: self.output.sender(),
            transcriber: self.transcriber,
            agent: self.agent,
            synthesizer: self.synthesizer,
            output: self.output,
            actions_open: actions.is_some(),
            actions,
            context_tracker: self.context_tracker,
            config: self.config,
            conversation_id: self.conversation_id.clone(),
            transcript: self.transcript,
            state: ConversationState::Idle,
            response: None,
            next_response_id: 0,
            deferred_results: Vec::new(),
            events_tx,
            events_rx,
            state_tx,
            transcript_tx,
            end: end.clone(),
        };
        let task = tokio::spawn(conversation.run());

        Ok(ConversationHandle {
            conversation_id: self.conversation_id,
            audio,
            end,
            state: state_rx,
            transcript: transcript_rx,
            task: Mutex::new(Some(task)),
        })
    }
}

/// Caller-side handle of a running conversation.
pub struct ConversationHandle {
    conversation_id: String,
    audio: AudioInput,
    end: CancellationToken,
    state: watch::Receiver<ConversationState>,
    transcript: watch::Receiver<Transcript>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConversationHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Feeds caller audio. Rejected once the conversation ended.
    pub fn send_audio(&self, frame: AudioFrame) -> Result<()> {
        if self.state.borrow().is_ended() {
            return Err(VoxlineError::ConversationEnded);
        }
        self.audio.send_audio(frame).map_err(|e| match e {
            VoxlineError::WorkerNotRunning { .. } => VoxlineError::ConversationEnded,
            other => other,
        })
    }

    /// Requests the end of the conversation. Utterances already
    /// transcribed are recorded first.
    pub fn end(&self) {
        self.end.cancel();
    }

    pub fn state(&self) -> ConversationState {
        self.state.borrow().clone()
    }

    pub fn is_ended(&self) -> bool {
        self.state.borrow().is_ended()
    }

    pub fn transcript(&self) -> Transcript {
        self.transcript.borrow().clone()
    }

    /// Waits up to `timeout` for a state matching `predicate`.
    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&ConversationState) -> bool,
        timeout: Duration,
    ) -> bool {
        let mut rx = self.state.clone();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(predicate)).await,
            Ok(Ok(_))
        )
    }

    /// Waits up to `timeout` for a transcript matching `predicate`.
    pub async fn wait_for_transcript(
        &self,
        predicate: impl FnMut(&Transcript) -> bool,
        timeout: Duration,
    ) -> bool {
        let mut rx = self.transcript.clone();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(predicate)).await,
            Ok(Ok(_))
        )
    }

    /// Waits for the conversation task, and with it every worker, to stop.
    pub async fn join(&self) {
        let task = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::error!(
                conversation_id = %self.conversation_id,
                error = %e,
                "conversation task failed"
            );
        }
    }
}

/// What woke the conversation loop.
enum Wake {
    Transcription(Option<Transcription>),
    Response(ResponseEvent),
    Action(Option<ActionResult>),
    End,
}

/// State owned by the conversation task.
struct Conversation {
    transcriber: Transcriber,
    agent: Arc<dyn Agent>,
    synthesizer: Arc<dyn Synthesizer>,
    output: OutputDevice,
    sender: OutputSender,
    actions: Option<TaskWorker<ActionsWorker>>,
    actions_open: bool,
    context_tracker: Option<ContextTracker>,
    config: ConversationConfig,
    conversation_id: String,
    transcript: Transcript,
    state: ConversationState,
    context: TransitionContext,
    response: Option<ResponseTask>,
    next_response_id: u64,
    /// Action results held back while a response is in flight.
    deferred_results: Vec<ActionResult>,
    events_tx: mpsc::UnboundedSender<ResponseEvent>,
    events_rx: mpsc::UnboundedReceiver<ResponseEvent>,
    state_tx: watch::Sender<ConversationState>,
    transcript_tx: watch::Sender<Transcript>,
    end: CancellationToken,
}

async fn next_action_result(actions: Option<&TaskWorker<ActionsWorker>>) -> Option<ActionResult> {
    match actions {
        Some(actions) => actions.output().recv().await,
        None => std::future::pending().await,
    }
}

impl Conversation {
    async fn run(mut self) {
        if let Err(e) = self.await_ready().await {
            tracing::error!(
                conversation_id = %self.conversation_id,
                error = %e,
                "conversation failed to start"
            );
            self.speak_closing_message().await;
            self.apply(ConversationEvent::Fatal).await;
            return;
        }

        let greeting = self.config.initial_message.clone();
        self.apply(ConversationEvent::Started { greeting }).await;

        while !self.state.is_ended() {
            let wake = tokio::select! {
                biased;
                transcription = self.transcriber.output().recv() => Wake::Transcription(transcription),
                Some(event) = self.events_rx.recv() => Wake::Response(event),
                result = next_action_result(self.actions.as_ref()), if self.actions_open => {
                    Wake::Action(result)
                }
                () = self.end.cancelled() => Wake::End,
            };

            match wake {
                Wake::Transcription(Some(transcription)) => {
                    self.on_transcription(transcription).await;
                }
                Wake::Transcription(None) => {
                    tracing::error!(
                        conversation_id = %self.conversation_id,
                        "transcriber stopped unexpectedly"
                    );
                    self.apply(ConversationEvent::Fatal).await;
                }
                Wake::Response(event) => self.on_response_event(event).await,
                Wake::Action(Some(result)) => self.on_action_result(result),
                Wake::Action(None) => self.actions_open = false,
                Wake::End => {
                    while let Some(transcription) = self.transcriber.output().try_recv() {
                        self.on_transcription(transcription).await;
                    }
                    self.apply(ConversationEvent::EndRequested).await;
                }
            }
        }
        tracing::info!(conversation_id = %self.conversation_id, "conversation ended");
    }

    async fn await_ready(&self) -> Result<()> {
        self.output.ready().await?;
        if let Some(actions) = &self.actions {
            actions.ready().await?;
        }
        self.transcriber.ready().await
    }

    async fn speak_closing_message(&self) {
        let Some(message) = &self.config.closing_message else {
            return;
        };
        match self.synthesizer.synthesize(message).await {
            Ok(frames) => {
                for frame in frames {
                    if let Err(e) = self.sender.send_unscoped(frame) {
                        tracing::debug!(error = %e, "closing message not delivered");
                        break;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to synthesize closing message"),
        }
    }

    async fn on_transcription(&mut self, transcription: Transcription) {
        let transcription = if self.state.is_responding()
            && (transcription.is_final || self.config.interrupt_on_partial)
        {
            transcription.as_interrupt()
        } else {
            transcription
        };
        let text = transcription.message.trim().to_string();
        if text.is_empty() {
            return;
        }

        if !transcription.is_final {
            if transcription.is_interrupt {
                tracing::debug!(partial = %text, "caller started speaking over the agent");
                self.apply(ConversationEvent::BargeIn).await;
            }
            return;
        }

        if transcription.confidence < self.config.min_confidence {
            tracing::debug!(
                confidence = transcription.confidence,
                "ignoring low-confidence transcription"
            );
            return;
        }
        if let Some(tracker) = &self.context_tracker {
            match tracker.is_part_of_context(&text).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(message = %text, "ignoring utterance outside the conversation");
                    return;
                }
                Err(e) => tracing::warn!(error = %e, "context tracker failed, keeping utterance"),
            }
        }

        tracing::info!(
            conversation_id = %self.conversation_id,
            interrupt = transcription.is_interrupt,
            message = %text,
            "caller turn"
        );
        self.apply(ConversationEvent::HumanUtterance { text }).await;
    }

    async fn on_response_event(&mut self, event: ResponseEvent) {
        let current = self.response.as_ref().map(ResponseTask::id);
        match event {
            ResponseEvent::Goodbye { id } if current == Some(id) => {
                tracing::info!(conversation_id = %self.conversation_id, "goodbye detected");
                self.apply(ConversationEvent::GoodbyeDetected).await;
            }
            ResponseEvent::Finished {
                id,
                spoken,
                goodbye,
            } if current == Some(id) => {
                self.response = None;
                self.apply(ConversationEvent::ResponseCompleted {
                    text: spoken,
                    goodbye,
                })
                .await;
            }
            stale => tracing::debug!(event = ?stale, "ignoring event of a superseded response"),
        }
    }

    fn on_action_result(&mut self, result: ActionResult) {
        if self.response.is_some() {
            self.deferred_results.push(result);
        } else {
            self.record_action_result(result);
        }
    }

    fn record_action_result(&mut self, result: ActionResult) {
        tracing::info!(
            action = %result.action,
            success = result.success,
            "recording action result"
        );
        self.transcript
            .add_action_result(&result.action, result.success, result.message);
        self.publish_transcript();
    }

    async fn apply(&mut self, event: ConversationEvent) {
        let result = match transition(&self.state, &self.context, event) {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(error = %e, "transition skipped");
                return;
            }
        };
        if result.new_state != self.state {
            tracing::debug!(from = ?self.state, to = ?result.new_state, "state change");
        }
        self.state = result.new_state;

        for effect in result.effects {
            self.execute(effect).await;
        }

        if self.response.is_none() {
            for result in std::mem::take(&mut self.deferred_results) {
                self.record_action_result(result);
            }
        }
        self.sync_mute();
        self.state_tx.send_replace(self.state.clone());
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::AppendHumanTurn { text } => {
                self.transcript.add_human_message(text);
                self.publish_transcript();
            }
            Effect::AppendAgentTurn { text } => {
                self.transcript.add_agent_message(text);
                self.publish_transcript();
            }
            Effect::StartResponse {
                human_input,
                is_interrupt,
            } => {
                let cancel = CancellationToken::new();
                let input = AgentInput {
                    human_input,
                    conversation_id: self.conversation_id.clone(),
                    is_interrupt,
                    transcript: self.transcript.clone(),
                };
                let generation = self.agent.generate_response(input, cancel.clone());
                self.start_response(generation, cancel);
            }
            Effect::StartGreeting { text } => {
                let generation = Generation::from_fragments(vec![ResponseFragment::Text(text)]);
                self.start_response(generation, CancellationToken::new());
            }
            Effect::CancelResponse => {
                if let Some(response) = self.response.take() {
                    tracing::info!(response = response.id(), "cancelling agent response");
                    response.cancel();
                }
            }
            Effect::ClearOutput => self.sender.clear_pending(),
            Effect::Shutdown { flush_output } => self.shutdown(flush_output).await,
        }
    }

    fn start_response(&mut self, generation: Generation, cancel: CancellationToken) {
        if let Some(previous) = self.response.take() {
            previous.cancel();
        }
        self.next_response_id += 1;
        let job = ResponseJob {
            id: self.next_response_id,
            generation,
            cancel,
            synthesizer: Arc::clone(&self.synthesizer),
            scope: self.sender.begin_scope(),
            output: self.sender.clone(),
            goodbye: self.agent.goodbye_detector(),
            actions: self.actions.as_ref().map(|a| a.input().clone()),
            conversation_id: self.conversation_id.clone(),
            events: self.events_tx.clone(),
        };
        self.response = Some(ResponseTask::spawn(job));
    }

    /// Stops the workers in dependency order: actions, the response task,
    /// the transcriber, then output.
    async fn shutdown(&mut self, flush_output: bool) {
        tracing::info!(conversation_id = %self.conversation_id, "shutting down conversation");
        let timeout = self.config.shutdown_timeout;

        if let Some(actions) = &self.actions {
            actions.terminate();
        }
        if let Some(response) = self.response.take() {
            response.cancel();
            response.join(timeout).await;
        }
        self.transcriber.terminate();
        if flush_output && !self.output.wait_idle(self.config.drain_timeout).await {
            tracing::debug!("output not drained before shutdown");
        }
        self.output.terminate();

        let mut stopped = true;
        if let Some(actions) = &self.actions {
            stopped &= actions.wait_finished(timeout).await;
        }
        stopped &= self.transcriber.wait_finished(timeout).await;
        stopped &= self.output.wait_finished(timeout).await;
        if !stopped {
            tracing::warn!(
                conversation_id = %self.conversation_id,
                "some workers did not stop in time"
            );
        }
    }

    fn sync_mute(&self) {
        if !self.config.mute_during_agent_speech {
            return;
        }
        if self.state.is_responding() {
            self.transcriber.mute();
        } else {
            self.transcriber.unmute();
        }
    }

    fn publish_transcript(&self) {
        self.transcript_tx.send_replace(self.transcript.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ChatAgent, MockChatBackend};
    use crate::config::AgentConfig;
    use crate::output::CollectorSink;
    use crate::synthesizer::MockSynthesizer;
    use crate::transcriber::MockRecognizer;
    use crate::transcript::Role;

    const WAIT: Duration = Duration::from_secs(3);

    fn speech(text: &str) -> AudioFrame {
        MockRecognizer::speech_frame(text)
    }

    fn pipeline(backend: MockChatBackend, sink: &CollectorSink) -> ConversationPipeline {
        let agent = ChatAgent::new(&AgentConfig::default(), Arc::new(backend));
        ConversationPipeline::new(
            Transcriber::cooperative(MockRecognizer::new()),
            Arc::new(agent),
            Arc::new(MockSynthesizer::new()),
            OutputDevice::new(sink.clone()),
        )
        .with_conversation_id("test-call")
    }

    fn roles(transcript: &Transcript) -> Vec<Role> {
        transcript.turns().iter().map(|t| t.role).collect()
    }

    #[test]
    fn test_config_follows_file_settings() {
        let mut config = Config::default();
        config.transcriber.min_confidence = 0.4;
        config.agent.initial_message = Some("Hi!".to_string());
        config.agent.allow_interruptions = false;

        let conversation = ConversationConfig::from_config(&config);
        assert_eq!(conversation.min_confidence, 0.4);
        assert_eq!(conversation.initial_message.as_deref(), Some("Hi!"));
        assert!(!conversation.allow_interruptions);
    }

    #[tokio::test]
    async fn test_final_transcription_gets_one_response() {
        let sink = CollectorSink::new();
        let backend = MockChatBackend::new().with_text_response(&["Sure,", " let me help."]);
        let handle = pipeline(backend.clone(), &sink).start().unwrap();
        assert!(handle.wait_for_state(|s| *s == ConversationState::listening(), WAIT).await);

        handle.send_audio(speech("book a flight")).unwrap();
        assert!(handle.wait_for_transcript(|t| t.len() == 2, WAIT).await);

        let transcript = handle.transcript();
        assert_eq!(roles(&transcript), vec![Role::Human, Role::Agent]);
        assert_eq!(transcript.turns()[1].text, "Sure, let me help.");
        assert_eq!(backend.calls(), 1);

        handle.end();
        handle.join().await;
        assert!(handle.is_ended());
    }

    #[tokio::test]
    async fn test_greeting_is_first_agent_turn() {
        let sink = CollectorSink::new();
        let config = ConversationConfig {
            initial_message: Some("Hello, how can I help?".to_string()),
            ..ConversationConfig::default()
        };
        let handle = pipeline(MockChatBackend::new(), &sink)
            .with_config(config)
            .start()
            .unwrap();

        assert!(handle.wait_for_transcript(|t| t.len() == 1, WAIT).await);
        let transcript = handle.transcript();
        assert_eq!(transcript.turns()[0].role, Role::Agent);
        assert_eq!(transcript.turns()[0].text, "Hello, how can I help?");
        assert!(sink.wait_for(1, WAIT).await);

        handle.end();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_low_confidence_is_ignored() {
        let sink = CollectorSink::new();
        let backend = MockChatBackend::new().with_text_response(&["Hi."]);
        let agent = ChatAgent::new(&AgentConfig::default(), Arc::new(backend.clone()));
        let config = ConversationConfig {
            min_confidence: 0.8,
            ..ConversationConfig::default()
        };
        let handle = ConversationPipeline::new(
            Transcriber::cooperative(MockRecognizer::new().with_confidence(0.5)),
            Arc::new(agent),
            Arc::new(MockSynthesizer::new()),
            OutputDevice::new(sink.clone()),
        )
        .with_config(config)
        .start()
        .unwrap();

        handle.send_audio(speech("mumble")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.transcript().is_empty());
        assert_eq!(backend.calls(), 0);

        handle.end();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_end_rejects_further_audio() {
        let sink = CollectorSink::new();
        let handle = pipeline(MockChatBackend::new(), &sink).start().unwrap();
        handle.end();
        handle.join().await;

        assert_eq!(handle.state(), ConversationState::Ended);
        assert!(matches!(
            handle.send_audio(speech("hello?")),
            Err(VoxlineError::ConversationEnded)
        ));
    }

    #[tokio::test]
    async fn test_session_failure_speaks_closing_message_and_ends() {
        let sink = CollectorSink::new();
        let agent = ChatAgent::new(&AgentConfig::default(), Arc::new(MockChatBackend::new()));
        let handle = ConversationPipeline::new(
            Transcriber::cooperative(MockRecognizer::new().with_connect_failure("refused")),
            Arc::new(agent),
            Arc::new(MockSynthesizer::new()),
            OutputDevice::new(sink.clone()),
        )
        .start()
        .unwrap();

        handle.join().await;
        assert!(handle.is_ended());
        let spoken: Vec<String> = sink
            .frames()
            .iter()
            .filter_map(MockSynthesizer::text_of)
            .collect();
        assert_eq!(spoken, vec![defaults::ERROR_CLOSING_MESSAGE]);
    }

    #[tokio::test]
    async fn test_mute_during_agent_speech_replaces_audio_with_silence() {
        let sink = CollectorSink::new().with_write_delay(Duration::from_millis(50));
        let recognizer = MockRecognizer::new();
        let received = recognizer.received();
        let agent = ChatAgent::new(
            &AgentConfig::default(),
            Arc::new(
                MockChatBackend::new()
                    .with_text_response(&["One.", " Two.", " Three."])
                    .with_delta_delay(Duration::from_millis(40)),
            ),
        );
        let config = ConversationConfig {
            mute_during_agent_speech: true,
            ..ConversationConfig::default()
        };
        let handle = ConversationPipeline::new(
            Transcriber::cooperative(recognizer),
            Arc::new(agent),
            Arc::new(MockSynthesizer::new()),
            OutputDevice::new(sink.clone()),
        )
        .with_config(config)
        .start()
        .unwrap();
        assert!(handle.wait_for_state(|s| *s == ConversationState::listening(), WAIT).await);

        handle.send_audio(speech("count to three")).unwrap();
        assert!(handle.wait_for_state(ConversationState::is_responding, WAIT).await);
        handle.send_audio(speech("ignored")).unwrap();
        assert!(handle.wait_for_transcript(|t| t.len() == 2, WAIT).await);

        let received = received.lock().unwrap().clone();
        assert_eq!(received.len(), 2);
        assert!(received[1].data.iter().all(|&b| b == 0));
        assert_eq!(roles(&handle.transcript()), vec![Role::Human, Role::Agent]);

        handle.end();
        handle.join().await;
    }
}
