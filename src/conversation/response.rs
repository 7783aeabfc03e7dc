//! One agent response in flight.

use crate::actions::ActionRequest;
use crate::agent::{GoodbyeDetector, Generation, ResponseFragment};
use crate::output::{OutputSender, PlaybackScope};
use crate::synthesizer::Synthesizer;
use crate::worker::QueueSender;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Progress reported back to the pipeline, tagged with the response id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ResponseEvent {
    /// A fragment matched the goodbye detector.
    Goodbye { id: u64 },
    /// The generation ran to completion and its audio played out. `spoken`
    /// holds the text that reached the output device.
    Finished {
        id: u64,
        spoken: String,
        goodbye: bool,
    },
}

/// Everything a response task needs.
pub(crate) struct ResponseJob {
    pub id: u64,
    pub generation: Generation,
    pub cancel: CancellationToken,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub output: OutputSender,
    pub scope: PlaybackScope,
    pub goodbye: Option<Arc<dyn GoodbyeDetector>>,
    pub actions: Option<QueueSender<ActionRequest>>,
    pub conversation_id: String,
    pub events: mpsc::UnboundedSender<ResponseEvent>,
}

/// Pipeline-side handle of a running response.
pub(crate) struct ResponseTask {
    id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ResponseTask {
    pub fn spawn(job: ResponseJob) -> Self {
        let id = job.id;
        let cancel = job.cancel.clone();
        let task = tokio::spawn(job.run());
        Self { id, cancel, task }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the task to exit, aborting it after `timeout`.
    pub async fn join(self, timeout: Duration) {
        let abort = self.task.abort_handle();
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(response = self.id, error = %e, "response task failed"),
            Err(_) => {
                tracing::warn!(response = self.id, "response task did not stop, aborting");
                abort.abort();
            }
        }
    }
}

impl ResponseJob {
    async fn run(mut self) {
        let mut spoken: Vec<String> = Vec::new();
        let mut checks: Vec<JoinHandle<bool>> = Vec::new();
        let mut goodbye = false;

        loop {
            let fragment = match self.generation.next().await {
                Ok(Some(fragment)) => fragment,
                Ok(None) => break,
                Err(e) if e.is_cancelled() => return self.abandon(checks),
                Err(e) => {
                    tracing::warn!(response = self.id, error = %e, "response generation failed");
                    break;
                }
            };

            match fragment {
                ResponseFragment::Text(text) => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    if let Some(detector) = &self.goodbye {
                        checks.push(self.check_goodbye(Arc::clone(detector), text.clone()));
                    }
                    match self.speak(&text).await {
                        Some(true) => spoken.push(text),
                        Some(false) => {}
                        None => return self.abandon(checks),
                    }
                }
                ResponseFragment::ActionCall(call) => {
                    if self.cancel.is_cancelled() {
                        return self.abandon(checks);
                    }
                    self.dispatch(ActionRequest {
                        call,
                        conversation_id: self.conversation_id.clone(),
                    });
                }
                ResponseFragment::End => {
                    tracing::info!(response = self.id, "agent ended the conversation");
                    goodbye = true;
                    if self.events.send(ResponseEvent::Goodbye { id: self.id }).is_err() {
                        tracing::debug!(response = self.id, "end requested after pipeline stopped");
                    }
                    break;
                }
            }
        }

        for check in checks {
            goodbye |= check.await.unwrap_or(false);
        }
        // Still responding until the caller has heard the last frame.
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                tracing::debug!(response = self.id, "response cancelled during playback");
                return;
            }
            () = self.output.wait_scope_idle(self.scope) => {}
        }
        let finished = ResponseEvent::Finished {
            id: self.id,
            spoken: spoken.join(" "),
            goodbye,
        };
        if self.events.send(finished).is_err() {
            tracing::debug!(response = self.id, "pipeline gone before response finished");
        }
    }

    /// Synthesizes and enqueues one text fragment.
    ///
    /// `None` means the response was cancelled; `Some(false)` that the
    /// fragment could not be played.
    async fn speak(&self, text: &str) -> Option<bool> {
        let frames = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return None,
            frames = self.synthesizer.synthesize(text) => frames,
        };
        let frames = match frames {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!(
                    synthesizer = self.synthesizer.name(),
                    error = %e,
                    "synthesis failed, skipping fragment"
                );
                return Some(false);
            }
        };
        for frame in frames {
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Err(e) = self.output.send(frame, self.scope) {
                tracing::warn!(error = %e, "output rejected response audio");
                return Some(false);
            }
        }
        Some(true)
    }

    fn dispatch(&self, request: ActionRequest) {
        let name = request.call.name.clone();
        match &self.actions {
            Some(actions) => {
                if actions.try_send(request).is_err() {
                    tracing::warn!(action = %name, "actions worker not accepting requests");
                }
            }
            None => tracing::warn!(action = %name, "action requested but no actions attached"),
        }
    }

    fn check_goodbye(&self, detector: Arc<dyn GoodbyeDetector>, text: String) -> JoinHandle<bool> {
        let id = self.id;
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let goodbye = tokio::select! {
                biased;
                () = cancel.cancelled() => false,
                goodbye = detector.is_goodbye(&text) => goodbye,
            };
            if goodbye && events.send(ResponseEvent::Goodbye { id }).is_err() {
                tracing::debug!(response = id, "goodbye detected after pipeline stopped");
            }
            goodbye
        })
    }

    fn abandon(self, checks: Vec<JoinHandle<bool>>) {
        for check in checks {
            check.abort();
        }
        tracing::debug!(response = self.id, "response cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ActionCall, PhraseGoodbyeDetector};
    use crate::output::{CollectorSink, OutputDevice};
    use crate::synthesizer::MockSynthesizer;
    use crate::worker::{QueuePolicy, dual_queue};

    struct Fixture {
        device: OutputDevice,
        sink: CollectorSink,
        events: mpsc::UnboundedReceiver<ResponseEvent>,
    }

    fn response_job(generation: Generation, synthesizer: MockSynthesizer) -> (ResponseJob, Fixture) {
        playing_into(CollectorSink::new(), generation, synthesizer)
    }

    fn playing_into(
        sink: CollectorSink,
        generation: Generation,
        synthesizer: MockSynthesizer,
    ) -> (ResponseJob, Fixture) {
        let device = OutputDevice::new(sink.clone());
        device.start().unwrap();
        let output = device.sender();
        let (events_tx, events) = mpsc::unbounded_channel();
        let job = ResponseJob {
            id: 7,
            generation,
            cancel: CancellationToken::new(),
            synthesizer: Arc::new(synthesizer),
            scope: output.begin_scope(),
            output,
            goodbye: Some(Arc::new(PhraseGoodbyeDetector::new("STOP CALL"))),
            actions: None,
            conversation_id: "conv".to_string(),
            events: events_tx,
        };
        (
            job,
            Fixture {
                device,
                sink,
                events,
            },
        )
    }

    fn spoken(sink: &CollectorSink) -> Vec<String> {
        sink.frames()
            .iter()
            .filter_map(MockSynthesizer::text_of)
            .collect()
    }

    #[tokio::test]
    async fn test_fragments_play_in_order_then_finish() {
        let generation = Generation::from_fragments(vec![
            ResponseFragment::text("Sure,"),
            ResponseFragment::text("let me help."),
        ]);
        let (job, mut fixture) = response_job(generation, MockSynthesizer::new());
        ResponseTask::spawn(job).join(Duration::from_secs(2)).await;

        assert_eq!(
            fixture.events.recv().await,
            Some(ResponseEvent::Finished {
                id: 7,
                spoken: "Sure, let me help.".to_string(),
                goodbye: false,
            })
        );
        assert!(fixture.sink.wait_for(2, Duration::from_secs(2)).await);
        assert_eq!(spoken(&fixture.sink), vec!["Sure,", "let me help."]);
        fixture.device.terminate();
    }

    #[tokio::test]
    async fn test_goodbye_is_reported_early_and_on_finish() {
        let generation = Generation::from_fragments(vec![ResponseFragment::text(
            "Thanks for calling. STOP CALL",
        )]);
        let (job, mut fixture) = response_job(generation, MockSynthesizer::new());
        ResponseTask::spawn(job).join(Duration::from_secs(2)).await;

        let mut events = Vec::new();
        while let Ok(event) = fixture.events.try_recv() {
            events.push(event);
        }
        assert!(events.contains(&ResponseEvent::Goodbye { id: 7 }));
        assert!(matches!(
            events.last(),
            Some(ResponseEvent::Finished { goodbye: true, .. })
        ));
        fixture.device.terminate();
    }

    #[tokio::test]
    async fn test_cancelled_response_reports_nothing() {
        let generation = Generation::from_fragments(vec![
            ResponseFragment::text("one"),
            ResponseFragment::text("two"),
            ResponseFragment::text("three"),
        ]);
        let synthesizer = MockSynthesizer::new().with_delay(Duration::from_millis(50));
        let (job, mut fixture) = response_job(generation, synthesizer);
        let task = ResponseTask::spawn(job);
        tokio::time::sleep(Duration::from_millis(70)).await;
        task.cancel();
        task.join(Duration::from_secs(2)).await;

        assert!(fixture.events.try_recv().is_err());
        assert!(fixture.sink.len() <= 1);
        fixture.device.terminate();
    }

    #[tokio::test]
    async fn test_finish_waits_for_playback() {
        let generation = Generation::from_fragments(vec![
            ResponseFragment::text("One."),
            ResponseFragment::text("Two."),
            ResponseFragment::text("Three."),
        ]);
        let sink = CollectorSink::new().with_write_delay(Duration::from_millis(60));
        let (job, mut fixture) = playing_into(sink, generation, MockSynthesizer::new());

        ResponseTask::spawn(job).join(Duration::from_secs(2)).await;
        assert!(matches!(
            fixture.events.try_recv(),
            Ok(ResponseEvent::Finished { .. })
        ));
        assert_eq!(spoken(&fixture.sink), vec!["One.", "Two.", "Three."]);
        fixture.device.terminate();
    }

    #[tokio::test]
    async fn test_cancel_during_playback_reports_nothing() {
        let generation = Generation::from_fragments(vec![
            ResponseFragment::text("One."),
            ResponseFragment::text("Two."),
        ]);
        let sink = CollectorSink::new().with_write_delay(Duration::from_millis(200));
        let (job, mut fixture) = playing_into(sink, generation, MockSynthesizer::new());

        let task = ResponseTask::spawn(job);
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.cancel();
        task.join(Duration::from_secs(2)).await;

        assert!(fixture.events.try_recv().is_err());
        assert!(fixture.sink.len() < 2);
        fixture.device.terminate();
    }

    #[tokio::test]
    async fn test_end_fragment_reports_goodbye_and_stops_reading() {
        let generation = Generation::from_fragments(vec![
            ResponseFragment::text("Bye."),
            ResponseFragment::End,
            ResponseFragment::text("never spoken"),
        ]);
        let (job, mut fixture) = response_job(generation, MockSynthesizer::new());
        ResponseTask::spawn(job).join(Duration::from_secs(2)).await;

        assert_eq!(
            fixture.events.recv().await,
            Some(ResponseEvent::Goodbye { id: 7 })
        );
        assert_eq!(
            fixture.events.recv().await,
            Some(ResponseEvent::Finished {
                id: 7,
                spoken: "Bye.".to_string(),
                goodbye: true,
            })
        );
        assert_eq!(spoken(&fixture.sink), vec!["Bye."]);
        fixture.device.terminate();
    }

    #[tokio::test]
    async fn test_action_calls_are_routed_to_actions_queue() {
        let call = ActionCall {
            name: "send_dtmf".to_string(),
            params: serde_json::json!({"buttons": "1234"}),
        };
        let generation = Generation::from_fragments(vec![
            ResponseFragment::text("Pressing now."),
            ResponseFragment::ActionCall(call.clone()),
        ]);
        let (mut job, mut fixture) = response_job(generation, MockSynthesizer::new());
        let (actions_tx, actions_rx) = dual_queue(QueuePolicy::Unbounded);
        job.actions = Some(actions_tx);
        ResponseTask::spawn(job).join(Duration::from_secs(2)).await;

        let request = actions_rx.try_recv().unwrap();
        assert_eq!(request.call, call);
        assert_eq!(request.conversation_id, "conv");
        assert!(matches!(
            fixture.events.recv().await,
            Some(ResponseEvent::Finished { .. })
        ));
        fixture.device.terminate();
    }

    #[tokio::test]
    async fn test_synthesis_failure_skips_fragment() {
        let generation = Generation::from_fragments(vec![
            ResponseFragment::text("boom"),
            ResponseFragment::text("fine."),
        ]);
        let (job, mut fixture) = response_job(generation, MockSynthesizer::new().with_failure_on("boom"));
        ResponseTask::spawn(job).join(Duration::from_secs(2)).await;

        assert_eq!(
            fixture.events.recv().await,
            Some(ResponseEvent::Finished {
                id: 7,
                spoken: "fine.".to_string(),
                goodbye: false,
            })
        );
        fixture.device.terminate();
    }
}
