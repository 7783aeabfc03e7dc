//! Audio in, transcriptions out.
//!
//! [`Transcriber`] hosts a speech recognizer on either worker flavor and
//! applies muting before frames reach it.

pub mod recognizer;

pub use recognizer::{AsyncSpeechRecognizer, MockRecognizer, SpeechRecognizer, Transcription};

use crate::audio::AudioFrame;
use crate::error::{Result, VoxlineError};
use crate::worker::{
    AsyncWorker, QueueReceiver, QueueSender, SendError, TaskWorker, ThreadWorker, Worker,
    WorkerError, WorkerHandle,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

type TranscriptionWorker = dyn WorkerHandle<Input = AudioFrame, Output = Transcription>;

/// Adapts a blocking recognizer to the thread worker loop.
struct BlockingRecognition<R: SpeechRecognizer> {
    recognizer: R,
}

impl<R: SpeechRecognizer> Worker for BlockingRecognition<R> {
    type Input = AudioFrame;
    type Output = Transcription;

    fn process(&mut self, frame: AudioFrame) -> std::result::Result<Option<Transcription>, WorkerError> {
        Ok(self.recognizer.recognize(&frame)?)
    }

    fn name(&self) -> &'static str {
        self.recognizer.name()
    }

    fn start(&mut self) -> std::result::Result<(), WorkerError> {
        self.recognizer.connect().map_err(WorkerError::fatal)
    }

    fn shutdown(&mut self) {
        self.recognizer.disconnect();
    }
}

/// Adapts an async recognizer to the task worker loop.
struct CooperativeRecognition<R: AsyncSpeechRecognizer> {
    recognizer: R,
}

#[async_trait]
impl<R: AsyncSpeechRecognizer> AsyncWorker for CooperativeRecognition<R> {
    type Input = AudioFrame;
    type Output = Transcription;

    async fn process(
        &mut self,
        frame: AudioFrame,
    ) -> std::result::Result<Option<Transcription>, WorkerError> {
        Ok(self.recognizer.recognize(frame).await?)
    }

    fn name(&self) -> &'static str {
        self.recognizer.name()
    }

    async fn start(&mut self) -> std::result::Result<(), WorkerError> {
        self.recognizer.connect().await.map_err(WorkerError::fatal)
    }

    async fn shutdown(&mut self) {
        self.recognizer.disconnect().await;
    }
}

/// Cloneable handle for pushing caller audio into a [`Transcriber`].
#[derive(Clone)]
pub struct AudioInput {
    input: QueueSender<AudioFrame>,
    muted: Arc<AtomicBool>,
}

impl AudioInput {
    /// Enqueues a frame. While muted, an equally sized silent frame takes
    /// its place so downstream timing is unchanged.
    pub fn send_audio(&self, frame: AudioFrame) -> Result<()> {
        let frame = if self.muted.load(Ordering::Acquire) {
            frame.silenced()
        } else {
            frame
        };
        self.input.try_send(frame).map_err(|e| match e {
            SendError::Closed(_) => VoxlineError::WorkerNotRunning {
                worker: "transcriber".to_string(),
            },
            SendError::Full(_) => VoxlineError::QueueFull {
                queue: "transcriber".to_string(),
            },
        })
    }
}

/// Speech recognition worker with mute control.
pub struct Transcriber {
    worker: Box<TranscriptionWorker>,
    muted: Arc<AtomicBool>,
}

impl Transcriber {
    /// Hosts a blocking recognizer on its own thread.
    pub fn blocking<R: SpeechRecognizer>(recognizer: R) -> Self {
        Self::from_worker(Box::new(ThreadWorker::new(BlockingRecognition { recognizer })))
    }

    /// Hosts an async recognizer as a tokio task.
    pub fn cooperative<R: AsyncSpeechRecognizer>(recognizer: R) -> Self {
        Self::from_worker(Box::new(TaskWorker::new(CooperativeRecognition {
            recognizer,
        })))
    }

    fn from_worker(worker: Box<TranscriptionWorker>) -> Self {
        Self {
            worker,
            muted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(&self) -> Result<()> {
        self.worker.start()
    }

    /// Resolves once the recognition session is established.
    pub async fn ready(&self) -> Result<()> {
        self.worker.ready().await
    }

    pub fn send_audio(&self, frame: AudioFrame) -> Result<()> {
        self.audio_input().send_audio(frame)
    }

    pub fn audio_input(&self) -> AudioInput {
        AudioInput {
            input: self.worker.input().clone(),
            muted: Arc::clone(&self.muted),
        }
    }

    pub fn mute(&self) {
        if !self.muted.swap(true, Ordering::AcqRel) {
            tracing::debug!("transcriber muted");
        }
    }

    pub fn unmute(&self) {
        if self.muted.swap(false, Ordering::AcqRel) {
            tracing::debug!("transcriber unmuted");
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Transcription events in recognition order.
    pub fn output(&self) -> &QueueReceiver<Transcription> {
        self.worker.output()
    }

    pub fn terminate(&self) {
        self.worker.terminate();
    }

    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        self.worker.wait_finished(timeout).await
    }
}
