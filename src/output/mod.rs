//! Outbound audio playback.
//!
//! [`OutputDevice`] hosts an [`AudioSink`] on a dedicated thread. Frames
//! are written in submission order. Frames tagged with a [`PlaybackScope`]
//! can be flushed with [`OutputSender::clear_pending`] without stopping the
//! device; untagged frames (tones injected by actions) always play.

pub mod sink;
pub mod socket;
#[cfg(feature = "cpal-audio")]
pub mod speaker;
pub mod wav;

pub use sink::CollectorSink;
pub use socket::{MediaMessage, MessageTransport, TelephonySocketSink};
#[cfg(feature = "cpal-audio")]
pub use speaker::SpeakerSink;
pub use wav::WavFileSink;

use crate::audio::AudioFrame;
use crate::error::{Result, VoxlineError};
use crate::worker::{
    QueueSender, SendError, ShutdownPolicy, ThreadWorker, Worker, WorkerError, WorkerHandle,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Blocking destination for outbound audio.
pub trait AudioSink: Send + 'static {
    /// Writes one frame, blocking until the sink accepted it.
    fn write(&mut self, frame: &AudioFrame) -> Result<()>;

    fn name(&self) -> &'static str;

    /// Runs on the playback thread before the first write.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drops audio the sink buffered but has not played yet.
    fn discard_buffered(&mut self) {}

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl AudioSink for Box<dyn AudioSink> {
    fn write(&mut self, frame: &AudioFrame) -> Result<()> {
        (**self).write(frame)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn discard_buffered(&mut self) {
        (**self).discard_buffered()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Identifies the frames belonging to one agent response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PlaybackScope(u64);

/// Item carried by the playback queue.
#[derive(Debug)]
pub enum OutputItem {
    Frame {
        frame: AudioFrame,
        scope: Option<PlaybackScope>,
    },
    /// Asks the sink to drop its own buffer.
    Flush,
}

impl OutputItem {
    fn scope(&self) -> Option<PlaybackScope> {
        match self {
            Self::Frame { scope, .. } => *scope,
            Self::Flush => None,
        }
    }
}

/// Scope counters and the submitted-but-unhandled counts shared by senders
/// and the playback thread.
#[derive(Debug, Default)]
struct Scopes {
    latest: AtomicU64,
    cutoff: AtomicU64,
    outstanding: AtomicUsize,
    /// Unhandled frames per scope. Scopes with none are absent.
    queued: Mutex<HashMap<u64, usize>>,
}

impl Scopes {
    fn is_stale(&self, scope: Option<PlaybackScope>) -> bool {
        scope.is_some_and(|PlaybackScope(id)| id <= self.cutoff.load(Ordering::Acquire))
    }

    fn submitted(&self, scope: Option<PlaybackScope>) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if let Some(PlaybackScope(id)) = scope
            && let Ok(mut queued) = self.queued.lock()
        {
            *queued.entry(id).or_default() += 1;
        }
    }

    fn handled(&self, scope: Option<PlaybackScope>) {
        if let Some(PlaybackScope(id)) = scope
            && let Ok(mut queued) = self.queued.lock()
            && let Some(count) = queued.get_mut(&id)
        {
            *count = count.saturating_sub(1);
            if *count == 0 {
                queued.remove(&id);
            }
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    fn queued_in(&self, PlaybackScope(id): PlaybackScope) -> usize {
        self.queued
            .lock()
            .map(|queued| queued.get(&id).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

/// Cloneable producer handle for an [`OutputDevice`].
#[derive(Clone)]
pub struct OutputSender {
    input: QueueSender<OutputItem>,
    scopes: Arc<Scopes>,
}

impl OutputSender {
    /// Opens a new scope; frames sent under it are dropped by the next
    /// [`clear_pending`](Self::clear_pending).
    pub fn begin_scope(&self) -> PlaybackScope {
        PlaybackScope(self.scopes.latest.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Enqueues a frame belonging to `scope`.
    pub fn send(&self, frame: AudioFrame, scope: PlaybackScope) -> Result<()> {
        if self.scopes.is_stale(Some(scope)) {
            return Ok(());
        }
        self.push(OutputItem::Frame {
            frame,
            scope: Some(scope),
        })
    }

    /// Enqueues a frame that is never flushed.
    pub fn send_unscoped(&self, frame: AudioFrame) -> Result<()> {
        self.push(OutputItem::Frame { frame, scope: None })
    }

    /// Drops every queued-but-unplayed frame of the scopes opened so far.
    /// The device keeps running.
    pub fn clear_pending(&self) {
        let latest = self.scopes.latest.load(Ordering::Acquire);
        self.scopes.cutoff.fetch_max(latest, Ordering::AcqRel);
        if let Err(e) = self.push(OutputItem::Flush) {
            tracing::debug!(error = %e, "flush not delivered");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.input.is_closed()
    }

    /// Items queued but not yet taken by the playback thread.
    pub fn pending(&self) -> usize {
        self.input.len()
    }

    /// True when every submitted item has been handled by the sink.
    pub fn is_idle(&self) -> bool {
        self.scopes.outstanding.load(Ordering::Acquire) == 0
    }

    /// Resolves once every frame sent under `scope` was written or skipped,
    /// or the device stopped accepting frames.
    pub async fn wait_scope_idle(&self, scope: PlaybackScope) {
        while self.scopes.queued_in(scope) > 0 && !self.input.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn push(&self, item: OutputItem) -> Result<()> {
        let scope = item.scope();
        self.scopes.submitted(scope);
        self.input.try_send(item).map_err(|e| {
            self.scopes.handled(scope);
            match e {
                SendError::Closed(_) => VoxlineError::WorkerNotRunning {
                    worker: "output".to_string(),
                },
                SendError::Full(_) => VoxlineError::QueueFull {
                    queue: "output".to_string(),
                },
            }
        })
    }
}

/// Worker writing queued frames to the sink.
struct PlaybackWorker {
    sink: Box<dyn AudioSink>,
    scopes: Arc<Scopes>,
    skipped: u64,
}

impl Worker for PlaybackWorker {
    type Input = OutputItem;
    type Output = ();

    fn process(&mut self, item: OutputItem) -> std::result::Result<Option<()>, WorkerError> {
        let scope = item.scope();
        let handled = self.handle(item);
        self.scopes.handled(scope);
        handled.map(|()| None)
    }

    fn name(&self) -> &'static str {
        "output"
    }

    fn start(&mut self) -> std::result::Result<(), WorkerError> {
        tracing::debug!(sink = self.sink.name(), "opening output sink");
        self.sink.open().map_err(WorkerError::fatal)
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.sink.close() {
            tracing::warn!(sink = self.sink.name(), error = %e, "failed to close output sink");
        }
    }
}

impl PlaybackWorker {
    fn handle(&mut self, item: OutputItem) -> std::result::Result<(), WorkerError> {
        match item {
            OutputItem::Frame { frame, scope } => {
                if self.scopes.is_stale(scope) {
                    self.skipped += 1;
                    return Ok(());
                }
                self.sink.write(&frame)?;
            }
            OutputItem::Flush => {
                if self.skipped > 0 {
                    tracing::debug!(frames = self.skipped, "skipped flushed frames");
                    self.skipped = 0;
                }
                self.sink.discard_buffered();
            }
        }
        Ok(())
    }
}

/// Thread-backed playback device.
pub struct OutputDevice {
    worker: ThreadWorker<PlaybackWorker>,
    sender: OutputSender,
}

impl OutputDevice {
    pub fn new<S: AudioSink>(sink: S) -> Self {
        let scopes = Arc::new(Scopes::default());
        let worker = ThreadWorker::new(PlaybackWorker {
            sink: Box::new(sink),
            scopes: Arc::clone(&scopes),
            skipped: 0,
        });
        let sender = OutputSender {
            input: worker.input().clone(),
            scopes,
        };
        Self { worker, sender }
    }

    /// Drain plays queued frames before stopping; Discard drops them.
    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.worker = self.worker.with_shutdown_policy(policy);
        self
    }

    pub fn start(&self) -> Result<()> {
        self.worker.start()
    }

    /// Resolves once the sink opened.
    pub async fn ready(&self) -> Result<()> {
        self.worker.ready().await
    }

    pub fn sender(&self) -> OutputSender {
        self.sender.clone()
    }

    /// Enqueues an unscoped frame.
    pub fn consume_nonblocking(&self, frame: AudioFrame) -> Result<()> {
        self.sender.send_unscoped(frame)
    }

    pub fn clear_pending(&self) {
        self.sender.clear_pending();
    }

    /// Waits up to `timeout` for queued frames to play out. Returns true if
    /// the device went idle.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.sender.is_idle() {
            if self.worker.is_finished() {
                return false;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::debug!(pending = self.sender.pending(), "output did not drain in time");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    /// Stops the playback loop. Safe to call from async code and repeatedly.
    pub fn terminate(&self) {
        self.worker.terminate();
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        self.worker.wait_finished(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioEncoding;

    fn frame(tag: u8) -> AudioFrame {
        AudioFrame::new(vec![tag; 4], AudioEncoding::Mulaw, 8000)
    }

    fn tags(sink: &CollectorSink) -> Vec<u8> {
        sink.frames().iter().map(|f| f.data[0]).collect()
    }

    #[tokio::test]
    async fn test_frames_play_in_submission_order() {
        let sink = CollectorSink::new();
        let device = OutputDevice::new(sink.clone());
        device.start().unwrap();
        device.ready().await.unwrap();

        let sender = device.sender();
        let scope = sender.begin_scope();
        for tag in 1..=5 {
            sender.send(frame(tag), scope).unwrap();
        }

        assert!(sink.wait_for(5, Duration::from_secs(2)).await);
        assert_eq!(tags(&sink), vec![1, 2, 3, 4, 5]);
        device.terminate();
        assert!(device.wait_finished(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_clear_pending_drops_scoped_but_keeps_unscoped() {
        let sink = CollectorSink::new().with_write_delay(Duration::from_millis(30));
        let device = OutputDevice::new(sink.clone());
        device.start().unwrap();

        let sender = device.sender();
        let scope = sender.begin_scope();
        for tag in 1..=10 {
            sender.send(frame(tag), scope).unwrap();
        }
        sender.send_unscoped(frame(99)).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        device.clear_pending();

        // Frames sent to a cleared scope are ignored.
        sender.send(frame(50), scope).unwrap();
        let next = sender.begin_scope();
        sender.send(frame(60), next).unwrap();

        assert!(sink.wait_until(|f| f.data[0] == 60, Duration::from_secs(2)).await);
        let played = tags(&sink);
        assert!(played.len() < 10, "played {:?}", played);
        assert!(played.contains(&99));
        assert!(!played.contains(&50));
        assert!(!played.contains(&10));
        assert_eq!(played.last(), Some(&60));
        assert!(sink.discards() >= 1);

        device.terminate();
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_rejects_frames() {
        let device = OutputDevice::new(CollectorSink::new());
        device.start().unwrap();
        device.terminate();
        device.terminate();
        assert!(device.wait_finished(Duration::from_secs(2)).await);
        assert!(matches!(
            device.consume_nonblocking(frame(1)),
            Err(VoxlineError::WorkerNotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_sink_open_failure_fails_readiness() {
        let device = OutputDevice::new(CollectorSink::new().with_open_failure());
        device.start().unwrap();
        assert!(device.ready().await.is_err());
        device.terminate();
    }

    #[tokio::test]
    async fn test_wait_idle_returns_after_queue_plays_out() {
        let sink = CollectorSink::new().with_write_delay(Duration::from_millis(10));
        let device = OutputDevice::new(sink.clone());
        device.start().unwrap();
        device.ready().await.unwrap();
        for tag in 1..=4 {
            device.consume_nonblocking(frame(tag)).unwrap();
        }
        assert!(device.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(sink.len(), 4);
        assert_eq!(device.sender().pending(), 0);
        device.terminate();
    }

    #[tokio::test]
    async fn test_wait_scope_idle_tracks_only_its_scope() {
        let sink = CollectorSink::new().with_write_delay(Duration::from_millis(30));
        let device = OutputDevice::new(sink.clone());
        device.start().unwrap();
        device.ready().await.unwrap();

        let sender = device.sender();
        let first = sender.begin_scope();
        let second = sender.begin_scope();
        for tag in 1..=3 {
            sender.send(frame(tag), first).unwrap();
        }
        sender.send(frame(4), second).unwrap();

        tokio::time::timeout(Duration::from_secs(2), sender.wait_scope_idle(first))
            .await
            .unwrap();
        assert!(sink.len() >= 3);
        assert_eq!(tags(&sink)[..3], [1, 2, 3]);

        // A scope that never received frames is idle right away.
        let empty = sender.begin_scope();
        tokio::time::timeout(Duration::from_millis(50), sender.wait_scope_idle(empty))
            .await
            .unwrap();
        device.terminate();
    }

    #[tokio::test]
    async fn test_drain_policy_plays_queued_frames() {
        let sink = CollectorSink::new().with_write_delay(Duration::from_millis(5));
        let device = OutputDevice::new(sink.clone()).with_shutdown_policy(ShutdownPolicy::Drain);
        device.start().unwrap();
        for tag in 1..=6 {
            device.consume_nonblocking(frame(tag)).unwrap();
        }
        device.terminate();
        assert!(device.wait_finished(Duration::from_secs(2)).await);
        assert_eq!(tags(&sink), vec![1, 2, 3, 4, 5, 6]);
    }
}
