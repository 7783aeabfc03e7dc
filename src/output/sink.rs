use crate::audio::AudioFrame;
use crate::error::{Result, VoxlineError};
use crate::output::AudioSink;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory sink recording every written frame.
///
/// Clones share the recording, so a test keeps one clone while the device
/// owns the other.
#[derive(Debug, Clone, Default)]
pub struct CollectorSink {
    frames: Arc<Mutex<Vec<AudioFrame>>>,
    discards: Arc<AtomicUsize>,
    write_delay: Duration,
    fail_open: bool,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block each write for `delay`, like a real-time device would
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Make `open` fail
    pub fn with_open_failure(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn frames(&self) -> Vec<AudioFrame> {
        self.frames.lock().map(|f| f.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of flushes the device forwarded to this sink.
    pub fn discards(&self) -> usize {
        self.discards.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` frames were written.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until_all(|frames| frames.len() >= count, timeout).await
    }

    /// Waits until some written frame satisfies `predicate`.
    pub async fn wait_until<F>(&self, predicate: F, timeout: Duration) -> bool
    where
        F: Fn(&AudioFrame) -> bool,
    {
        self.wait_until_all(|frames| frames.iter().any(&predicate), timeout).await
    }

    async fn wait_until_all<F>(&self, check: F, timeout: Duration) -> bool
    where
        F: Fn(&[AudioFrame]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let done = self.frames.lock().map(|f| check(&f)).unwrap_or(false);
            if done {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl AudioSink for CollectorSink {
    fn write(&mut self, frame: &AudioFrame) -> Result<()> {
        if !self.write_delay.is_zero() {
            std::thread::sleep(self.write_delay);
        }
        self.frames
            .lock()
            .map_err(|_| VoxlineError::Output {
                message: "collector lock poisoned".to_string(),
            })?
            .push(frame.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "collector"
    }

    fn open(&mut self) -> Result<()> {
        if self.fail_open {
            return Err(VoxlineError::Output {
                message: "collector configured to fail".to_string(),
            });
        }
        Ok(())
    }

    fn discard_buffered(&mut self) {
        self.discards.fetch_add(1, Ordering::SeqCst);
    }
}
