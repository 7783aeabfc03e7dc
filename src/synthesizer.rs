//! Text to outbound audio.

use crate::audio::{AudioEncoding, AudioFrame};
use crate::error::{Result, VoxlineError};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Speech synthesis provider interface.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Renders `text` as frames in playback order.
    async fn synthesize(&self, text: &str) -> Result<Vec<AudioFrame>>;

    fn name(&self) -> &'static str;
}

#[async_trait]
impl<T: Synthesizer + ?Sized> Synthesizer for Arc<T> {
    async fn synthesize(&self, text: &str) -> Result<Vec<AudioFrame>> {
        (**self).synthesize(text).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Test synthesizer whose audio is the UTF-8 text itself.
///
/// Each call yields a single frame, so tests can read back what was spoken
/// with [`MockSynthesizer::text_of`].
#[derive(Debug, Clone)]
pub struct MockSynthesizer {
    encoding: AudioEncoding,
    sampling_rate: u32,
    delay: Duration,
    fail_on: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl Default for MockSynthesizer {
    fn default() -> Self {
        Self {
            encoding: AudioEncoding::Linear16,
            sampling_rate: crate::defaults::SAMPLING_RATE,
            delay: Duration::ZERO,
            fail_on: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated synthesis latency per call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail whenever the text contains `text`
    pub fn with_failure_on(mut self, text: &str) -> Self {
        self.fail_on = Some(text.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Text carried by a frame this synthesizer produced.
    pub fn text_of(frame: &AudioFrame) -> Option<String> {
        String::from_utf8(frame.data.clone()).ok()
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<AudioFrame>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(needle) = &self.fail_on
            && text.contains(needle.as_str())
        {
            return Err(VoxlineError::Synthesis {
                message: format!("mock failure on '{}'", text),
            });
        }
        Ok(vec![AudioFrame::new(
            text.as_bytes().to_vec(),
            self.encoding,
            self.sampling_rate,
        )])
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_round_trips_text() {
        let synthesizer = MockSynthesizer::new();
        let frames = synthesizer.synthesize("Sure,").await.unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(MockSynthesizer::text_of(&frames[0]).as_deref(), Some("Sure,"));
        assert_eq!(synthesizer.calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_failure() {
        let synthesizer = MockSynthesizer::new().with_failure_on("boom");
        assert!(matches!(
            synthesizer.synthesize("boom now").await,
            Err(VoxlineError::Synthesis { .. })
        ));
        assert!(synthesizer.synthesize("fine").await.is_ok());
    }
}
