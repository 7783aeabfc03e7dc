use crate::audio::AudioFrame;
use crate::error::{Result, VoxlineError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// One recognition result.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub message: String,
    /// Recognizer confidence in `[0, 1]`.
    pub confidence: f32,
    /// A final result closes the caller's turn.
    pub is_final: bool,
    /// Set by the pipeline when the event arrived during an agent response.
    pub is_interrupt: bool,
}

impl Transcription {
    pub fn final_result(message: impl Into<String>, confidence: f32) -> Self {
        Self {
            message: message.into(),
            confidence: confidence.clamp(0.0, 1.0),
            is_final: true,
            is_interrupt: false,
        }
    }

    pub fn partial(message: impl Into<String>, confidence: f32) -> Self {
        Self {
            is_final: false,
            ..Self::final_result(message, confidence)
        }
    }

    pub fn as_interrupt(mut self) -> Self {
        self.is_interrupt = true;
        self
    }
}

/// Speech-to-text provider with blocking calls.
///
/// Hosted on a dedicated thread by [`Transcriber::blocking`](super::Transcriber::blocking).
pub trait SpeechRecognizer: Send + 'static {
    /// Establishes the recognition session. Failure is fatal to the transcriber.
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Feeds one frame; returns a result when the provider has one.
    fn recognize(&mut self, frame: &AudioFrame) -> Result<Option<Transcription>>;

    fn name(&self) -> &'static str {
        "recognizer"
    }

    fn disconnect(&mut self) {}
}

/// Speech-to-text provider driven from the tokio scheduler.
#[async_trait]
pub trait AsyncSpeechRecognizer: Send + 'static {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn recognize(&mut self, frame: AudioFrame) -> Result<Option<Transcription>>;

    fn name(&self) -> &'static str {
        "recognizer"
    }

    async fn disconnect(&mut self) {}
}

/// Recognizer for tests that reads frame payloads as text.
///
/// A frame whose bytes are UTF-8 text yields a final transcription of that
/// text; a `partial:` prefix yields a partial one. Silent or non-text frames
/// yield nothing. Every received frame is recorded.
#[derive(Debug, Clone, Default)]
pub struct MockRecognizer {
    confidence: Option<f32>,
    connect_error: Option<String>,
    fail_on: Option<String>,
    received: Arc<Mutex<Vec<AudioFrame>>>,
}

impl MockRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the confidence attached to every result
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Configure the session handshake to fail
    pub fn with_connect_failure(mut self, message: &str) -> Self {
        self.connect_error = Some(message.to_string());
        self
    }

    /// Configure recognition to fail for frames carrying `text`
    pub fn with_failure_on(mut self, text: &str) -> Self {
        self.fail_on = Some(text.to_string());
        self
    }

    /// Shared log of every frame seen, in arrival order.
    pub fn received(&self) -> Arc<Mutex<Vec<AudioFrame>>> {
        Arc::clone(&self.received)
    }

    /// Frame whose payload the mock recognizes as `text`.
    pub fn speech_frame(text: &str) -> AudioFrame {
        AudioFrame::new(
            text.as_bytes().to_vec(),
            crate::audio::AudioEncoding::Linear16,
            crate::defaults::SAMPLING_RATE,
        )
    }

    fn decode(&self, frame: &AudioFrame) -> Result<Option<Transcription>> {
        let silence = frame.encoding.silence_byte();
        if frame.is_empty() || frame.data.iter().all(|&b| b == silence) {
            return Ok(None);
        }
        let Ok(text) = std::str::from_utf8(&frame.data) else {
            return Ok(None);
        };
        if self.fail_on.as_deref() == Some(text) {
            return Err(VoxlineError::Transcription {
                message: format!("mock recognition failure on '{}'", text),
            });
        }
        let confidence = self.confidence.unwrap_or(1.0);
        Ok(Some(match text.strip_prefix("partial:") {
            Some(partial) => Transcription::partial(partial, confidence),
            None => Transcription::final_result(text, confidence),
        }))
    }

    fn record(&self, frame: &AudioFrame) {
        if let Ok(mut received) = self.received.lock() {
            received.push(frame.clone());
        }
    }

    fn handshake(&self) -> Result<()> {
        match &self.connect_error {
            Some(message) => Err(VoxlineError::Session {
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl SpeechRecognizer for MockRecognizer {
    fn connect(&mut self) -> Result<()> {
        self.handshake()
    }

    fn recognize(&mut self, frame: &AudioFrame) -> Result<Option<Transcription>> {
        self.record(frame);
        self.decode(frame)
    }

    fn name(&self) -> &'static str {
        "mock-recognizer"
    }
}

#[async_trait]
impl AsyncSpeechRecognizer for MockRecognizer {
    async fn connect(&mut self) -> Result<()> {
        self.handshake()
    }

    async fn recognize(&mut self, frame: AudioFrame) -> Result<Option<Transcription>> {
        self.record(&frame);
        self.decode(&frame)
    }

    fn name(&self) -> &'static str {
        "mock-recognizer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioEncoding;

    #[test]
    fn test_mock_recognizes_text_frames() {
        let mut recognizer = MockRecognizer::new();
        let result = SpeechRecognizer::recognize(
            &mut recognizer,
            &MockRecognizer::speech_frame("book a flight"),
        )
        .unwrap()
        .unwrap();

        assert_eq!(result.message, "book a flight");
        assert!(result.is_final);
        assert!(!result.is_interrupt);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_mock_partial_prefix() {
        let mut recognizer = MockRecognizer::new().with_confidence(0.4);
        let result = SpeechRecognizer::recognize(
            &mut recognizer,
            &MockRecognizer::speech_frame("partial:book a"),
        )
        .unwrap()
        .unwrap();

        assert_eq!(result.message, "book a");
        assert!(!result.is_final);
        assert_eq!(result.confidence, 0.4);
    }

    #[test]
    fn test_mock_ignores_silence() {
        let mut recognizer = MockRecognizer::new();
        let silent = AudioFrame::silence(160, AudioEncoding::Mulaw, 8000);
        assert!(
            SpeechRecognizer::recognize(&mut recognizer, &silent)
                .unwrap()
                .is_none()
        );
        assert_eq!(recognizer.received().lock().unwrap().len(), 1);
    }

    #[test]
    fn test_mock_connect_failure() {
        let mut recognizer = MockRecognizer::new().with_connect_failure("bad key");
        let err = SpeechRecognizer::connect(&mut recognizer).unwrap_err();
        assert!(matches!(err, VoxlineError::Session { .. }));
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(Transcription::final_result("x", 1.7).confidence, 1.0);
        assert_eq!(Transcription::partial("x", -0.2).confidence, 0.0);
    }

    #[test]
    fn test_as_interrupt_marks_event() {
        let event = Transcription::final_result("wait", 0.9).as_interrupt();
        assert!(event.is_interrupt);
        assert!(event.is_final);
    }
}
