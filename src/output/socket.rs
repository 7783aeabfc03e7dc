//! Socket-delivered audio for a live call leg.
//!
//! Every frame becomes one JSON media message carrying the stream id and a
//! base64 payload, sent in submission order.

use crate::audio::AudioFrame;
use crate::error::{Result, VoxlineError};
use crate::output::AudioSink;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
}

/// Outbound media message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMessage {
    pub event: String,
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
    pub media: MediaPayload,
}

impl MediaMessage {
    pub fn new(stream_sid: &str, audio: &[u8]) -> Self {
        Self {
            event: "media".to_string(),
            stream_sid: stream_sid.to_string(),
            media: MediaPayload {
                payload: BASE64.encode(audio),
            },
        }
    }

    /// Decoded audio bytes.
    pub fn audio(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.media.payload)
            .map_err(|e| VoxlineError::Transport {
                message: format!("invalid media payload: {}", e),
            })
    }
}

/// Carries serialized messages to the remote end.
pub trait MessageTransport: Send + 'static {
    fn send_message(&mut self, message: String) -> Result<()>;
}

impl MessageTransport for mpsc::UnboundedSender<String> {
    fn send_message(&mut self, message: String) -> Result<()> {
        self.send(message).map_err(|_| VoxlineError::Transport {
            message: "socket closed".to_string(),
        })
    }
}

pub struct TelephonySocketSink<T: MessageTransport> {
    transport: T,
    stream_sid: String,
}

impl<T: MessageTransport> TelephonySocketSink<T> {
    pub fn new(transport: T, stream_sid: &str) -> Self {
        Self {
            transport,
            stream_sid: stream_sid.to_string(),
        }
    }
}

impl<T: MessageTransport> AudioSink for TelephonySocketSink<T> {
    fn write(&mut self, frame: &AudioFrame) -> Result<()> {
        let message = serde_json::to_string(&MediaMessage::new(&self.stream_sid, &frame.data))?;
        self.transport.send_message(message)
    }

    fn name(&self) -> &'static str {
        "telephony-socket"
    }
}
