//! Owned audio chunk tagged with its wire format.

use crate::audio::codec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sample encoding of an [`AudioFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// Signed 16-bit little-endian PCM.
    Linear16,
    /// G.711 mu-law, one byte per sample.
    Mulaw,
}

impl AudioEncoding {
    /// Bytes used by one mono sample.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            AudioEncoding::Linear16 => 2,
            AudioEncoding::Mulaw => 1,
        }
    }

    /// Byte value that decodes to digital silence.
    pub fn silence_byte(self) -> u8 {
        match self {
            AudioEncoding::Linear16 => 0,
            AudioEncoding::Mulaw => codec::MULAW_SILENCE,
        }
    }
}

/// A chunk of mono audio.
///
/// Frames are moved between workers; nothing holds a reference to a frame
/// after it has been enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Vec<u8>,
    pub encoding: AudioEncoding,
    pub sampling_rate: u32,
}

impl AudioFrame {
    pub fn new(data: Vec<u8>, encoding: AudioEncoding, sampling_rate: u32) -> Self {
        Self {
            data,
            encoding,
            sampling_rate,
        }
    }

    /// Silent frame of exactly `len` bytes.
    pub fn silence(len: usize, encoding: AudioEncoding, sampling_rate: u32) -> Self {
        Self::new(vec![encoding.silence_byte(); len], encoding, sampling_rate)
    }

    /// Silent frame of the same size and format as `self`.
    pub fn silenced(&self) -> Self {
        Self::silence(self.data.len(), self.encoding, self.sampling_rate)
    }

    /// Silent frame lasting `duration`.
    pub fn silence_for(duration: Duration, encoding: AudioEncoding, sampling_rate: u32) -> Self {
        let samples = (duration.as_secs_f64() * sampling_rate as f64).round() as usize;
        Self::silence(samples * encoding.bytes_per_sample(), encoding, sampling_rate)
    }

    /// Builds a frame from PCM samples in the requested encoding.
    pub fn from_samples(samples: &[i16], encoding: AudioEncoding, sampling_rate: u32) -> Self {
        let data = match encoding {
            AudioEncoding::Linear16 => samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
            AudioEncoding::Mulaw => samples.iter().map(|&s| codec::linear_to_mulaw(s)).collect(),
        };
        Self::new(data, encoding, sampling_rate)
    }

    /// Decodes the frame to PCM samples.
    pub fn to_samples(&self) -> Vec<i16> {
        match self.encoding {
            AudioEncoding::Linear16 => self
                .data
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                .collect(),
            AudioEncoding::Mulaw => self.data.iter().map(|&b| codec::mulaw_to_linear(b)).collect(),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.data.len() / self.encoding.bytes_per_sample()
    }

    /// Playback duration of the frame.
    pub fn duration(&self) -> Duration {
        if self.sampling_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.sample_count() as f64 / self.sampling_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
