//! Records outbound audio to a WAV file.

use crate::audio::AudioFrame;
use crate::error::{Result, VoxlineError};
use crate::output::AudioSink;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Writes 16-bit mono PCM. Mu-law frames are decoded first.
pub struct WavFileSink {
    path: PathBuf,
    sampling_rate: u32,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
}

impl WavFileSink {
    /// The file is created when the device opens the sink.
    pub fn new(path: &Path, sampling_rate: u32) -> Self {
        Self {
            path: path.to_path_buf(),
            sampling_rate,
            writer: None,
        }
    }

    fn wav_error(e: hound::Error) -> VoxlineError {
        VoxlineError::Output {
            message: format!("WAV write failed: {}", e),
        }
    }
}

impl AudioSink for WavFileSink {
    fn write(&mut self, frame: &AudioFrame) -> Result<()> {
        if frame.sampling_rate != self.sampling_rate {
            return Err(VoxlineError::Output {
                message: format!(
                    "frame rate {} Hz does not match recording rate {} Hz",
                    frame.sampling_rate, self.sampling_rate
                ),
            });
        }
        let writer = self.writer.as_mut().ok_or_else(|| VoxlineError::Output {
            message: "WAV sink is not open".to_string(),
        })?;
        for sample in frame.to_samples() {
            writer.write_sample(sample).map_err(Self::wav_error)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "wav"
    }

    fn open(&mut self) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sampling_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&self.path, spec).map_err(Self::wav_error)?;
        tracing::debug!(path = %self.path.display(), "recording output");
        self.writer = Some(writer);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match self.writer.take() {
            Some(writer) => writer.finalize().map_err(Self::wav_error),
            None => Ok(()),
        }
    }
}
