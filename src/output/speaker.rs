//! Local speaker playback using CPAL.

use crate::audio::AudioFrame;
use crate::error::{Result, VoxlineError};
use crate::output::AudioSink;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: The stream is created, used and dropped on the playback thread
/// only; the sink is never shared between threads.
struct SendableStream(#[allow(dead_code)] cpal::Stream);

unsafe impl Send for SendableStream {}

/// Runs `f` with fd 2 pointed at /dev/null, hiding the ALSA/JACK chatter
/// printed while the host scans its backends.
///
/// Swaps file descriptor 2 process-wide, so output other threads write to
/// stderr meanwhile is lost.
fn quietly<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
        }
        if devnull >= 0 {
            libc::close(devnull);
        }

        let result = f();

        if saved >= 0 {
            libc::dup2(saved, 2);
            libc::close(saved);
        }
        result
    }
}

/// Blocking speaker sink.
///
/// Writes block while more than `max_buffered` of audio is waiting, so the
/// playback thread advances at real-time pace.
pub struct SpeakerSink {
    sampling_rate: u32,
    max_buffered: Duration,
    buffer: Arc<Mutex<VecDeque<f32>>>,
    stream: Option<SendableStream>,
}

impl SpeakerSink {
    pub fn new(sampling_rate: u32) -> Self {
        Self {
            sampling_rate,
            max_buffered: Duration::from_millis(200),
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            stream: None,
        }
    }

    pub fn with_max_buffered(mut self, max_buffered: Duration) -> Self {
        self.max_buffered = max_buffered;
        self
    }

    fn buffered(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    fn audio_error(message: impl std::fmt::Display) -> VoxlineError {
        VoxlineError::Output {
            message: message.to_string(),
        }
    }
}

impl AudioSink for SpeakerSink {
    fn write(&mut self, frame: &AudioFrame) -> Result<()> {
        let step = frame.sampling_rate as f64 / self.sampling_rate as f64;
        let samples = frame.to_samples();
        let output_len = (samples.len() as f64 / step) as usize;
        let converted = (0..output_len).filter_map(|i| {
            samples
                .get((i as f64 * step) as usize)
                .map(|&s| s as f32 / i16::MAX as f32)
        });

        self.buffer
            .lock()
            .map_err(|_| Self::audio_error("speaker buffer poisoned"))?
            .extend(converted);

        let limit = (self.max_buffered.as_secs_f64() * self.sampling_rate as f64) as usize;
        let deadline =
            std::time::Instant::now() + frame.duration() + self.max_buffered + Duration::from_secs(1);
        while self.buffered() > limit {
            if std::time::Instant::now() >= deadline {
                return Err(Self::audio_error("speaker stopped consuming audio"));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "speaker"
    }

    fn open(&mut self) -> Result<()> {
        let device = quietly(|| cpal::default_host().default_output_device())
            .ok_or_else(|| Self::audio_error("no output device available"))?;
        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.sampling_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // One second of silence avoids an initial underrun click.
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.extend(std::iter::repeat_n(0.0, self.sampling_rate as usize));
        }

        let buffer = Arc::clone(&self.buffer);
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if let Ok(mut buffer) = buffer.lock() {
                        for sample in data.iter_mut() {
                            *sample = buffer.pop_front().unwrap_or(0.0);
                        }
                    } else {
                        data.fill(0.0);
                    }
                },
                |err| tracing::warn!(error = %err, "speaker stream error"),
                None,
            )
            .map_err(|e| Self::audio_error(format!("failed to open speaker: {}", e)))?;
        stream
            .play()
            .map_err(|e| Self::audio_error(format!("failed to start speaker: {}", e)))?;

        self.stream = Some(SendableStream(stream));
        Ok(())
    }

    fn discard_buffered(&mut self) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.clear();
        }
    }

    fn close(&mut self) -> Result<()> {
        self.stream = None;
        Ok(())
    }
}
