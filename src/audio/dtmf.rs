//! DTMF tone synthesis.
//!
//! Tone generation is a pure function of its inputs: the same digit, rate
//! and encoding always yield the same bytes.

use crate::audio::{AudioEncoding, AudioFrame};
use crate::defaults::{DTMF_AMPLITUDE, DTMF_TONE_MS};
use std::f64::consts::TAU;

/// Row and column frequencies in Hz for a keypad symbol.
pub fn frequencies(digit: char) -> Option<(f64, f64)> {
    let pair = match digit {
        '1' => (697.0, 1209.0),
        '2' => (697.0, 1336.0),
        '3' => (697.0, 1477.0),
        '4' => (770.0, 1209.0),
        '5' => (770.0, 1336.0),
        '6' => (770.0, 1477.0),
        '7' => (852.0, 1209.0),
        '8' => (852.0, 1336.0),
        '9' => (852.0, 1477.0),
        '*' => (941.0, 1209.0),
        '0' => (941.0, 1336.0),
        '#' => (941.0, 1477.0),
        _ => return None,
    };
    Some(pair)
}

/// Synthesizes one default-length tone burst for `digit`.
///
/// Returns `None` for characters that are not keypad symbols.
pub fn generate(digit: char, sampling_rate: u32, encoding: AudioEncoding) -> Option<AudioFrame> {
    generate_with_duration(digit, sampling_rate, encoding, DTMF_TONE_MS)
}

/// Synthesizes a tone burst of `duration_ms` milliseconds.
pub fn generate_with_duration(
    digit: char,
    sampling_rate: u32,
    encoding: AudioEncoding,
    duration_ms: u32,
) -> Option<AudioFrame> {
    let (low, high) = frequencies(digit)?;
    let rate = sampling_rate as f64;
    let sample_count = (sampling_rate as u64 * duration_ms as u64 / 1000) as usize;
    let peak = DTMF_AMPLITUDE * i16::MAX as f64;

    let samples: Vec<i16> = (0..sample_count)
        .map(|n| {
            let t = n as f64 / rate;
            let mixed = ((TAU * low * t).sin() + (TAU * high * t).sin()) / 2.0;
            (mixed * peak).round() as i16
        })
        .collect();

    Some(AudioFrame::from_samples(&samples, encoding, sampling_rate))
}
