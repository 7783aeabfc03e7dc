//! G.711 mu-law companding.

/// Encoded value of a zero sample.
pub const MULAW_SILENCE: u8 = 0xFF;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Compresses a 16-bit PCM sample to mu-law.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let mut value = sample as i32;
    let sign = if value < 0 {
        value = -value;
        0x80
    } else {
        0
    };
    value = value.min(CLIP) + BIAS;

    // Position of the highest set bit above the 8-bit mantissa window.
    let exponent = (7 - ((value as u32) << 17).leading_zeros().min(7)) as i32;
    let mantissa = (value >> (exponent + 3)) & 0x0F;

    !(sign | (exponent << 4) | mantissa) as u8
}

/// Expands a mu-law byte to a 16-bit PCM sample.
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let inverted = !byte as i32;
    let sign = inverted & 0x80;
    let exponent = (inverted >> 4) & 0x07;
    let mantissa = inverted & 0x0F;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;

    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Encodes a PCM buffer.
pub fn encode_mulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| linear_to_mulaw(s)).collect()
}

/// Decodes a mu-law buffer.
pub fn decode_mulaw(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| mulaw_to_linear(b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_encodes_to_silence_byte() {
        assert_eq!(linear_to_mulaw(0), MULAW_SILENCE);
        assert_eq!(mulaw_to_linear(MULAW_SILENCE), 0);
    }

    #[test]
    fn test_known_reference_values() {
        // Reference values from the G.711 tables.
        assert_eq!(linear_to_mulaw(i16::MAX), 0x80);
        assert_eq!(linear_to_mulaw(i16::MIN), 0x00);
        assert_eq!(mulaw_to_linear(0x80), 32124);
        assert_eq!(mulaw_to_linear(0x00), -32124);
        assert_eq!(linear_to_mulaw(-1), 0x7F);
    }

    #[test]
    fn test_sign_is_preserved() {
        for sample in [100i16, 1000, 8000, 20000] {
            assert!(mulaw_to_linear(linear_to_mulaw(sample)) > 0);
            assert!(mulaw_to_linear(linear_to_mulaw(-sample)) < 0);
        }
    }

    #[test]
    fn test_quantization_error_is_bounded() {
        for sample in (-32000i16..32000).step_by(97) {
            let decoded = mulaw_to_linear(linear_to_mulaw(sample)) as i32;
            let error = (decoded - sample as i32).abs();
            // Step size grows with magnitude; 1/16 of the value plus the bias bound.
            let bound = (sample as i32).abs() / 16 + 16;
            assert!(
                error <= bound,
                "sample {} decoded to {} (error {})",
                sample,
                decoded,
                error
            );
        }
    }

    #[test]
    fn test_buffer_helpers_preserve_length() {
        let samples = vec![0i16, 500, -500, 12000];
        let encoded = encode_mulaw(&samples);
        assert_eq!(encoded.len(), 4);
        assert_eq!(decode_mulaw(&encoded).len(), 4);
    }
}
