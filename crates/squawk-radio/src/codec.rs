//! PCM wire codec: linear resampling, asymmetric 16-bit quantization, and
//! base64 segment framing.
//!
//! The asymmetric full-scale mapping (negative samples scaled by 32768,
//! non-negative by 32767) is load-bearing: the receive path divides by the
//! same constants, so a sample survives encode → decode bit-exactly within
//! quantization error. Do not "fix" it to a symmetric divisor.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Separator between base64 segments inside one chunk's `pcm` field.
pub const CHUNK_DELIMITER: char = '|';

/// Resample to the target rate by linear interpolation at fractional
/// source positions. The last sample is held for positions past the end.
pub fn resample_linear(input: &[f32], native_rate: u32, target_rate: u32) -> Vec<f32> {
    if input.is_empty() || native_rate == 0 || target_rate == 0 {
        return Vec::new();
    }
    let ratio = native_rate as f64 / target_rate as f64;
    let out_len = (input.len() as f64 / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos.floor() as usize;
        let frac = (pos - idx as f64) as f32;
        let a = input.get(idx).copied().unwrap_or(0.0);
        let b = input[(idx + 1).min(input.len() - 1)];
        out.push(a + frac * (b - a));
    }
    out
}

/// Clamp to [-1, 1] and quantize with the asymmetric full-scale map.
pub fn quantize(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Inverse of [`quantize`]: divide by the divisor matching the sign.
pub fn normalize(sample: i16) -> f32 {
    if sample < 0 {
        f32::from(sample) / 32768.0
    } else {
        f32::from(sample) / 32767.0
    }
}

/// Encode one processed block as a base64 segment (i16 little-endian).
pub fn encode_block(samples: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    BASE64.encode(bytes)
}

/// Decode one base64 segment back into normalized floats. Returns `None`
/// for malformed input (bad base64 or odd byte count).
pub fn decode_segment(segment: &str) -> Option<Vec<f32>> {
    let bytes = BASE64.decode(segment).ok()?;
    if bytes.len() % 2 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(2)
            .map(|pair| normalize(i16::from_le_bytes([pair[0], pair[1]])))
            .collect(),
    )
}

/// Decode a whole chunk's `pcm` field. Malformed segments are dropped
/// silently; the rest of the chunk still plays.
pub fn decode_chunk(pcm: &str) -> Vec<f32> {
    let mut out = Vec::new();
    for segment in pcm.split(CHUNK_DELIMITER) {
        if segment.is_empty() {
            continue;
        }
        if let Some(samples) = decode_segment(segment) {
            out.extend(samples);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn quantize_full_scale_endpoints() {
        assert_eq!(quantize(-1.0), -32768);
        assert_eq!(quantize(1.0), 32767);
        assert_eq!(quantize(0.0), 0);
        // Out-of-range input clamps instead of wrapping.
        assert_eq!(quantize(-2.5), -32768);
        assert_eq!(quantize(3.0), 32767);
    }

    #[test]
    fn normalize_inverts_quantize_at_endpoints() {
        assert_eq!(normalize(quantize(-1.0)), -1.0);
        assert_eq!(normalize(quantize(1.0)), 1.0);
    }

    #[test]
    fn round_trip_within_quantization_error() {
        let mut rng = rand::thread_rng();
        let samples: Vec<f32> = (0..4096).map(|_| rng.gen_range(-1.0f32..=1.0)).collect();

        let quantized: Vec<i16> = samples.iter().map(|&s| quantize(s)).collect();
        let encoded = encode_block(&quantized);
        let decoded = decode_segment(&encoded).unwrap();

        assert_eq!(decoded.len(), samples.len());
        for (orig, got) in samples.iter().zip(&decoded) {
            assert!(
                (orig - got).abs() <= 1.0 / 32767.0,
                "sample {orig} decoded as {got}"
            );
        }
    }

    #[test]
    fn decoded_then_reencoded_is_bit_exact() {
        let mut rng = rand::thread_rng();
        let quantized: Vec<i16> = (0..1024).map(|_| rng.gen::<i16>()).collect();
        let decoded = decode_segment(&encode_block(&quantized)).unwrap();
        let requantized: Vec<i16> = decoded.iter().map(|&s| quantize(s)).collect();
        assert_eq!(quantized, requantized);
    }

    #[test]
    fn chunk_splits_on_delimiter() {
        let a = encode_block(&[100, -100]);
        let b = encode_block(&[32767, -32768]);
        let pcm = format!("{a}{CHUNK_DELIMITER}{b}");
        let decoded = decode_chunk(&pcm);
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded[2], 1.0);
        assert_eq!(decoded[3], -1.0);
    }

    #[test]
    fn malformed_segment_dropped_silently() {
        let good = encode_block(&[1, 2, 3]);
        let pcm = format!("not base64!!{CHUNK_DELIMITER}{good}");
        let decoded = decode_chunk(&pcm);
        assert_eq!(decoded.len(), 3);

        // Odd byte count is also malformed.
        let odd = BASE64.encode([0u8, 1, 2]);
        assert!(decode_segment(&odd).is_none());
    }

    #[test]
    fn resample_identity_at_equal_rates() {
        let input = vec![0.1, -0.2, 0.3, -0.4];
        let out = resample_linear(&input, 16_000, 16_000);
        assert_eq!(out, input);
    }

    #[test]
    fn resample_halves_length_at_double_rate() {
        let input: Vec<f32> = (0..480).map(|i| (i as f32 / 480.0).sin()).collect();
        let out = resample_linear(&input, 48_000, 16_000);
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn resample_interpolates_between_neighbors() {
        // 4 samples at 2x rate: output positions 0.0 and 2.0 land on
        // inputs, position 1.0 on input[1].
        let input = vec![0.0, 1.0, 0.0, -1.0];
        let out = resample_linear(&input, 32_000, 16_000);
        assert_eq!(out, vec![0.0, 0.0]);

        // 3:2 ratio exercises a fractional position.
        let out = resample_linear(&[0.0, 1.0, 2.0], 24_000, 16_000);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn resample_empty_input() {
        assert!(resample_linear(&[], 48_000, 16_000).is_empty());
    }
}
