//! Two-tone sequential dispatch page, as a pure waveform function.
//!
//! Motorola-style pattern: a 12 Hz warble between 750 and 1050 Hz, two
//! A/B tone pairs (853.2 Hz then 960 Hz) with short end fades, and a
//! closing 1 kHz burst at reduced level. Roughly 7.8 s total. The result
//! is pre-quantized and pre-split into chunk-interval base64 segments so
//! the session can pace them onto a channel at the normal chunk cadence.

use crate::codec;

const PAGE_VOLUME: f32 = 0.45;
const FADE_MS: u32 = 50;

enum Segment {
    Warble {
        freq_a: f32,
        freq_b: f32,
        alt_rate: f32,
        dur: f32,
        vol: f32,
    },
    Silence {
        dur: f32,
    },
    Tone {
        freq: f32,
        dur: f32,
        vol: f32,
        fade: bool,
    },
}

fn page_segments() -> Vec<Segment> {
    vec![
        Segment::Warble {
            freq_a: 750.0,
            freq_b: 1050.0,
            alt_rate: 12.0,
            dur: 2.0,
            vol: PAGE_VOLUME,
        },
        Segment::Silence { dur: 0.3 },
        Segment::Tone { freq: 853.2, dur: 1.0, vol: PAGE_VOLUME, fade: true },
        Segment::Tone { freq: 960.0, dur: 1.0, vol: PAGE_VOLUME, fade: true },
        Segment::Silence { dur: 0.4 },
        Segment::Tone { freq: 853.2, dur: 1.0, vol: PAGE_VOLUME, fade: true },
        Segment::Tone { freq: 960.0, dur: 1.0, vol: PAGE_VOLUME, fade: true },
        Segment::Silence { dur: 0.3 },
        Segment::Tone { freq: 1000.0, dur: 0.8, vol: PAGE_VOLUME * 0.85, fade: true },
    ]
}

/// Render the page as raw quantized samples.
pub fn two_tone_samples(sample_rate: u32) -> Vec<i16> {
    let rate = sample_rate as f32;
    let fade_samples = (rate * FADE_MS as f32 / 1000.0).floor() as usize;
    let segments = page_segments();

    let total: usize = segments
        .iter()
        .map(|s| {
            let dur = match s {
                Segment::Warble { dur, .. } | Segment::Silence { dur } | Segment::Tone { dur, .. } => *dur,
            };
            (rate * dur).floor() as usize
        })
        .sum();
    let mut out = vec![0i16; total];

    let mut offset = 0;
    for segment in segments {
        match segment {
            Segment::Silence { dur } => {
                offset += (rate * dur).floor() as usize;
            }
            Segment::Warble { freq_a, freq_b, alt_rate, dur, vol } => {
                let len = (rate * dur).floor() as usize;
                let half_period = rate / (alt_rate * 2.0);
                for i in 0..len {
                    let t = i as f32 / rate;
                    let cycle = (i as f32 / half_period).floor() as u32;
                    let freq = if cycle % 2 == 0 { freq_a } else { freq_b };
                    let sample = (2.0 * std::f32::consts::PI * freq * t).sin() * vol;
                    out[offset + i] = codec::quantize(sample);
                }
                offset += len;
            }
            Segment::Tone { freq, dur, vol, fade } => {
                let len = (rate * dur).floor() as usize;
                for i in 0..len {
                    let t = i as f32 / rate;
                    let mut gain = vol;
                    if fade && i > len.saturating_sub(fade_samples) {
                        gain *= (len - i) as f32 / fade_samples as f32;
                    }
                    let sample = (2.0 * std::f32::consts::PI * freq * t).sin() * gain;
                    out[offset + i] = codec::quantize(sample);
                }
                offset += len;
            }
        }
    }
    out
}

const ROGER_FREQ: f32 = 1_000.0;
const ROGER_DUR: f32 = 0.15;
const ROGER_VOLUME: f32 = 0.3;

/// Short local confirmation beep played after a release under the
/// roger-beep feedback policy.
pub fn roger_beep_samples(sample_rate: u32) -> Vec<i16> {
    let rate = sample_rate as f32;
    let len = (rate * ROGER_DUR).floor() as usize;
    let fade_samples = (rate * FADE_MS as f32 / 1000.0).floor() as usize;
    (0..len)
        .map(|i| {
            let t = i as f32 / rate;
            let mut gain = ROGER_VOLUME;
            if i > len.saturating_sub(fade_samples) {
                gain *= (len - i) as f32 / fade_samples as f32;
            }
            codec::quantize((2.0 * std::f32::consts::PI * ROGER_FREQ * t).sin() * gain)
        })
        .collect()
}

/// Render the page as base64 segments sized to the chunk cadence, ready
/// to append one per interval.
pub fn two_tone_page(sample_rate: u32, chunk_interval_ms: u64) -> Vec<String> {
    let samples = two_tone_samples(sample_rate);
    let per_chunk =
        ((sample_rate as u64 * chunk_interval_ms / 1000) as usize).max(1);
    samples
        .chunks(per_chunk)
        .map(codec::encode_block)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_is_about_eight_seconds() {
        let samples = two_tone_samples(16_000);
        let secs = samples.len() as f32 / 16_000.0;
        assert!((secs - 7.8).abs() < 0.01, "page is {secs}s");
    }

    #[test]
    fn silences_land_where_expected() {
        let samples = two_tone_samples(16_000);
        // 2.0 s warble, then 0.3 s silence.
        let silence_start = (16_000.0 * 2.0) as usize;
        let silence = &samples[silence_start + 100..silence_start + 1000];
        assert!(silence.iter().all(|&s| s == 0));
        // Warble itself is not silent.
        assert!(samples[..1000].iter().any(|&s| s != 0));
    }

    #[test]
    fn amplitude_stays_inside_page_volume() {
        let limit = (PAGE_VOLUME * 32768.0) as i16 + 1;
        for s in two_tone_samples(16_000) {
            assert!(s.abs() <= limit);
        }
    }

    #[test]
    fn roger_beep_is_short_and_bounded() {
        let samples = roger_beep_samples(16_000);
        assert_eq!(samples.len(), 2_400);
        let limit = (ROGER_VOLUME * 32768.0) as i16 + 1;
        assert!(samples.iter().all(|s| s.abs() <= limit));
        assert!(samples.iter().any(|&s| s != 0));
        // Fades out rather than clicking.
        assert!(samples[samples.len() - 1].abs() < 100);
    }

    #[test]
    fn chunks_match_cadence() {
        let chunks = two_tone_page(16_000, 200);
        // 200 ms at 16 kHz = 3200 samples per chunk; 7.8 s → 39 chunks.
        assert_eq!(chunks.len(), 39);

        let decoded = codec::decode_segment(&chunks[0]).unwrap();
        assert_eq!(decoded.len(), 3200);
        assert!(decoded.iter().all(|s| s.abs() <= 1.0));
    }
}
