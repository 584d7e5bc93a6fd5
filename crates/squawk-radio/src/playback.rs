//! Receive-side decode and gapless playback scheduling.
//!
//! Decoded buffers are stamped with a start time on an audio clock and
//! handed to the output sink. Per channel, each buffer starts exactly
//! where the previous one ended unless that end drifted into the past or
//! more than the lookahead bound into the future, in which case the chain
//! resets to "now". Channels mix through a single output gain stage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::debug;

use crate::codec;
use crate::protocol::AudioChunk;

/// Monotonic audio clock in seconds. The output device supplies the real
/// one; tests drive a manual clock.
pub trait AudioClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Wall-clock-backed audio clock.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioClock for SystemClock {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

/// Hand-driven clock for deterministic scheduling tests.
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(0.0),
        }
    }

    pub fn advance(&self, secs: f64) {
        if let Ok(mut now) = self.now.lock() {
            *now += secs;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioClock for ManualClock {
    fn now(&self) -> f64 {
        self.now.lock().map(|n| *n).unwrap_or(0.0)
    }
}

/// Shared output gain stage, 0.0..=1.0. Atomic so the audio callback can
/// read it without locking.
#[derive(Clone)]
pub struct OutputGain {
    bits: Arc<AtomicU32>,
}

impl OutputGain {
    pub fn new(initial: f32) -> Self {
        Self {
            bits: Arc::new(AtomicU32::new(initial.clamp(0.0, 1.0).to_bits())),
        }
    }

    /// Set from a 0..100 volume control.
    pub fn set_volume(&self, volume: u8) {
        let gain = f32::from(volume.min(100)) / 100.0;
        self.bits.store(gain.to_bits(), Ordering::Release);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }
}

/// One decoded buffer stamped for the output device.
#[derive(Debug, Clone)]
pub struct ScheduledBuffer {
    pub channel: String,
    /// Start time on the audio clock, seconds.
    pub start: f64,
    pub samples: Vec<f32>,
    pub gain: f32,
}

const SINK_CAPACITY: usize = 256;

pub struct PlaybackScheduler {
    clock: Arc<dyn AudioClock>,
    sample_rate: u32,
    lookahead_secs: f64,
    gain: OutputGain,
    /// Scheduled end time of the last queued buffer, per channel.
    next_start: Mutex<HashMap<String, f64>>,
    sink: mpsc::Sender<ScheduledBuffer>,
}

impl PlaybackScheduler {
    pub fn new(
        clock: Arc<dyn AudioClock>,
        sample_rate: u32,
        lookahead_secs: f64,
    ) -> (Self, mpsc::Receiver<ScheduledBuffer>) {
        let (sink, rx) = mpsc::channel(SINK_CAPACITY);
        (
            Self {
                clock,
                sample_rate,
                lookahead_secs,
                gain: OutputGain::new(0.8),
                next_start: Mutex::new(HashMap::new()),
                sink,
            },
            rx,
        )
    }

    pub fn gain(&self) -> OutputGain {
        self.gain.clone()
    }

    /// Decode a received chunk and schedule it, unless it is our own or
    /// the channel is not receive-enabled. Returns true if anything was
    /// queued. Never blocks: decode happens inline and a lagging sink
    /// drops the buffer rather than stalling the subscription.
    pub fn handle_chunk(
        &self,
        channel: &str,
        chunk: &AudioChunk,
        own_id: &str,
        rx_enabled: bool,
    ) -> bool {
        if chunk.sid == own_id || !rx_enabled {
            return false;
        }
        let samples = codec::decode_chunk(&chunk.pcm);
        if samples.is_empty() {
            return false;
        }
        self.schedule(channel, samples)
    }

    /// Stamp a buffer with its gapless start time and queue it.
    pub fn schedule(&self, channel: &str, samples: Vec<f32>) -> bool {
        let duration = samples.len() as f64 / f64::from(self.sample_rate);
        let now = self.clock.now();
        let start = {
            let mut next_start = match self.next_start.lock() {
                Ok(guard) => guard,
                Err(_) => return false,
            };
            let chained = next_start.get(channel).copied();
            let start = match chained {
                Some(t) if t >= now && t <= now + self.lookahead_secs => t,
                _ => now,
            };
            next_start.insert(channel.to_string(), start + duration);
            start
        };

        let buffer = ScheduledBuffer {
            channel: channel.to_string(),
            start,
            samples,
            gain: self.gain.get(),
        };
        if self.sink.try_send(buffer).is_err() {
            debug!(channel, "playback sink lagging, buffer dropped");
            return false;
        }
        true
    }

    /// Forget a channel's chain so the next buffer starts at "now".
    /// Called when a new speaker takes the channel.
    pub fn reset_channel(&self, channel: &str) {
        if let Ok(mut next_start) = self.next_start.lock() {
            next_start.remove(channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scheduler(lookahead: f64) -> (Arc<ManualClock>, PlaybackScheduler, mpsc::Receiver<ScheduledBuffer>) {
        let clock = Arc::new(ManualClock::new());
        let (sched, rx) = PlaybackScheduler::new(clock.clone(), 16_000, lookahead);
        (clock, sched, rx)
    }

    fn chunk_from(samples: &[i16], sid: &str) -> AudioChunk {
        AudioChunk {
            pcm: codec::encode_block(samples),
            sid: sid.into(),
            t: json!(0),
            n: 1,
        }
    }

    #[test]
    fn consecutive_buffers_chain_exactly() {
        let (_clock, sched, mut rx) = scheduler(1.0);

        // 1600 samples at 16 kHz = 100 ms each.
        assert!(sched.schedule("main", vec![0.0; 1600]));
        assert!(sched.schedule("main", vec![0.0; 1600]));
        assert!(sched.schedule("main", vec![0.0; 1600]));

        let a = rx.try_recv().unwrap();
        let b = rx.try_recv().unwrap();
        let c = rx.try_recv().unwrap();
        assert_eq!(a.start, 0.0);
        assert!((b.start - 0.1).abs() < 1e-9);
        assert!((c.start - 0.2).abs() < 1e-9);
    }

    #[test]
    fn chain_resets_when_end_is_in_the_past() {
        let (clock, sched, mut rx) = scheduler(1.0);

        sched.schedule("main", vec![0.0; 1600]);
        // The chunk finished at 0.1; a long gap passes.
        clock.advance(5.0);
        sched.schedule("main", vec![0.0; 1600]);

        let _ = rx.try_recv().unwrap();
        let late = rx.try_recv().unwrap();
        assert_eq!(late.start, 5.0);
    }

    #[test]
    fn chain_resets_beyond_lookahead() {
        let (_clock, sched, mut rx) = scheduler(0.25);

        // Three 150 ms buffers: the third would start at 0.3, past the
        // 0.25 s lookahead, so it snaps back to now.
        for _ in 0..3 {
            sched.schedule("main", vec![0.0; 2400]);
        }
        let starts: Vec<f64> = (0..3).map(|_| rx.try_recv().unwrap().start).collect();
        assert_eq!(starts[0], 0.0);
        assert!((starts[1] - 0.15).abs() < 1e-9);
        assert_eq!(starts[2], 0.0);
    }

    #[test]
    fn channels_chain_independently() {
        let (_clock, sched, mut rx) = scheduler(1.0);

        sched.schedule("main", vec![0.0; 1600]);
        sched.schedule("channel2", vec![0.0; 1600]);

        let a = rx.try_recv().unwrap();
        let b = rx.try_recv().unwrap();
        assert_eq!(a.start, 0.0);
        assert_eq!(b.start, 0.0);
        assert_ne!(a.channel, b.channel);
    }

    #[test]
    fn own_chunks_and_disabled_channels_are_skipped() {
        let (_clock, sched, mut rx) = scheduler(1.0);
        let chunk = chunk_from(&[100; 160], "me");

        assert!(!sched.handle_chunk("main", &chunk, "me", true));
        assert!(!sched.handle_chunk("main", &chunk, "other", false));
        assert!(sched.handle_chunk("main", &chunk, "other", true));
        assert_eq!(rx.try_recv().unwrap().samples.len(), 160);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fully_malformed_chunk_schedules_nothing() {
        let (_clock, sched, mut rx) = scheduler(1.0);
        let chunk = AudioChunk {
            pcm: "!!!not-base64!!!".into(),
            sid: "other".into(),
            t: json!(0),
            n: 1,
        };
        assert!(!sched.handle_chunk("main", &chunk, "me", true));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn reset_channel_restarts_chain_at_now() {
        let (clock, sched, mut rx) = scheduler(10.0);

        sched.schedule("main", vec![0.0; 16_000]); // ends at 1.0
        clock.advance(0.2);
        sched.reset_channel("main");
        sched.schedule("main", vec![0.0; 1600]);

        let _ = rx.try_recv().unwrap();
        let after_reset = rx.try_recv().unwrap();
        assert!((after_reset.start - 0.2).abs() < 1e-9);
    }

    #[test]
    fn volume_maps_to_gain() {
        let gain = OutputGain::new(0.8);
        assert!((gain.get() - 0.8).abs() < 1e-6);
        gain.set_volume(50);
        assert!((gain.get() - 0.5).abs() < 1e-6);
        gain.set_volume(200);
        assert!((gain.get() - 1.0).abs() < 1e-6);
        gain.set_volume(0);
        assert_eq!(gain.get(), 0.0);
    }

    #[test]
    fn scheduled_buffer_carries_current_gain() {
        let (_clock, sched, mut rx) = scheduler(1.0);
        sched.gain().set_volume(25);
        sched.schedule("main", vec![0.0; 160]);
        assert!((rx.try_recv().unwrap().gain - 0.25).abs() < 1e-6);
    }
}
