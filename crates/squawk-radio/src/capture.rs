//! Capture/encode pipeline, active only while transmitting.
//!
//! Audio blocks arrive from the device layer at its native rate and are
//! resampled, quantized, and base64-encoded into an in-memory segment
//! buffer. A flush task drains the buffer every chunk interval and appends
//! one delimiter-joined [`AudioChunk`] with a strictly increasing sequence
//! number. An empty interval appends nothing — there are no heartbeat
//! chunks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use squawk_store::{server_timestamp, CoordinationStore};

use crate::codec::{self, CHUNK_DELIMITER};
use crate::protocol::AudioChunk;

struct Shared {
    target_rate: u32,
    active: AtomicBool,
    /// Encoded base64 segments awaiting the next flush. Held only for
    /// push/drain, never across an await.
    segments: Mutex<Vec<String>>,
}

/// Ingress handle for the device-facing audio callback. Cheap to clone;
/// pushing is lock-light and never touches the network.
#[derive(Clone)]
pub struct CaptureHandle {
    shared: Arc<Shared>,
}

impl CaptureHandle {
    /// Process one captured block at the device's native rate. Zero, one,
    /// or many blocks may land within a single flush interval.
    pub fn push_block(&self, samples: &[f32], native_rate: u32) {
        if !self.shared.active.load(Ordering::Acquire) {
            return;
        }
        let resampled = codec::resample_linear(samples, native_rate, self.shared.target_rate);
        if resampled.is_empty() {
            return;
        }
        let quantized: Vec<i16> = resampled.iter().map(|&s| codec::quantize(s)).collect();
        let segment = codec::encode_block(&quantized);
        if let Ok(mut segments) = self.shared.segments.lock() {
            segments.push(segment);
        }
    }
}

/// Owns the flush task for one transmission.
pub struct CapturePipeline {
    shared: Arc<Shared>,
    flush_task: JoinHandle<()>,
}

impl CapturePipeline {
    /// Start capturing toward a channel's audio log.
    pub fn start(
        store: Arc<dyn CoordinationStore>,
        stream_path: String,
        sender_id: String,
        target_rate: u32,
        chunk_interval: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            target_rate,
            active: AtomicBool::new(true),
            segments: Mutex::new(Vec::new()),
        });

        let flush_shared = Arc::clone(&shared);
        let flush_task = tokio::spawn(async move {
            let mut seq: u64 = 0;
            let mut interval = tokio::time::interval(chunk_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !flush_shared.active.load(Ordering::Acquire) {
                    break;
                }
                let drained: Vec<String> = match flush_shared.segments.lock() {
                    Ok(mut segments) => segments.drain(..).collect(),
                    Err(_) => break,
                };
                if drained.is_empty() {
                    continue;
                }
                seq += 1;
                let chunk = AudioChunk {
                    pcm: drained.join(&CHUNK_DELIMITER.to_string()),
                    sid: sender_id.clone(),
                    t: server_timestamp(),
                    n: seq,
                };
                let value = match serde_json::to_value(&chunk) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize audio chunk");
                        continue;
                    }
                };
                if let Err(e) = store.append(&stream_path, value).await {
                    warn!(error = %e, seq, "audio chunk append failed");
                }
            }
            debug!(seq, "capture flush task stopped");
        });

        Self { shared, flush_task }
    }

    pub fn handle(&self) -> CaptureHandle {
        CaptureHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stop capturing. Buffered segments that never flushed are dropped,
    /// matching the release semantics (the log is cleared anyway).
    pub fn stop(&self) {
        self.shared.active.store(false, Ordering::Release);
        self.flush_task.abort();
        if let Ok(mut segments) = self.shared.segments.lock() {
            segments.clear();
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
