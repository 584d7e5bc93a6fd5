//! Half-duplex PTT radio over a shared transactional store.
//!
//! Clients share a small fixed set of audio channels. Exclusive transmit
//! ownership of a channel is arbitrated with optimistic conditional
//! updates on the store — no central coordinator. While one client holds
//! the speaker slot it appends timed base64 PCM chunks to the channel's
//! log; every other client with the channel enabled decodes them and
//! schedules gapless playback.
//!
//! The store itself is behind the `squawk-store` capability trait; this
//! crate contains the arbitration state machine, the audio pipelines,
//! presence/heartbeat, and the session controller tying them together.

pub mod arbitration;
pub mod capture;
pub mod codec;
pub mod config;
pub mod messages;
pub mod playback;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod tone;

pub use arbitration::{Arbiter, ClaimResult, TxState};
pub use capture::{CaptureHandle, CapturePipeline};
pub use codec::{decode_chunk, encode_block, resample_linear, CHUNK_DELIMITER};
pub use config::{ChannelDef, FeedbackPolicy, RadioConfig};
pub use messages::{MessageBoard, MessageEvent};
pub use playback::{AudioClock, OutputGain, PlaybackScheduler, ScheduledBuffer, SystemClock};
pub use presence::{PresenceEvent, PresenceManager};
pub use protocol::{paths, AudioChunk, PresenceRecord, RadioMessage, SpeakerClaim};
pub use session::{RadioEvent, Session, SessionStreams, TxStatus};
