//! Session controller: one logged-in client, end to end.
//!
//! Owns the presence manager, the arbitration engine, the playback
//! scheduler, and the message board, plus one watch task per channel for
//! the speaker slot and one for the audio log. Transmit requests,
//! receive toggles, and volume changes all go through here; everything
//! observable comes back out on a single event stream, with decoded
//! audio on a separate sink channel for the output device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use squawk_common::{new_id, RadioError};
use squawk_store::CoordinationStore;

use crate::arbitration::{Arbiter, ClaimResult, TxState};
use crate::capture::{CaptureHandle, CapturePipeline};
use crate::codec;
use crate::config::{FeedbackPolicy, RadioConfig};
use crate::messages::{MessageBoard, MessageEvent};
use crate::playback::{AudioClock, PlaybackScheduler, ScheduledBuffer};
use crate::presence::{PresenceEvent, PresenceManager};
use crate::protocol::{paths, AudioChunk, SpeakerClaim};
use crate::tone;

/// Front-panel status line.
#[derive(Debug, Clone, PartialEq)]
pub enum TxStatus {
    Standby,
    Transmitting { channel: String },
    Receiving { channel: String, from: String },
    /// Claim lost the race; auto-clears after `status_clear_ms`.
    Busy { channel: String },
    /// Capture device refused; auto-clears.
    MicError,
    /// Store fault during a transmit attempt; auto-clears.
    Error { message: String },
}

/// Everything the embedding UI can observe about a session.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    Status(TxStatus),
    /// A channel's speaker slot changed hands (or cleared).
    ChannelActivity {
        channel: String,
        speaker: Option<SpeakerClaim>,
    },
    Reconnecting,
    Reconnected,
    Message(MessageEvent),
}

/// Receive-side streams handed out at login.
pub struct SessionStreams {
    pub events: mpsc::Receiver<RadioEvent>,
    /// Decoded, start-stamped buffers for the output device.
    pub audio: mpsc::Receiver<ScheduledBuffer>,
}

impl std::fmt::Debug for SessionStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStreams").finish_non_exhaustive()
    }
}

pub struct Session {
    store: Arc<dyn CoordinationStore>,
    config: RadioConfig,
    user_id: String,
    arbiter: Arc<Arbiter>,
    presence: PresenceManager,
    board: Arc<MessageBoard>,
    scheduler: Arc<PlaybackScheduler>,
    rx_enabled: HashMap<String, Arc<AtomicBool>>,
    capture: Arc<std::sync::Mutex<Option<CapturePipeline>>>,
    tone_task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
    clear_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    event_tx: mpsc::Sender<RadioEvent>,
    tasks: Vec<JoinHandle<()>>,
    logged_out: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Authenticate against the room passphrase, establish presence, and
    /// start watching every provisioned channel.
    pub async fn login(
        store: Arc<dyn CoordinationStore>,
        config: RadioConfig,
        display_name: &str,
        passphrase: &str,
        clock: Arc<dyn AudioClock>,
    ) -> Result<(Self, SessionStreams), RadioError> {
        if !config.passphrase.is_empty() && passphrase != config.passphrase {
            return Err(RadioError::BadPassphrase);
        }

        let user_id = new_id();
        let ready = Arc::new(AtomicBool::new(false));
        let (presence, mut presence_rx) = PresenceManager::start(
            Arc::clone(&store),
            &config.namespace,
            &user_id,
            display_name,
            Duration::from_secs(config.heartbeat_interval_secs),
            Arc::clone(&ready),
        )
        .await?;

        let arbiter = Arc::new(Arbiter::new(
            Arc::clone(&store),
            config.namespace.clone(),
            user_id.clone(),
            display_name.to_string(),
            ready,
        ));

        let (scheduler, audio_rx) = PlaybackScheduler::new(
            clock,
            config.sample_rate,
            config.playback_lookahead_secs,
        );
        let scheduler = Arc::new(scheduler);

        let board = Arc::new(MessageBoard::new(
            Arc::clone(&store),
            config.namespace.clone(),
            user_id.clone(),
            display_name.to_string(),
        ));

        let (event_tx, event_rx) = mpsc::channel(64);
        let mut tasks = Vec::new();

        let rx_enabled: HashMap<String, Arc<AtomicBool>> = config
            .channels
            .iter()
            .map(|c| (c.id.clone(), Arc::new(AtomicBool::new(true))))
            .collect();

        let capture: Arc<std::sync::Mutex<Option<CapturePipeline>>> =
            Arc::new(std::sync::Mutex::new(None));
        let tone_task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>> =
            Arc::new(std::sync::Mutex::new(None));

        for channel_def in &config.channels {
            let channel = channel_def.id.clone();

            // Speaker slot watch: feeds the busy fast-path, resets the
            // playback chain when the speaker changes, surfaces activity.
            let mut claims = store.watch(&paths::speaker(&config.namespace, &channel)).await;
            let watch_arbiter = Arc::clone(&arbiter);
            let watch_scheduler = Arc::clone(&scheduler);
            let watch_tx = event_tx.clone();
            let watch_enabled = Arc::clone(&rx_enabled[&channel]);
            let own = user_id.clone();
            let ch = channel.clone();
            tasks.push(tokio::spawn(async move {
                // The first delivery is the value at subscribe time;
                // record it without reporting it as a change.
                let mut last_speaker: Option<String> = match claims.recv().await {
                    Some(v) => {
                        let claim: Option<SpeakerClaim> =
                            v.and_then(|v| serde_json::from_value(v).ok());
                        watch_arbiter.note_claim(&ch, claim.clone());
                        claim.map(|c| c.user_id)
                    }
                    None => return,
                };
                while let Some(v) = claims.recv().await {
                    let claim: Option<SpeakerClaim> =
                        v.and_then(|v| serde_json::from_value(v).ok());
                    watch_arbiter.note_claim(&ch, claim.clone());

                    let speaker = claim.as_ref().map(|c| c.user_id.clone());
                    if speaker != last_speaker {
                        watch_scheduler.reset_channel(&ch);
                        last_speaker = speaker;
                    }

                    match &claim {
                        Some(c)
                            if c.user_id != own
                                && watch_enabled.load(Ordering::Acquire) =>
                        {
                            let _ = watch_tx
                                .send(RadioEvent::Status(TxStatus::Receiving {
                                    channel: ch.clone(),
                                    from: c.display_name.clone(),
                                }))
                                .await;
                        }
                        None if watch_arbiter.is_idle().await => {
                            let _ = watch_tx
                                .send(RadioEvent::Status(TxStatus::Standby))
                                .await;
                        }
                        _ => {}
                    }
                    let _ = watch_tx
                        .send(RadioEvent::ChannelActivity {
                            channel: ch.clone(),
                            speaker: claim,
                        })
                        .await;
                }
            }));

            // Audio log watch: backlog is dropped, live chunks decode and
            // schedule.
            let mut appends = store
                .watch_appends(&paths::stream(&config.namespace, &channel))
                .await;
            let chunk_scheduler = Arc::clone(&scheduler);
            let chunk_enabled = Arc::clone(&rx_enabled[&channel]);
            let own = user_id.clone();
            let ch = channel.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = appends.recv().await {
                    if event.prior {
                        continue;
                    }
                    let chunk: AudioChunk = match serde_json::from_value(event.value) {
                        Ok(c) => c,
                        Err(e) => {
                            warn!(channel = %ch, error = %e, "malformed audio chunk dropped");
                            continue;
                        }
                    };
                    chunk_scheduler.handle_chunk(
                        &ch,
                        &chunk,
                        &own,
                        chunk_enabled.load(Ordering::Acquire),
                    );
                }
            }));
        }

        // Connectivity transitions force-stop any outbound transmission;
        // the disconnect registration cleans the slot server-side.
        let conn_tx = event_tx.clone();
        let conn_arbiter = Arc::clone(&arbiter);
        let conn_capture = Arc::clone(&capture);
        let conn_tone = Arc::clone(&tone_task);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = presence_rx.recv().await {
                match event {
                    PresenceEvent::Reconnecting => {
                        stop_local_tx(&conn_capture, &conn_tone);
                        if let Err(e) = conn_arbiter.release().await {
                            debug!(error = %e, "release during reconnect failed");
                        }
                        let _ = conn_tx.send(RadioEvent::Reconnecting).await;
                    }
                    PresenceEvent::Reconnected => {
                        let _ = conn_tx.send(RadioEvent::Reconnected).await;
                    }
                }
            }
        }));

        // Message board traffic folds into the main event stream.
        let mut board_rx = board.subscribe().await;
        let msg_tx = event_tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = board_rx.recv().await {
                let _ = msg_tx.send(RadioEvent::Message(event)).await;
            }
        }));

        info!(user_id = %user_id, channels = config.channels.len(), "session logged in");

        Ok((
            Self {
                store,
                config,
                user_id,
                arbiter,
                presence,
                board,
                scheduler,
                rx_enabled,
                capture,
                tone_task,
                clear_task: std::sync::Mutex::new(None),
                event_tx,
                tasks,
                logged_out: AtomicBool::new(false),
            },
            SessionStreams {
                events: event_rx,
                audio: audio_rx,
            },
        ))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Attempt to start transmitting on a channel. `Ok(Some(handle))`
    /// means the slot is ours and the device layer should start feeding
    /// captured blocks through the handle. `Ok(None)` means the channel
    /// was busy or the attempt was cancelled by a stop request; the
    /// status stream already reflects which.
    pub async fn begin_transmit(
        &self,
        channel: &str,
    ) -> Result<Option<CaptureHandle>, RadioError> {
        if self.config.channel(channel).is_none() {
            return Err(RadioError::Other(format!("unknown channel: {channel}")));
        }

        match self.arbiter.claim(channel).await {
            Ok(ClaimResult::Granted) => {
                let pipeline = CapturePipeline::start(
                    Arc::clone(&self.store),
                    paths::stream(&self.config.namespace, channel),
                    self.user_id.clone(),
                    self.config.sample_rate,
                    Duration::from_millis(self.config.chunk_interval_ms),
                );
                let handle = pipeline.handle();
                if let Ok(mut slot) = self.capture.lock() {
                    if let Some(old) = slot.replace(pipeline) {
                        old.stop();
                    }
                }
                // A stop from another task can land between the grant and
                // the install; confirm we still hold the slot before handing
                // out a live handle.
                let still_ours = matches!(
                    self.arbiter.state().await,
                    TxState::Transmitting { channel: ref held } if held.as_str() == channel
                );
                if !still_ours {
                    stop_local_tx(&self.capture, &self.tone_task);
                    return Ok(None);
                }
                self.emit_status(
                    TxStatus::Transmitting {
                        channel: channel.to_string(),
                    },
                    false,
                )
                .await;
                Ok(Some(handle))
            }
            Ok(ClaimResult::Busy) => {
                self.emit_status(
                    TxStatus::Busy {
                        channel: self.config.label(channel).to_string(),
                    },
                    true,
                )
                .await;
                Ok(None)
            }
            Ok(ClaimResult::Aborted) => Ok(None),
            Err(e @ RadioError::AlreadyTransmitting(_)) => Err(e),
            Err(e) => {
                self.emit_status(
                    TxStatus::Error {
                        message: e.to_string(),
                    },
                    true,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Stop transmitting. Safe to call in any state, including while a
    /// claim is still resolving.
    pub async fn end_transmit(&self) -> Result<(), RadioError> {
        let released_channel = match self.arbiter.state().await {
            TxState::Transmitting { channel } => Some(channel),
            _ => None,
        };
        stop_local_tx(&self.capture, &self.tone_task);
        self.arbiter.release().await?;
        if let Some(channel) = released_channel {
            if self.config.feedback == FeedbackPolicy::RogerBeep {
                let samples: Vec<f32> = tone::roger_beep_samples(self.config.sample_rate)
                    .into_iter()
                    .map(codec::normalize)
                    .collect();
                self.scheduler.schedule(&channel, samples);
            }
        }
        self.emit_status(TxStatus::Standby, false).await;
        Ok(())
    }

    /// Device layer reports that capture could not start after a grant.
    pub async fn report_mic_denied(&self) -> Result<(), RadioError> {
        stop_local_tx(&self.capture, &self.tone_task);
        self.arbiter.release().await?;
        self.emit_status(TxStatus::MicError, true).await;
        Err(RadioError::MicDenied)
    }

    /// Claim the channel and play the two-tone dispatch page over it,
    /// paced at the normal chunk cadence. Requires the paging feedback
    /// policy. Returns `Ok(false)` if the channel was busy;
    /// `end_transmit` truncates a page in progress.
    pub async fn send_tone(&self, channel: &str) -> Result<bool, RadioError> {
        if self.config.channel(channel).is_none() {
            return Err(RadioError::Other(format!("unknown channel: {channel}")));
        }
        if self.config.feedback != FeedbackPolicy::PagingTone {
            return Err(RadioError::Other(
                "dispatch paging disabled by feedback policy".into(),
            ));
        }
        match self.arbiter.claim(channel).await {
            Ok(ClaimResult::Granted) => {}
            Ok(ClaimResult::Busy) => {
                self.emit_status(
                    TxStatus::Busy {
                        channel: self.config.label(channel).to_string(),
                    },
                    true,
                )
                .await;
                return Ok(false);
            }
            Ok(ClaimResult::Aborted) => return Ok(false),
            Err(e) => return Err(e),
        }

        self.emit_status(
            TxStatus::Transmitting {
                channel: channel.to_string(),
            },
            false,
        )
        .await;

        let segments = tone::two_tone_page(self.config.sample_rate, self.config.chunk_interval_ms);
        let stream_path = paths::stream(&self.config.namespace, channel);
        let store = Arc::clone(&self.store);
        let arbiter = Arc::clone(&self.arbiter);
        let sid = self.user_id.clone();
        let event_tx = self.event_tx.clone();
        let interval = Duration::from_millis(self.config.chunk_interval_ms);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            for (i, segment) in segments.into_iter().enumerate() {
                ticker.tick().await;
                let chunk = AudioChunk {
                    pcm: segment,
                    sid: sid.clone(),
                    t: squawk_store::server_timestamp(),
                    n: (i + 1) as u64,
                };
                let value = match serde_json::to_value(&chunk) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if let Err(e) = store.append(&stream_path, value).await {
                    warn!(error = %e, "tone chunk append failed");
                }
            }
            if let Err(e) = arbiter.release().await {
                warn!(error = %e, "release after tone failed");
            }
            let _ = event_tx.send(RadioEvent::Status(TxStatus::Standby)).await;
        });
        if let Ok(mut slot) = self.tone_task.lock() {
            if let Some(old) = slot.replace(task) {
                old.abort();
            }
        }
        Ok(true)
    }

    /// Toggle whether a channel's received audio is played.
    pub fn set_receive_enabled(&self, channel: &str, enabled: bool) {
        if let Some(flag) = self.rx_enabled.get(channel) {
            flag.store(enabled, Ordering::Release);
            if !enabled {
                self.scheduler.reset_channel(channel);
            }
        }
    }

    /// Output volume, 0..=100.
    pub fn set_output_volume(&self, volume: u8) {
        self.scheduler.gain().set_volume(volume);
    }

    pub async fn send_message(&self, text: &str) -> Result<Option<String>, RadioError> {
        self.board.send(text).await
    }

    pub async fn reply_message(&self, key: &str, text: &str) -> Result<(), RadioError> {
        self.board.reply(key, text).await
    }

    /// Immediate presence liveness write; for foreground transitions.
    pub async fn touch_presence(&self) {
        self.presence.touch().await;
    }

    /// Full teardown: stop transmitting, release any claim, mark presence
    /// offline, stop every watch. Idempotent.
    pub async fn logout(&self) -> Result<(), RadioError> {
        if self.logged_out.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        stop_local_tx(&self.capture, &self.tone_task);
        if let Err(e) = self.arbiter.release().await {
            warn!(error = %e, "release during logout failed");
        }
        self.board.stop();
        for task in &self.tasks {
            task.abort();
        }
        if let Ok(mut clear) = self.clear_task.lock() {
            if let Some(task) = clear.take() {
                task.abort();
            }
        }
        self.presence.stop().await;
        info!(user_id = %self.user_id, "session logged out");
        Ok(())
    }

    async fn emit_status(&self, status: TxStatus, auto_clear: bool) {
        if let Ok(mut clear) = self.clear_task.lock() {
            if let Some(task) = clear.take() {
                task.abort();
            }
        }
        let _ = self.event_tx.send(RadioEvent::Status(status)).await;
        if auto_clear {
            let tx = self.event_tx.clone();
            let delay = Duration::from_millis(self.config.status_clear_ms);
            let task = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(RadioEvent::Status(TxStatus::Standby)).await;
            });
            if let Ok(mut clear) = self.clear_task.lock() {
                *clear = Some(task);
            }
        }
    }
}

/// Stop capture and any tone page without touching the store. The
/// arbitration release is the caller's responsibility.
fn stop_local_tx(
    capture: &std::sync::Mutex<Option<CapturePipeline>>,
    tone_task: &std::sync::Mutex<Option<JoinHandle<()>>>,
) {
    if let Ok(mut slot) = capture.lock() {
        if let Some(pipeline) = slot.take() {
            pipeline.stop();
        }
    }
    if let Ok(mut slot) = tone_task.lock() {
        if let Some(task) = slot.take() {
            task.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Ok(mut clear) = self.clear_task.lock() {
            if let Some(task) = clear.take() {
                task.abort();
            }
        }
    }
}
