//! Channel arbitration: exclusive speaker ownership via optimistic CAS.
//!
//! One `Arbiter` per session. The claim transaction accepts only if the
//! slot is absent or already ours; everything else aborts with no side
//! effects. The store applying the first conditional update decides the
//! race — losers get `committed = false` and hold nothing.
//!
//! A release can arrive while the claim transaction is still in flight.
//! The intent is recorded as `ClaimAborting` and resolved once the
//! transaction lands: a non-committed claim simply returns to idle, a
//! committed one is released immediately. A channel is never left claimed
//! with no active capture.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use squawk_common::{RadioError, StoreError};
use squawk_store::{server_timestamp, CoordinationStore, DisconnectAction, TxnDecision};

use crate::protocol::{paths, SpeakerClaim};

/// Engine state. One outbound transmission per client across all
/// channels, so a single machine covers the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxState {
    Idle,
    /// Claim transaction issued, outcome pending.
    Claiming { channel: String },
    Transmitting { channel: String },
    Releasing { channel: String },
    /// Stop requested while the claim transaction is outstanding.
    ClaimAborting { channel: String },
}

/// Outcome of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    /// Committed; the session should start capture.
    Granted,
    /// Someone else holds the slot.
    Busy,
    /// A stop request overtook the claim; any committed slot was already
    /// released. Capture must not start.
    Aborted,
}

pub struct Arbiter {
    store: Arc<dyn CoordinationStore>,
    namespace: String,
    user_id: String,
    display_name: String,
    ready: Arc<AtomicBool>,
    state: Mutex<TxState>,
    /// Locally observed claims, fed by the session's speaker watches.
    /// Enables the busy fast-path; the CAS stays authoritative.
    observed: RwLock<HashMap<String, SpeakerClaim>>,
}

impl Arbiter {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        namespace: String,
        user_id: String,
        display_name: String,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            namespace,
            user_id,
            display_name,
            ready,
            state: Mutex::new(TxState::Idle),
            observed: RwLock::new(HashMap::new()),
        }
    }

    pub async fn state(&self) -> TxState {
        self.state.lock().await.clone()
    }

    pub async fn is_idle(&self) -> bool {
        matches!(*self.state.lock().await, TxState::Idle)
    }

    /// Record a watched claim change for the busy fast-path.
    pub fn note_claim(&self, channel: &str, claim: Option<SpeakerClaim>) {
        if let Ok(mut observed) = self.observed.write() {
            match claim {
                Some(c) => {
                    observed.insert(channel.to_string(), c);
                }
                None => {
                    observed.remove(channel);
                }
            }
        }
    }

    fn observed_foreign_claim(&self, channel: &str) -> bool {
        self.observed
            .read()
            .map(|observed| {
                observed
                    .get(channel)
                    .is_some_and(|c| c.user_id != self.user_id)
            })
            .unwrap_or(false)
    }

    /// Attempt to take the speaker slot for a channel.
    pub async fn claim(&self, channel: &str) -> Result<ClaimResult, RadioError> {
        let claim_path = paths::speaker(&self.namespace, channel);
        let proposed = serde_json::to_value(SpeakerClaim {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            timestamp: server_timestamp(),
        })
        .map_err(StoreError::from)?;

        {
            let mut state = self.state.lock().await;
            if !matches!(*state, TxState::Idle) {
                let current = match &*state {
                    TxState::Claiming { channel }
                    | TxState::Transmitting { channel }
                    | TxState::Releasing { channel }
                    | TxState::ClaimAborting { channel } => channel.clone(),
                    TxState::Idle => unreachable!(),
                };
                return Err(RadioError::AlreadyTransmitting(current));
            }
            if !self.ready.load(Ordering::Acquire) {
                return Err(RadioError::NotReady("store link not established".into()));
            }
            // Fast local rejection on a stale-tolerant cache; no
            // transaction is issued at all.
            if self.observed_foreign_claim(channel) {
                debug!(channel, "claim refused locally, slot observed busy");
                return Ok(ClaimResult::Busy);
            }
            *state = TxState::Claiming {
                channel: channel.to_string(),
            };
        }

        let own_id = self.user_id.clone();
        let outcome = self
            .store
            .transaction(&claim_path, &move |current: Option<&Value>| {
                match current {
                    None => TxnDecision::Write(Some(proposed.clone())),
                    Some(existing)
                        if existing.get("userId").and_then(|v| v.as_str())
                            == Some(own_id.as_str()) =>
                    {
                        TxnDecision::Write(Some(proposed.clone()))
                    }
                    Some(_) => TxnDecision::Abort,
                }
            })
            .await;

        let mut state = self.state.lock().await;
        let stop_requested = matches!(*state, TxState::ClaimAborting { .. });

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // Transaction fault: surface it, never leave a dangling
                // claim or a stuck state.
                warn!(channel, error = %e, "claim transaction failed");
                *state = TxState::Idle;
                return Err(RadioError::Store(e));
            }
        };

        if stop_requested {
            if outcome.committed {
                // We did win the slot, but a stop request arrived first.
                // Release right away instead of starting capture.
                debug!(channel, "claim committed after stop request, releasing");
                self.release_slot(channel).await;
            }
            *state = TxState::Idle;
            return Ok(ClaimResult::Aborted);
        }

        if !outcome.committed {
            *state = TxState::Idle;
            return Ok(ClaimResult::Busy);
        }

        let setup: Result<(), StoreError> = async {
            self.store
                .register_disconnect(&claim_path, DisconnectAction::Remove)
                .await?;
            // A new speaker starts from a clean log; this also bounds growth.
            self.store
                .remove(&paths::stream(&self.namespace, channel))
                .await?;
            Ok(())
        }
        .await;
        if let Err(e) = setup {
            // The slot committed but the follow-up writes failed; give the
            // slot back and return to idle rather than holding a claim with
            // no capture behind it.
            warn!(channel, error = %e, "post-claim setup failed, releasing slot");
            self.release_slot(channel).await;
            *state = TxState::Idle;
            return Err(RadioError::Store(e));
        }

        *state = TxState::Transmitting {
            channel: channel.to_string(),
        };
        info!(channel, "speaker slot claimed");
        Ok(ClaimResult::Granted)
    }

    /// Release the slot if we hold it, or record the stop intent if a
    /// claim is still in flight. Idempotent.
    pub async fn release(&self) -> Result<(), RadioError> {
        let mut state = self.state.lock().await;
        match state.clone() {
            TxState::Idle | TxState::Releasing { .. } | TxState::ClaimAborting { .. } => Ok(()),
            TxState::Claiming { channel } => {
                debug!(channel, "stop requested while claim in flight");
                *state = TxState::ClaimAborting { channel };
                Ok(())
            }
            TxState::Transmitting { channel } => {
                *state = TxState::Releasing {
                    channel: channel.clone(),
                };
                self.release_slot(&channel).await;
                *state = TxState::Idle;
                info!(channel, "speaker slot released");
                Ok(())
            }
        }
    }

    /// Clear the claim (only if still ours), the audio log, and the
    /// disconnect registration. Best-effort: a failed store call must not
    /// strand the state machine.
    async fn release_slot(&self, channel: &str) {
        let claim_path = paths::speaker(&self.namespace, channel);
        let stream_path = paths::stream(&self.namespace, channel);

        if let Err(e) = self.store.remove(&stream_path).await {
            warn!(channel, error = %e, "audio log clear failed on release");
        }

        let own_id = self.user_id.clone();
        let result = self
            .store
            .transaction(&claim_path, &move |current: Option<&Value>| match current {
                Some(existing)
                    if existing.get("userId").and_then(|v| v.as_str())
                        == Some(own_id.as_str()) =>
                {
                    TxnDecision::Write(None)
                }
                _ => TxnDecision::Abort,
            })
            .await;
        if let Err(e) = result {
            warn!(channel, error = %e, "release transaction failed");
        }

        if let Err(e) = self.store.cancel_disconnect(&claim_path).await {
            warn!(channel, error = %e, "disconnect cancel failed");
        }
    }
}
