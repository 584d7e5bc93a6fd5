//! Presence, heartbeat, and reconnection handling.
//!
//! Each client owns one presence record. Login writes it online and
//! registers a disconnect-triggered flip to offline, so presence stays
//! eventually consistent even on abrupt network loss. A heartbeat task
//! writes a liveness timestamp on a fixed interval; `touch()` writes one
//! immediately when the embedding UI regains foreground visibility, which
//! lets consumers tell a frozen client from a backgrounded-but-alive one.
//!
//! The store forgets disconnect registrations once a connection cycles,
//! so every Reconnecting → Connected transition re-asserts presence and
//! re-registers the offline action exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use squawk_common::{RadioError, StoreError};
use squawk_store::{server_timestamp, CoordinationStore, DisconnectAction};

use crate::protocol::paths;

/// Connectivity transitions surfaced to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// Store link lost while we were ready.
    Reconnecting,
    /// Link back after Reconnecting; presence re-asserted.
    Reconnected,
}

pub struct PresenceManager {
    store: Arc<dyn CoordinationStore>,
    presence_path: String,
    ready: Arc<AtomicBool>,
    heartbeat_task: JoinHandle<()>,
    connectivity_task: JoinHandle<()>,
}

/// Write the online record and (re-)register the offline disconnect
/// action. Used at login and after every reconnect.
async fn assert_online(
    store: &Arc<dyn CoordinationStore>,
    presence_path: &str,
    display_name: &str,
) -> Result<(), StoreError> {
    store
        .update(
            presence_path,
            json!({
                "displayName": display_name,
                "online": true,
                "lastSeen": server_timestamp(),
                "heartbeat": server_timestamp(),
            }),
        )
        .await?;
    store
        .register_disconnect(
            presence_path,
            DisconnectAction::Update(json!({
                "online": false,
                "lastSeen": server_timestamp(),
            })),
        )
        .await?;
    Ok(())
}

impl PresenceManager {
    /// Establish presence and start the heartbeat and connectivity tasks.
    /// `ready` is shared with the arbitration engine: claims are refused
    /// while it is false.
    pub async fn start(
        store: Arc<dyn CoordinationStore>,
        namespace: &str,
        user_id: &str,
        display_name: &str,
        heartbeat_interval: Duration,
        ready: Arc<AtomicBool>,
    ) -> Result<(Self, mpsc::Receiver<PresenceEvent>), RadioError> {
        let presence_path = paths::presence(namespace, user_id);
        assert_online(&store, &presence_path, display_name).await?;
        ready.store(true, Ordering::Release);

        let (event_tx, event_rx) = mpsc::channel(32);

        let hb_store = Arc::clone(&store);
        let hb_path = presence_path.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            // The login write already carried a heartbeat.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = hb_store
                    .update(&hb_path, json!({ "heartbeat": server_timestamp() }))
                    .await
                {
                    warn!(error = %e, "heartbeat write failed");
                }
            }
        });

        let conn_store = Arc::clone(&store);
        let conn_path = presence_path.clone();
        let conn_ready = Arc::clone(&ready);
        let name = display_name.to_string();
        let mut connectivity = store.connectivity();
        let connectivity_task = tokio::spawn(async move {
            let mut reconnecting = false;
            loop {
                if connectivity.changed().await.is_err() {
                    break;
                }
                let up = *connectivity.borrow();
                if !up {
                    if conn_ready.swap(false, Ordering::AcqRel) {
                        reconnecting = true;
                        info!("store link lost, entering reconnecting");
                        let _ = event_tx.send(PresenceEvent::Reconnecting).await;
                    }
                } else if reconnecting {
                    // Registrations did not survive the old connection;
                    // assert presence and the offline action again. A failed
                    // re-assert leaves `reconnecting` set so the next link
                    // cycle retries instead of wedging not-ready.
                    match assert_online(&conn_store, &conn_path, &name).await {
                        Ok(()) => {
                            reconnecting = false;
                            conn_ready.store(true, Ordering::Release);
                            info!("store link restored, presence re-asserted");
                            let _ = event_tx.send(PresenceEvent::Reconnected).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "presence re-assert failed");
                        }
                    }
                }
            }
            debug!("connectivity watch ended");
        });

        Ok((
            Self {
                store,
                presence_path,
                ready,
                heartbeat_task,
                connectivity_task,
            },
            event_rx,
        ))
    }

    /// Immediate liveness write, for foreground-visibility transitions.
    pub async fn touch(&self) {
        if let Err(e) = self
            .store
            .update(&self.presence_path, json!({ "heartbeat": server_timestamp() }))
            .await
        {
            warn!(error = %e, "heartbeat touch failed");
        }
    }

    /// Stop tasks and mark presence offline before returning.
    pub async fn stop(&self) {
        self.heartbeat_task.abort();
        self.connectivity_task.abort();
        self.ready.store(false, Ordering::Release);
        if let Err(e) = self
            .store
            .update(
                &self.presence_path,
                json!({ "online": false, "lastSeen": server_timestamp() }),
            )
            .await
        {
            warn!(error = %e, "offline write failed");
        }
        let _ = self.store.cancel_disconnect(&self.presence_path).await;
    }
}

impl Drop for PresenceManager {
    fn drop(&mut self) {
        self.heartbeat_task.abort();
        self.connectivity_task.abort();
    }
}
