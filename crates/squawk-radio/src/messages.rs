//! Store-and-forward radio text messages.
//!
//! Messages ride the same append log primitive as audio chunks; replies
//! are patched into the original message record in place. Subscribers
//! skip the backlog that existed before they joined and see only
//! genuinely new traffic, plus replies to their own messages.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use squawk_common::{RadioError, StoreError};
use squawk_store::{server_timestamp, CoordinationStore};

use crate::protocol::{paths, RadioMessage};

#[derive(Debug, Clone)]
pub enum MessageEvent {
    /// A message appended after we subscribed.
    New { key: String, message: RadioMessage },
    /// Someone replied to a message we sent.
    Replied { key: String, message: RadioMessage },
}

pub struct MessageBoard {
    store: Arc<dyn CoordinationStore>,
    namespace: String,
    user_id: String,
    callsign: String,
    shutdown: watch::Sender<bool>,
    forwarder: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MessageBoard {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        namespace: String,
        user_id: String,
        callsign: String,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            namespace,
            user_id,
            callsign,
            shutdown,
            forwarder: std::sync::Mutex::new(None),
        }
    }

    /// Append a message. Returns the generated key, or `None` for
    /// whitespace-only input.
    pub async fn send(&self, text: &str) -> Result<Option<String>, RadioError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let message = RadioMessage {
            from: self.callsign.clone(),
            from_user_id: self.user_id.clone(),
            text: text.to_string(),
            timestamp: server_timestamp(),
            reply: None,
            reply_from: None,
            reply_timestamp: None,
        };
        let value = serde_json::to_value(&message).map_err(StoreError::from)?;
        let key = self
            .store
            .append(&paths::messages(&self.namespace), value)
            .await?;
        Ok(Some(key))
    }

    /// Patch a reply into an existing message.
    pub async fn reply(&self, key: &str, text: &str) -> Result<(), RadioError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.store
            .update(
                &paths::message(&self.namespace, key),
                json!({
                    "reply": text,
                    "replyFrom": self.callsign,
                    "replyTimestamp": server_timestamp(),
                }),
            )
            .await?;
        Ok(())
    }

    /// Start watching the board. Backlog messages are skipped; new ones
    /// are emitted, and replies to our own messages are tracked.
    pub async fn subscribe(&self) -> mpsc::Receiver<MessageEvent> {
        let (event_tx, event_rx) = mpsc::channel(64);
        let mut appends = self
            .store
            .watch_appends(&paths::messages(&self.namespace))
            .await;
        let store = Arc::clone(&self.store);
        let namespace = self.namespace.clone();
        let own_id = self.user_id.clone();
        let mut shutdown = self.shutdown.subscribe();

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => break,
                    event = appends.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if event.prior {
                    continue;
                }
                let message: RadioMessage = match serde_json::from_value(event.value) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(key = %event.key, error = %e, "malformed radio message dropped");
                        continue;
                    }
                };

                // Watch our own messages for in-place replies.
                if message.from_user_id == own_id {
                    let path = paths::message(&namespace, &event.key);
                    let mut values = store.watch(&path).await;
                    let tx = event_tx.clone();
                    let key = event.key.clone();
                    let mut shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let mut seen_reply = false;
                        loop {
                            let value = tokio::select! {
                                _ = shutdown.changed() => return,
                                value = values.recv() => match value {
                                    Some(Some(v)) => v,
                                    _ => return,
                                },
                            };
                            let Ok(updated) = serde_json::from_value::<RadioMessage>(value)
                            else {
                                continue;
                            };
                            if updated.reply.is_some() && !seen_reply {
                                seen_reply = true;
                                let _ = tx
                                    .send(MessageEvent::Replied {
                                        key: key.clone(),
                                        message: updated,
                                    })
                                    .await;
                            }
                        }
                    });
                }

                let _ = event_tx
                    .send(MessageEvent::New {
                        key: event.key,
                        message,
                    })
                    .await;
            }
            debug!("message board subscription ended");
        });

        if let Ok(mut forwarder) = self.forwarder.lock() {
            if let Some(old) = forwarder.replace(task) {
                old.abort();
            }
        }
        event_rx
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Ok(mut forwarder) = self.forwarder.lock() {
            if let Some(task) = forwarder.take() {
                task.abort();
            }
        }
    }
}

impl Drop for MessageBoard {
    fn drop(&mut self) {
        self.stop();
    }
}
