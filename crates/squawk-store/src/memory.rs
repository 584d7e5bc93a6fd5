//! In-process implementation of [`CoordinationStore`].
//!
//! `MemoryStore` keeps the full path tree in one flat map and fans events
//! out to watcher channels. It honors the same contract a remote backend
//! would: server-timestamp sentinel resolution, lexically ordered append
//! keys, backlog-flagged append replay, and one-shot disconnect actions
//! fired when the simulated connection drops.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

use squawk_common::StoreError;

use crate::store::{
    AppendEvent, CoordinationStore, DisconnectAction, TxnDecision, TxnOutcome,
};

const VALUE_CHANNEL_CAPACITY: usize = 64;
const APPEND_CHANNEL_CAPACITY: usize = 256;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Replace every `{".sv": "timestamp"}` marker in the value with the
/// current epoch milliseconds.
fn resolve_sentinels(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 && map.get(".sv").and_then(|v| v.as_str()) == Some("timestamp") {
                *value = json!(now_millis());
                return;
            }
            for v in map.values_mut() {
                resolve_sentinels(v);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                resolve_sentinels(v);
            }
        }
        _ => {}
    }
}

struct Inner {
    values: BTreeMap<String, Value>,
    value_watchers: HashMap<String, Vec<mpsc::Sender<Option<Value>>>>,
    append_watchers: HashMap<String, Vec<mpsc::Sender<AppendEvent>>>,
    disconnect_actions: HashMap<String, DisconnectAction>,
    key_counter: u64,
}

/// Shared in-process store. Cloning yields another handle to the same tree,
/// which is how multiple sessions share one medium in tests and the demo.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    connected: Arc<watch::Sender<bool>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (connected, _) = watch::channel(true);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                values: BTreeMap::new(),
                value_watchers: HashMap::new(),
                append_watchers: HashMap::new(),
                disconnect_actions: HashMap::new(),
                key_counter: 0,
            })),
            connected: Arc::new(connected),
        }
    }

    /// Simulate the connection dropping or coming back.
    ///
    /// Dropping fires every registered disconnect action exactly once and
    /// forgets the registrations, matching the single-connection lifetime
    /// of the real capability.
    pub async fn set_connected(&self, up: bool) {
        if up {
            let _ = self.connected.send(true);
            return;
        }

        let (notifications, fired) = {
            let mut inner = self.inner.lock().await;
            let actions: Vec<(String, DisconnectAction)> =
                inner.disconnect_actions.drain().collect();
            let fired = actions.len();
            let mut notifications = Vec::new();
            for (path, action) in actions {
                match action {
                    DisconnectAction::Remove => {
                        remove_subtree(&mut inner, &path, &mut notifications);
                    }
                    DisconnectAction::Update(patch) => {
                        apply_update(&mut inner, &path, patch, &mut notifications);
                    }
                }
            }
            (notifications, fired)
        };
        debug!(fired, "connection dropped, disconnect actions applied");
        self.deliver_values(notifications).await;
        let _ = self.connected.send(false);
    }

    /// Snapshot of every stored path, for test assertions.
    pub async fn dump(&self) -> BTreeMap<String, Value> {
        self.inner.lock().await.values.clone()
    }

    async fn deliver_values(&self, notifications: Vec<(String, Option<Value>)>) {
        for (path, value) in notifications {
            let senders = {
                let mut inner = self.inner.lock().await;
                match inner.value_watchers.get_mut(&path) {
                    Some(list) => {
                        list.retain(|tx| !tx.is_closed());
                        list.clone()
                    }
                    None => continue,
                }
            };
            for tx in senders {
                let _ = tx.send(value.clone()).await;
            }
        }
    }

    async fn deliver_append(&self, path: &str, event: AppendEvent) {
        let senders = {
            let mut inner = self.inner.lock().await;
            match inner.append_watchers.get_mut(path) {
                Some(list) => {
                    list.retain(|tx| !tx.is_closed());
                    list.clone()
                }
                None => return,
            }
        };
        for tx in senders {
            let _ = tx.send(event.clone()).await;
        }
    }
}

/// Remove a path and all children, recording value notifications for every
/// watched path that vanished.
fn remove_subtree(inner: &mut Inner, path: &str, notifications: &mut Vec<(String, Option<Value>)>) {
    let prefix = format!("{path}/");
    let gone: Vec<String> = inner
        .values
        .keys()
        .filter(|k| *k == path || k.starts_with(&prefix))
        .cloned()
        .collect();
    for key in &gone {
        inner.values.remove(key);
    }
    // Watchers on the exact path always learn about the removal, even if
    // the path held nothing.
    notifications.push((path.to_string(), None));
    for key in gone {
        if key != path {
            notifications.push((key, None));
        }
    }
}

fn apply_set(inner: &mut Inner, path: &str, mut value: Value, notifications: &mut Vec<(String, Option<Value>)>) {
    resolve_sentinels(&mut value);
    inner.values.insert(path.to_string(), value.clone());
    notifications.push((path.to_string(), Some(value)));
}

fn apply_update(inner: &mut Inner, path: &str, mut patch: Value, notifications: &mut Vec<(String, Option<Value>)>) {
    resolve_sentinels(&mut patch);
    let merged = match (inner.values.get(path), patch) {
        (Some(Value::Object(existing)), Value::Object(fields)) => {
            let mut out = existing.clone();
            for (k, v) in fields {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        (_, patch) => patch,
    };
    inner.values.insert(path.to_string(), merged.clone());
    notifications.push((path.to_string(), Some(merged)));
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.inner.lock().await.values.get(path).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            apply_set(&mut inner, path, value, &mut notifications);
        }
        self.deliver_values(notifications).await;
        Ok(())
    }

    async fn update(&self, path: &str, patch: Value) -> Result<(), StoreError> {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            apply_update(&mut inner, path, patch, &mut notifications);
        }
        self.deliver_values(notifications).await;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let mut notifications = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            remove_subtree(&mut inner, path, &mut notifications);
        }
        self.deliver_values(notifications).await;
        Ok(())
    }

    async fn transaction(
        &self,
        path: &str,
        f: &(dyn for<'a> Fn(Option<&'a Value>) -> TxnDecision + Send + Sync),
    ) -> Result<TxnOutcome, StoreError> {
        let (outcome, notifications) = {
            let mut inner = self.inner.lock().await;
            let current = inner.values.get(path).cloned();
            match f(current.as_ref()) {
                TxnDecision::Abort => (
                    TxnOutcome {
                        committed: false,
                        value: current,
                    },
                    Vec::new(),
                ),
                TxnDecision::Write(None) => {
                    let mut notifications = Vec::new();
                    remove_subtree(&mut inner, path, &mut notifications);
                    (
                        TxnOutcome {
                            committed: true,
                            value: None,
                        },
                        notifications,
                    )
                }
                TxnDecision::Write(Some(value)) => {
                    let mut notifications = Vec::new();
                    apply_set(&mut inner, path, value, &mut notifications);
                    let value = inner.values.get(path).cloned();
                    (
                        TxnOutcome {
                            committed: true,
                            value,
                        },
                        notifications,
                    )
                }
            }
        };
        self.deliver_values(notifications).await;
        Ok(outcome)
    }

    async fn append(&self, path: &str, value: Value) -> Result<String, StoreError> {
        let (key, event) = {
            let mut inner = self.inner.lock().await;
            inner.key_counter += 1;
            // Zero-padded so lexical order matches insertion order.
            let key = format!("k{:012}", inner.key_counter);
            let mut value = value;
            resolve_sentinels(&mut value);
            inner
                .values
                .insert(format!("{path}/{key}"), value.clone());
            (
                key.clone(),
                AppendEvent {
                    key,
                    value,
                    prior: false,
                },
            )
        };
        self.deliver_append(path, event).await;
        Ok(key)
    }

    async fn watch(&self, path: &str) -> mpsc::Receiver<Option<Value>> {
        let (tx, rx) = mpsc::channel(VALUE_CHANNEL_CAPACITY);
        let mut inner = self.inner.lock().await;
        let current = inner.values.get(path).cloned();
        // The snapshot goes into the channel before the registration lock
        // drops, so a concurrent write cannot deliver ahead of it. A fresh
        // channel always has room.
        let _ = tx.try_send(current);
        inner
            .value_watchers
            .entry(path.to_string())
            .or_default()
            .push(tx);
        rx
    }

    async fn watch_appends(&self, path: &str) -> mpsc::Receiver<AppendEvent> {
        let (tx, rx) = mpsc::channel(APPEND_CHANNEL_CAPACITY);
        let backlog = {
            let mut inner = self.inner.lock().await;
            let prefix = format!("{path}/");
            let backlog: Vec<AppendEvent> = inner
                .values
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, v)| AppendEvent {
                    key: k[prefix.len()..].to_string(),
                    value: v.clone(),
                    prior: true,
                })
                .collect();
            inner
                .append_watchers
                .entry(path.to_string())
                .or_default()
                .push(tx.clone());
            backlog
        };
        for event in backlog {
            let _ = tx.send(event).await;
        }
        rx
    }

    async fn register_disconnect(
        &self,
        path: &str,
        action: DisconnectAction,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .disconnect_actions
            .insert(path.to_string(), action);
        Ok(())
    }

    async fn cancel_disconnect(&self, path: &str) -> Result<(), StoreError> {
        self.inner.lock().await.disconnect_actions.remove(path);
        Ok(())
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}
