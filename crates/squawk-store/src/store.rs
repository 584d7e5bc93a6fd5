//! The `CoordinationStore` capability trait.
//!
//! Logical paths are `/`-separated strings under a deployment namespace
//! (e.g. `cadnet/channels/main/activeSpeaker`). A path either holds one
//! JSON value or serves as the parent of an append log whose children live
//! at `path/{key}` with lexically ordered generated keys.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use squawk_common::StoreError;

/// Decision returned by a transaction closure.
#[derive(Debug, Clone)]
pub enum TxnDecision {
    /// Replace the value (`None` deletes the path). Applied atomically.
    Write(Option<Value>),
    /// Leave the path untouched and report `committed = false`.
    Abort,
}

/// Result of a conditional update.
#[derive(Debug, Clone)]
pub struct TxnOutcome {
    pub committed: bool,
    /// The value at the path after the transaction resolved.
    pub value: Option<Value>,
}

/// A mutation the store applies server-side if this client's connection
/// drops without clean teardown. Registrations survive exactly one
/// connection lifetime: once fired (or once the connection cycles) they are
/// forgotten and must be re-registered.
#[derive(Debug, Clone)]
pub enum DisconnectAction {
    /// Remove the path entirely.
    Remove,
    /// Merge the given object into the value at the path.
    Update(Value),
}

/// One child arriving on a watched append log.
#[derive(Debug, Clone)]
pub struct AppendEvent {
    pub key: String,
    pub value: Value,
    /// True for children that already existed when the watch was
    /// established. Consumers that must not act on stale data skip these.
    pub prior: bool,
}

/// The server-assigned timestamp sentinel. Stores resolve this marker to
/// epoch milliseconds at write time.
pub fn server_timestamp() -> Value {
    json!({ ".sv": "timestamp" })
}

/// Capability trait over the remote transactional store.
///
/// All methods are cancel-safe; watch methods return immediately with a
/// receiver fed by the store's own tasks.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read the value at a path.
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Replace the value at a path.
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Merge an object's fields into the value at a path.
    async fn update(&self, path: &str, patch: Value) -> Result<(), StoreError>;

    /// Remove the path and everything beneath it.
    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Atomic conditional update. The closure sees the current value and
    /// returns a [`TxnDecision`]; the store applies a `Write` only if the
    /// value is still the one the closure saw.
    async fn transaction(
        &self,
        path: &str,
        f: &(dyn for<'a> Fn(Option<&'a Value>) -> TxnDecision + Send + Sync),
    ) -> Result<TxnOutcome, StoreError>;

    /// Append a record under a path with a generated, lexically increasing
    /// key. Returns the key.
    async fn append(&self, path: &str, value: Value) -> Result<String, StoreError>;

    /// Watch a single value path. The current value is delivered first,
    /// then every subsequent change (`None` on removal).
    async fn watch(&self, path: &str) -> mpsc::Receiver<Option<Value>>;

    /// Watch an append log. Children existing at subscribe time are
    /// replayed flagged `prior = true`, then live appends follow.
    async fn watch_appends(&self, path: &str) -> mpsc::Receiver<AppendEvent>;

    /// Register a mutation to apply if this connection drops.
    async fn register_disconnect(
        &self,
        path: &str,
        action: DisconnectAction,
    ) -> Result<(), StoreError>;

    /// Cancel a previously registered disconnect action for a path.
    async fn cancel_disconnect(&self, path: &str) -> Result<(), StoreError>;

    /// Connectivity signal. `true` while the store link is established.
    fn connectivity(&self) -> watch::Receiver<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_timestamp_sentinel_shape() {
        let sv = server_timestamp();
        assert_eq!(sv.get(".sv").and_then(|v| v.as_str()), Some("timestamp"));
    }
}
