//! Wire records and logical store paths.
//!
//! Field names match the deployed store layout, which predates this
//! implementation — hence the short keys on [`AudioChunk`] (`pcm`, `sid`,
//! `t`, `n`) and the camelCase on the presence and claim records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Exclusive transmit ownership of a channel.
///
/// At most one non-null claim exists per channel at any committed point.
/// Only the client that wrote it through a committed conditional update
/// owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerClaim {
    pub user_id: String,
    pub display_name: String,
    /// Server-assigned epoch millis (a sentinel until resolved).
    pub timestamp: Value,
}

/// One fixed-interval slice of encoded audio appended to a channel log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioChunk {
    /// Base64 segments joined with [`crate::codec::CHUNK_DELIMITER`].
    pub pcm: String,
    /// Sender id; receivers drop their own chunks.
    pub sid: String,
    /// Server-assigned timestamp.
    pub t: Value,
    /// Strictly increasing per-transmission sequence number.
    pub n: u64,
}

/// Per-client presence record, owned exclusively by that client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub display_name: String,
    pub online: bool,
    pub last_seen: Value,
    pub heartbeat: Value,
}

/// Store-and-forward text message with an in-place reply field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RadioMessage {
    pub from: String,
    pub from_user_id: String,
    pub text: String,
    pub timestamp: Value,
    #[serde(default)]
    pub reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_timestamp: Option<Value>,
}

/// Logical path layout under a deployment namespace.
pub mod paths {
    pub fn presence(ns: &str, user_id: &str) -> String {
        format!("{ns}/users/{user_id}")
    }

    pub fn speaker(ns: &str, channel: &str) -> String {
        format!("{ns}/channels/{channel}/activeSpeaker")
    }

    pub fn stream(ns: &str, channel: &str) -> String {
        format!("{ns}/channels/{channel}/audioStream")
    }

    pub fn messages(ns: &str) -> String {
        format!("{ns}/radioMessages")
    }

    pub fn message(ns: &str, key: &str) -> String {
        format!("{ns}/radioMessages/{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn claim_uses_store_field_names() {
        let claim = SpeakerClaim {
            user_id: "u1".into(),
            display_name: "ALPHA".into(),
            timestamp: json!(123),
        };
        let v = serde_json::to_value(&claim).unwrap();
        assert_eq!(v["userId"], json!("u1"));
        assert_eq!(v["displayName"], json!("ALPHA"));
        assert_eq!(v["timestamp"], json!(123));
    }

    #[test]
    fn chunk_round_trips() {
        let chunk = AudioChunk {
            pcm: "AAAA|BBBB".into(),
            sid: "u1".into(),
            t: json!(1),
            n: 7,
        };
        let v = serde_json::to_value(&chunk).unwrap();
        assert_eq!(v["sid"], json!("u1"));
        assert_eq!(v["n"], json!(7));
        let back: AudioChunk = serde_json::from_value(v).unwrap();
        assert_eq!(back.pcm, chunk.pcm);
        assert_eq!(back.n, 7);
    }

    #[test]
    fn message_reply_fields_are_optional() {
        let v = json!({
            "from": "ALPHA",
            "fromUserId": "u1",
            "text": "status check",
            "timestamp": 5
        });
        let msg: RadioMessage = serde_json::from_value(v).unwrap();
        assert!(msg.reply.is_none());
        assert!(msg.reply_from.is_none());
    }

    #[test]
    fn path_layout() {
        assert_eq!(paths::speaker("cadnet", "main"), "cadnet/channels/main/activeSpeaker");
        assert_eq!(paths::stream("cadnet", "main"), "cadnet/channels/main/audioStream");
        assert_eq!(paths::presence("cadnet", "u1"), "cadnet/users/u1");
        assert_eq!(paths::messages("cadnet"), "cadnet/radioMessages");
    }
}
