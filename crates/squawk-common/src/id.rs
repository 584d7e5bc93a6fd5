use serde::{Deserialize, Serialize};
use std::fmt;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Identifies one client session against the coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn new() -> Self {
        Self(new_id())
    }

    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_id_is_valid_uuid() {
        let id = new_id();
        let parsed = uuid::Uuid::parse_str(&id);
        assert!(parsed.is_ok());
        assert_eq!(parsed.unwrap().get_version_num(), 4);
    }

    #[test]
    fn new_id_is_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
    }

    #[test]
    fn client_id_display_matches_str() {
        let cid = ClientId::new();
        assert_eq!(cid.to_string(), cid.as_str());
    }

    #[test]
    fn client_id_equality() {
        let cid = ClientId::new();
        let cloned = cid.clone();
        assert_eq!(cid, cloned);
        assert_ne!(cid, ClientId::new());
    }

    #[test]
    fn client_id_serialization() {
        let cid = ClientId::new();
        let json = serde_json::to_string(&cid).unwrap();
        let back: ClientId = serde_json::from_str(&json).unwrap();
        assert_eq!(cid, back);
    }
}
