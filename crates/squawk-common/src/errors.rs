use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store transaction failed: {0}")]
    Transaction(String),

    #[error("store write failed: {0}")]
    Write(String),

    #[error("store disconnected")]
    Disconnected,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ParseError(String),

    #[error("config validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    /// The channel's speaker slot is held by another client.
    #[error("channel busy: {0}")]
    Busy(String),

    /// Microphone access was refused. Requires a fresh user action.
    #[error("microphone denied")]
    MicDenied,

    /// Not logged in, or connectivity has not been established.
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("bad room passphrase")]
    BadPassphrase,

    /// A transmit attempt while already transmitting.
    #[error("already transmitting on {0}")]
    AlreadyTransmitting(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display() {
        let err = StoreError::Transaction("cas aborted".into());
        assert_eq!(err.to_string(), "store transaction failed: cas aborted");

        let err = StoreError::Disconnected;
        assert_eq!(err.to_string(), "store disconnected");
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::FileNotFound(PathBuf::from("/tmp/missing.toml"));
        assert_eq!(err.to_string(), "config file not found: /tmp/missing.toml");

        let err = ConfigError::ValidationError("no channels defined".into());
        assert_eq!(
            err.to_string(),
            "config validation error: no channels defined"
        );
    }

    #[test]
    fn radio_error_from_store() {
        let store_err = StoreError::Write("permission denied".into());
        let radio_err: RadioError = store_err.into();
        assert!(matches!(radio_err, RadioError::Store(_)));
        assert!(radio_err.to_string().contains("permission denied"));
    }

    #[test]
    fn radio_error_from_config() {
        let config_err = ConfigError::ParseError("bad toml".into());
        let radio_err: RadioError = config_err.into();
        assert!(matches!(radio_err, RadioError::Config(_)));
        assert!(radio_err.to_string().contains("bad toml"));
    }

    #[test]
    fn radio_error_variants() {
        let err = RadioError::Busy("main".into());
        assert_eq!(err.to_string(), "channel busy: main");

        let err = RadioError::MicDenied;
        assert_eq!(err.to_string(), "microphone denied");

        let err = RadioError::NotReady("not logged in".into());
        assert_eq!(err.to_string(), "not ready: not logged in");

        let err = RadioError::AlreadyTransmitting("channel2".into());
        assert_eq!(err.to_string(), "already transmitting on channel2");
    }
}
