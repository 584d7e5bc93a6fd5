//! Radio deployment configuration.
//!
//! All sections default to the values the deployed store layout expects
//! (4 channels, 16 kHz, 200 ms chunk cadence, 30 s heartbeat), so a
//! partial TOML file works out of the box.

use serde::Deserialize;

use squawk_common::ConfigError;

/// One provisioned channel. Channels are static; only their sub-records
/// (claim, audio log) churn.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChannelDef {
    pub id: String,
    pub label: String,
}

/// Audible feedback around transmissions. The source deployments disagree
/// on this, so it is a knob rather than fixed behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackPolicy {
    #[default]
    None,
    /// Short local confirmation beep after a release.
    RogerBeep,
    /// Over-the-air two-tone dispatch paging is permitted.
    PagingTone,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Namespace prefix for every store path.
    pub namespace: String,
    /// Shared room passphrase checked at login.
    pub passphrase: String,
    pub channels: Vec<ChannelDef>,
    /// Target PCM rate for the wire format.
    pub sample_rate: u32,
    /// Capture flush cadence in milliseconds.
    pub chunk_interval_ms: u64,
    /// Presence liveness write interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// How long Busy / TX-error statuses stay on screen before
    /// auto-clearing, in milliseconds.
    pub status_clear_ms: u64,
    /// Playback drift bound in seconds; a chunk scheduled further ahead
    /// than this resets to "now".
    pub playback_lookahead_secs: f64,
    pub feedback: FeedbackPolicy,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            namespace: "cadradio".into(),
            passphrase: String::new(),
            channels: vec![
                ChannelDef { id: "main".into(), label: "CH1".into() },
                ChannelDef { id: "channel2".into(), label: "CH2".into() },
                ChannelDef { id: "channel3".into(), label: "CH3".into() },
                ChannelDef { id: "channel4".into(), label: "CH4".into() },
            ],
            sample_rate: 16_000,
            chunk_interval_ms: 200,
            heartbeat_interval_secs: 30,
            status_clear_ms: 1_500,
            playback_lookahead_secs: 1.0,
            feedback: FeedbackPolicy::None,
        }
    }
}

impl RadioConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RadioConfig =
            toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.to_path_buf()))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::ValidationError("no channels defined".into()));
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::ValidationError("sample_rate must be > 0".into()));
        }
        if self.chunk_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "chunk_interval_ms must be > 0".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for ch in &self.channels {
            if !seen.insert(ch.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate channel id: {}",
                    ch.id
                )));
            }
        }
        Ok(())
    }

    pub fn channel(&self, id: &str) -> Option<&ChannelDef> {
        self.channels.iter().find(|c| c.id == id)
    }

    pub fn label<'a>(&'a self, id: &'a str) -> &'a str {
        self.channel(id).map(|c| c.label.as_str()).unwrap_or(id)
    }
}
