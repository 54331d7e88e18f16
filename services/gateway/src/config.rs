//! Adapter configuration.
//!
//! Holders never cache a copy: the dispatcher and the HTTP handlers read
//! through [`SharedConfig`] on every use, so runtime updates (e.g. from an
//! admin surface) are observed without a restart.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Default window a correlation slot waits for a client response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SseConfig {
    /// When set, every command and stream connect must present this key.
    pub access_key: Option<String>,
    /// Correlation-slot timeout for send-with-ack and info requests.
    pub response_timeout: Duration,
    /// Fire-and-forget mode: do not wait for client acknowledgements.
    pub ignore_response: bool,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            access_key: None,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            ignore_response: false,
        }
    }
}

impl SseConfig {
    /// Whether a presented key satisfies the configured gate.
    ///
    /// An unset `access_key` disables gating entirely.
    pub fn key_matches(&self, presented: Option<&str>) -> bool {
        match &self.access_key {
            None => true,
            Some(expected) => presented == Some(expected.as_str()),
        }
    }
}

pub type SharedConfig = Arc<RwLock<SseConfig>>;

pub fn shared(config: SseConfig) -> SharedConfig {
    Arc::new(RwLock::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_key_admits_everything() {
        let config = SseConfig::default();
        assert!(config.key_matches(None));
        assert!(config.key_matches(Some("anything")));
    }

    #[test]
    fn set_key_requires_exact_match() {
        let config = SseConfig {
            access_key: Some("s3cret".to_owned()),
            ..SseConfig::default()
        };
        assert!(config.key_matches(Some("s3cret")));
        assert!(!config.key_matches(Some("wrong")));
        assert!(!config.key_matches(None));
    }
}
