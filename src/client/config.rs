//! Session configuration.

use serde::Deserialize;

use crate::core::{
    Encoding, Protocol, REDIRECT_TIMEOUT_SECS, SESSION_TIMEOUT_SECS, SessionError, SessionResult,
    WAIT_FOR_STOP_TIMEOUT_SECS,
};

/// Session configuration.
///
/// Durations are in seconds; a zero timeout disables the check.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Server host name or address.
    pub host: String,

    /// Sequence, ack and replay for reliable protocols.
    pub reliability: bool,

    /// A session id unused for longer than this is dropped before the next send.
    pub session_timeout: f32,

    /// Stop the session when nothing arrives for this long.
    pub response_timeout: f32,

    /// Time allowed for a redirect to reach the new server.
    pub redirect_timeout: f32,

    /// Protocol used when a send does not name one; the most reliable
    /// attached protocol when unset.
    pub default_protocol: Option<Protocol>,

    /// Body encoding.
    pub encoding: Encoding,

    /// Carry unsent and unacknowledged messages over a redirect.
    pub use_redirect_queue: bool,

    /// Upper bound on how long a graceful stop waits for unsent data.
    pub wait_for_stop_timeout: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            reliability: false,
            session_timeout: SESSION_TIMEOUT_SECS,
            response_timeout: 0.0,
            redirect_timeout: REDIRECT_TIMEOUT_SECS,
            default_protocol: None,
            encoding: Encoding::Json,
            use_redirect_queue: true,
            wait_for_stop_timeout: WAIT_FOR_STOP_TIMEOUT_SECS,
        }
    }
}

impl SessionConfig {
    /// Start building a configuration for `host`.
    pub fn builder(host: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder::new(host)
    }

    /// Parse a JSON configuration; missing fields take their defaults.
    pub fn from_json(json: &str) -> SessionResult<Self> {
        serde_json::from_str(json).map_err(|e| SessionError::Config(e.to_string()))
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Create a builder for `host`.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            config: SessionConfig {
                host: host.into(),
                ..SessionConfig::default()
            },
        }
    }

    /// Enable or disable session reliability.
    pub fn reliability(mut self, enabled: bool) -> Self {
        self.config.reliability = enabled;
        self
    }

    /// Set the session id staleness timeout.
    pub fn session_timeout(mut self, secs: f32) -> Self {
        self.config.session_timeout = secs;
        self
    }

    /// Set the response timeout.
    pub fn response_timeout(mut self, secs: f32) -> Self {
        self.config.response_timeout = secs;
        self
    }

    /// Set the redirect timeout.
    pub fn redirect_timeout(mut self, secs: f32) -> Self {
        self.config.redirect_timeout = secs;
        self
    }

    /// Set the default protocol.
    pub fn default_protocol(mut self, protocol: Protocol) -> Self {
        self.config.default_protocol = Some(protocol);
        self
    }

    /// Enable or disable the redirect queue.
    pub fn use_redirect_queue(mut self, enabled: bool) -> Self {
        self.config.use_redirect_queue = enabled;
        self
    }

    /// Set the graceful stop timeout.
    pub fn wait_for_stop_timeout(mut self, secs: f32) -> Self {
        self.config.wait_for_stop_timeout = secs;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> SessionConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = SessionConfig::builder("game.example.com")
            .reliability(true)
            .response_timeout(30.0)
            .default_protocol(Protocol::Udp)
            .build();
        assert_eq!(config.host, "game.example.com");
        assert!(config.reliability);
        assert_eq!(config.response_timeout, 30.0);
        assert_eq!(config.default_protocol, Some(Protocol::Udp));
        assert_eq!(config.session_timeout, 3600.0);
    }

    #[test]
    fn test_from_json() {
        let config = SessionConfig::from_json(
            r#"{"host": "10.0.0.7", "reliability": true, "default_protocol": "tcp"}"#,
        )
        .unwrap();
        assert_eq!(config.host, "10.0.0.7");
        assert!(config.reliability);
        assert_eq!(config.default_protocol, Some(Protocol::Tcp));
        assert!(config.use_redirect_queue);
        assert_eq!(config.redirect_timeout, 10.0);
    }

    #[test]
    fn test_from_json_rejects_bad_input() {
        let err = SessionConfig::from_json(r#"{"reliability": "yes"}"#).unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }
}
