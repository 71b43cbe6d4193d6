//! Per-transport options.

use serde::Deserialize;

use crate::compression::Compressor;
use crate::core::{
    COMPRESSION_THRESHOLD, CONNECT_TIMEOUT_SECS, CompressionType, HTTP_REQUEST_TIMEOUT_SECS,
    MAX_RECONNECT_ATTEMPTS, PING_TIMEOUT_SECS,
};
use crate::crypto::CipherType;

/// Options of one attached transport.
///
/// Fields that do not apply to a protocol are ignored by it. Durations are
/// in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Time allowed for connect plus encryption handshake; 0 disables.
    pub connect_timeout: f32,

    /// Reconnect with exponential backoff after a failure.
    pub auto_reconnect: bool,

    /// Reconnect attempts before giving up.
    pub max_reconnects: u32,

    /// Stamp and check sequence numbers even without session reliability.
    pub sequence_validation: bool,

    /// Batch acknowledgments and send them every interval; 0 acks immediately.
    pub delayed_ack_interval: f32,

    /// Client ping interval (TCP only); 0 disables pinging.
    pub ping_interval: f32,

    /// Disconnect when a ping is not answered within this time.
    pub ping_timeout: f32,

    /// Preset cipher for channels without a handshake (UDP, HTTP).
    #[serde(skip)]
    pub encryption: Option<CipherType>,

    /// Use `https://` for the HTTP channel.
    pub use_https: bool,

    /// Per-request timeout of the HTTP channel.
    pub request_timeout: f32,

    /// Body compression; the server must be configured the same way.
    pub compression: CompressionType,

    /// Bodies shorter than this many bytes are sent uncompressed.
    pub compression_threshold: usize,

    /// zstd dictionary shared with the server.
    #[serde(skip)]
    pub compression_dictionary: Option<Vec<u8>>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT_SECS,
            auto_reconnect: false,
            max_reconnects: MAX_RECONNECT_ATTEMPTS,
            sequence_validation: false,
            delayed_ack_interval: 0.0,
            ping_interval: 0.0,
            ping_timeout: PING_TIMEOUT_SECS,
            encryption: None,
            use_https: false,
            request_timeout: HTTP_REQUEST_TIMEOUT_SECS,
            compression: CompressionType::None,
            compression_threshold: COMPRESSION_THRESHOLD,
            compression_dictionary: None,
        }
    }
}

impl TransportOptions {
    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, secs: f32) -> Self {
        self.connect_timeout = secs;
        self
    }

    /// Enable or disable auto reconnect.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the reconnect attempt limit.
    pub fn with_max_reconnects(mut self, attempts: u32) -> Self {
        self.max_reconnects = attempts;
        self
    }

    /// Enable or disable sequence validation.
    pub fn with_sequence_validation(mut self, enabled: bool) -> Self {
        self.sequence_validation = enabled;
        self
    }

    /// Set the delayed ack interval.
    pub fn with_delayed_ack(mut self, secs: f32) -> Self {
        self.delayed_ack_interval = secs;
        self
    }

    /// Enable pinging.
    pub fn with_ping(mut self, interval: f32, timeout: f32) -> Self {
        self.ping_interval = interval;
        self.ping_timeout = timeout;
        self
    }

    /// Preset the cipher.
    pub fn with_encryption(mut self, cipher: CipherType) -> Self {
        self.encryption = Some(cipher);
        self
    }

    /// Use HTTPS.
    pub fn with_https(mut self, enabled: bool) -> Self {
        self.use_https = enabled;
        self
    }

    /// Compress bodies of at least `threshold` bytes.
    pub fn with_compression(mut self, kind: CompressionType, threshold: usize) -> Self {
        self.compression = kind;
        self.compression_threshold = threshold;
        self
    }

    /// Prime zstd with a shared dictionary.
    pub fn with_compression_dictionary(mut self, dictionary: Vec<u8>) -> Self {
        self.compression_dictionary = Some(dictionary);
        self
    }

    /// Build the compressor these options describe.
    pub fn compressor(&self) -> Option<Compressor> {
        let compressor =
            Compressor::new(self.compression)?.with_threshold(self.compression_threshold);
        Some(match &self.compression_dictionary {
            Some(dictionary) => compressor.with_dictionary(dictionary),
            None => compressor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = TransportOptions::default();
        assert_eq!(opts.connect_timeout, 10.0);
        assert_eq!(opts.max_reconnects, 3);
        assert!(!opts.auto_reconnect);
        assert_eq!(opts.delayed_ack_interval, 0.0);
        assert_eq!(opts.compression, CompressionType::None);
        assert_eq!(opts.compression_threshold, 128);
        assert!(opts.compressor().is_none());
    }

    #[test]
    fn test_builder() {
        let opts = TransportOptions::default()
            .with_auto_reconnect(true)
            .with_delayed_ack(0.5)
            .with_encryption(CipherType::Ife2);
        assert!(opts.auto_reconnect);
        assert_eq!(opts.delayed_ack_interval, 0.5);
        assert_eq!(opts.encryption, Some(CipherType::Ife2));
    }

    #[test]
    fn test_compressor_from_options() {
        let opts = TransportOptions::default().with_compression(CompressionType::Deflate, 256);
        let compressor = opts.compressor().unwrap();
        assert_eq!(compressor.kind(), CompressionType::Deflate);
        assert_eq!(compressor.threshold(), 256);

        let opts: TransportOptions = serde_json::from_str(r#"{"compression": "zstd"}"#).unwrap();
        assert_eq!(opts.compressor().map(|c| c.kind()), Some(CompressionType::Zstd));
    }

    #[test]
    fn test_deserialize_partial() {
        let opts: TransportOptions =
            serde_json::from_str(r#"{"auto_reconnect": true, "ping_interval": 3.0}"#).unwrap();
        assert!(opts.auto_reconnect);
        assert_eq!(opts.ping_interval, 3.0);
        assert_eq!(opts.connect_timeout, 10.0);
    }
}
