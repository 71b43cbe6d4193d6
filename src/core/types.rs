//! Small shared enums.

use std::fmt;

use serde::Deserialize;

/// Transport protocol kind.
///
/// `Tcp` is the stream variant, `Udp` the datagram variant and `Http` the
/// request/response variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Ordered, reliable byte stream.
    Tcp,
    /// Unordered, unreliable datagrams.
    Udp,
    /// One-shot request/response exchanges.
    Http,
}

impl Protocol {
    /// All protocols, most reliable first.
    pub const BY_RELIABILITY: [Protocol; 3] = [Protocol::Tcp, Protocol::Http, Protocol::Udp];

    /// Short display name.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Http => "HTTP",
        }
    }

    /// Whether the protocol delivers bytes in order without loss.
    pub fn is_reliable(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Http)
    }

    /// Parse the numeric code used by redirect messages (1 TCP, 2 UDP, 3 HTTP).
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Protocol::Tcp),
            2 => Some(Protocol::Udp),
            3 => Some(Protocol::Http),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message body encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// JSON objects; reserved fields are injected as top-level members.
    #[default]
    Json,
}

/// Body compression of a transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    /// Bodies are sent as they are.
    #[default]
    None,
    /// Zstandard, optionally with a shared dictionary.
    Zstd,
    /// Raw DEFLATE.
    Deflate,
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompressionType::None => "none",
            CompressionType::Zstd => "zstd",
            CompressionType::Deflate => "deflate",
        })
    }
}
