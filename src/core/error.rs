//! Error types for the tickwire engine.

use std::io;

use thiserror::Error;

use super::types::Protocol;

/// Errors raised while decoding a frame header.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A header line without the `:` delimiter, or not valid ASCII/UTF-8.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// `VER` or `LEN` is absent.
    #[error("missing header field: {0}")]
    MissingField(&'static str),

    /// `VER` differs from the version this codec implements.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),

    /// `LEN` is not a decimal byte count.
    #[error("invalid body length: {0:?}")]
    InvalidLength(String),
}

/// Errors in the encryption layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncryptionError {
    /// Cipher code we do not implement, or one the peer never offered.
    #[error("unknown cipher: {0}")]
    UnknownCipher(String),

    /// A handshake round was rejected.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Handshake input for a cipher that is not handshaking.
    #[error("unexpected handshake message for {0}")]
    UnexpectedHandshake(&'static str),

    /// The selected cipher has not finished its handshake.
    #[error("cipher {0} is not established")]
    NotEstablished(&'static str),

    /// Encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// Decryption failed (corrupt body, bad tag or bad header).
    #[error("decryption failed")]
    DecryptionFailed,

    /// The `ENC` header disagrees with the negotiated cipher set.
    #[error("encryption header mismatch: {0}")]
    MissingHeader(String),
}

/// Errors in the compression layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompressionError {
    /// Compressing an outgoing body failed.
    #[error("compression failed: {0}")]
    CompressionFailed(String),

    /// The body is not valid compressed data.
    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    /// The decompressed body does not have the announced length.
    #[error("decompressed {actual} bytes, expected {expected}")]
    SizeMismatch {
        /// Length announced in the `C` header.
        expected: usize,
        /// Length actually produced.
        actual: usize,
    },

    /// The announced length is above the safety limit.
    #[error("uncompressed size exceeded limit: {size} > {limit}")]
    SizeExceeded {
        /// Announced size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// The `C` header is not a decimal byte count.
    #[error("invalid uncompressed length: {0:?}")]
    InvalidLength(String),

    /// A compressed body arrived on a transport without compression.
    #[error("received a compressed message but compression is not configured")]
    NotConfigured,
}

/// Coarse error code kept per protocol as the "last error".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No error recorded.
    #[default]
    None,
    /// Socket connect or request failed.
    ConnectFailure,
    /// Connect plus handshake did not finish in time.
    ConnectTimeout,
    /// A frame could not be decoded.
    DecodeError,
    /// Cipher negotiation or crypto failure.
    EncryptionFailure,
    /// The peer closed the connection.
    PeerClosed,
    /// Sequence gap or invalid order.
    SequenceViolation,
    /// No inbound traffic for too long.
    ResponseTimeout,
    /// Redirect to another server failed.
    RedirectFailure,
}

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not connect, or the request could not be issued.
    #[error("connect failed: {0}")]
    ConnectFailure(String),

    /// Connect plus handshake exceeded the configured timeout.
    #[error("connection timed out")]
    ConnectTimeout,

    /// Frame decoding error.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Encryption error.
    #[error("encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    /// Compression error.
    #[error("compression error: {0}")]
    Compression(#[from] CompressionError),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    PeerClosed,

    /// Received sequence does not follow the last accepted one.
    #[error("sequence violation: expected {expected}, received {received}")]
    SequenceViolation {
        /// Expected sequence.
        expected: u32,
        /// Received sequence.
        received: u32,
    },

    /// Nothing was received for longer than the response timeout.
    #[error("response timed out")]
    ResponseTimeout,

    /// Redirect failed.
    #[error("redirect failed: {0}")]
    RedirectFailure(String),

    /// I/O error (socket operations).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// HTTP status or client error.
    #[error("http error: {0}")]
    Http(String),

    /// A datagram frame larger than the unit buffer.
    #[error("message too large: {size} bytes (limit {limit})")]
    MessageTooLarge {
        /// Framed size.
        size: usize,
        /// Limit.
        limit: usize,
    },

    /// Payload received before the encryption handshake completed.
    #[error("payload received during encryption handshake")]
    UnexpectedPayload,

    /// The channel is not started.
    #[error("transport not connected")]
    NotConnected,
}

impl TransportError {
    /// Error code recorded as the protocol's last error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::ConnectFailure(_) | TransportError::Http(_) => ErrorKind::ConnectFailure,
            TransportError::ConnectTimeout => ErrorKind::ConnectTimeout,
            TransportError::Decode(_) | TransportError::Compression(_) => ErrorKind::DecodeError,
            TransportError::Encryption(_) | TransportError::UnexpectedPayload => {
                ErrorKind::EncryptionFailure
            }
            TransportError::PeerClosed | TransportError::Io(_) | TransportError::NotConnected => {
                ErrorKind::PeerClosed
            }
            TransportError::SequenceViolation { .. } => ErrorKind::SequenceViolation,
            TransportError::ResponseTimeout => ErrorKind::ResponseTimeout,
            TransportError::RedirectFailure(_) => ErrorKind::RedirectFailure,
            TransportError::MessageTooLarge { .. } => ErrorKind::None,
        }
    }

    /// Check if this error closes the channel that raised it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::MessageTooLarge { .. })
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Session-level errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No transport attached for the protocol.
    #[error("no {0} transport")]
    NoTransport(Protocol),

    /// The target transport is neither connected nor queueing.
    #[error("{0} transport is not connected")]
    NotConnected(Protocol),

    /// The body is not a JSON object or a reserved field is malformed.
    #[error("envelope error: {0}")]
    Envelope(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
