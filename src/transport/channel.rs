//! The transport abstraction the session drives.

use std::fmt;

use super::frame::HeaderFields;
use crate::core::{ErrorKind, Protocol, TransportError, TransportResult};
use crate::crypto::CipherType;

/// Lifecycle state of a transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    /// Not connected.
    #[default]
    Disconnected,
    /// Socket connect in progress.
    Connecting,
    /// Connected; waiting for every cipher to be established.
    EncryptionHandshaking,
    /// Payload may flow.
    Connected,
}

impl ChannelState {
    /// Connect or handshake in progress.
    pub fn is_connecting(self) -> bool {
        matches!(self, Self::Connecting | Self::EncryptionHandshaking)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::EncryptionHandshaking => "encryption-handshaking",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// An outgoing message as handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    /// Message type, used for logging only.
    pub msg_type: String,
    /// Encoded envelope.
    pub body: Vec<u8>,
    /// Cipher override; the negotiated default when `None`.
    pub encryption: Option<CipherType>,
}

impl WireMessage {
    /// A message using the default cipher.
    pub fn new(msg_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            msg_type: msg_type.into(),
            body,
            encryption: None,
        }
    }

    /// Override the cipher for this message.
    pub fn with_encryption(mut self, cipher: CipherType) -> Self {
        self.encryption = Some(cipher);
        self
    }
}

type StartedFn = Box<dyn Fn(Protocol) + Send + Sync>;
type ReceivedFn = Box<dyn Fn(Protocol, HeaderFields, Vec<u8>) + Send + Sync>;
type ClosedFn = Box<dyn Fn(Protocol, Option<TransportError>) + Send + Sync>;

/// Callbacks a transport reports through.
///
/// Drivers invoke them from their I/O tasks, never while holding their own
/// lock. `on_closed` is not invoked for a local [`Transport::stop`].
pub struct ChannelHandlers {
    pub(crate) on_started: StartedFn,
    pub(crate) on_received: ReceivedFn,
    pub(crate) on_closed: ClosedFn,
}

impl ChannelHandlers {
    /// Build a handler set.
    pub fn new(
        on_started: impl Fn(Protocol) + Send + Sync + 'static,
        on_received: impl Fn(Protocol, HeaderFields, Vec<u8>) + Send + Sync + 'static,
        on_closed: impl Fn(Protocol, Option<TransportError>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_started: Box::new(on_started),
            on_received: Box::new(on_received),
            on_closed: Box::new(on_closed),
        }
    }

    /// Handlers that drop everything.
    pub fn noop() -> Self {
        Self::new(|_| {}, |_, _, _| {}, |_, _| {})
    }
}

impl fmt::Debug for ChannelHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandlers").finish_non_exhaustive()
    }
}

/// A connection to the server over one protocol.
///
/// Implemented by the stream, datagram and HTTP channels, and by test
/// doubles. All methods return immediately; I/O completes on background
/// tasks and is reported through [`ChannelHandlers`].
pub trait Transport: Send {
    /// The protocol this transport carries.
    fn protocol(&self) -> Protocol;

    /// Install the callbacks. Must be called before [`start`](Self::start).
    fn set_handlers(&mut self, handlers: ChannelHandlers);

    /// Begin connecting.
    fn start(&mut self) -> TransportResult<()>;

    /// Tear the connection down. Idempotent.
    fn stop(&mut self);

    /// Queue a message. Messages sent while connecting are flushed once the
    /// channel is connected.
    fn send(&mut self, message: WireMessage) -> TransportResult<()>;

    /// Current channel state.
    fn state(&self) -> ChannelState;

    /// True once payload may flow.
    fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// True while written bytes or pending messages are not yet flushed.
    fn has_unsent(&self) -> bool;

    /// Point the transport at a new address for its next start.
    fn set_address(&mut self, host: &str, port: u16);

    /// The classification of the most recent failure.
    fn last_error(&self) -> ErrorKind;
}
