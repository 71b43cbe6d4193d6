//! # Tickwire
//!
//! Client transport engine for real-time game servers.
//!
//! Tickwire connects a game client to its server over TCP, UDP and HTTP at
//! the same time and presents them as one session:
//!
//! - **Framing**: a small text header (`VER`, `LEN`, `ENC`) in front of every
//!   body
//! - **Encryption**: per-connection cipher negotiation, from simple
//!   obfuscation up to X25519 + XChaCha20-Poly1305
//! - **Compression**: optional zstd or DEFLATE bodies above a size threshold
//! - **Reliability**: sequence numbers, acknowledgments and retransmission
//!   across reconnects
//! - **Session**: server-assigned session ids, reconnect backoff, response
//!   and reply watchdogs, and server-initiated redirects
//!
//! ## Feature Flags
//!
//! - `transport` (default): frame codec and tokio drivers
//! - `crypto` (default): cipher negotiation
//! - `compression` (default): zstd and DEFLATE body codecs
//! - `sync` (default): sequence/ack bookkeeping
//! - `client` (default): the [`client::Session`] orchestrator
//!
//! ## Modules
//!
//! - [`core`]: constants, error types and shared enums (always included)
//! - [`crypto`]: ciphers and the handshake negotiator
//! - [`compression`]: body codecs
//! - [`transport`]: frames, channel state machine and drivers
//! - [`sync`]: reliability layer
//! - [`client`]: session API
//!
//! ## Example Usage
//!
//! ```no_run
//! use serde_json::json;
//! use tickwire::prelude::*;
//!
//! # async fn run() -> Result<(), SessionError> {
//! let config = SessionConfig::builder("127.0.0.1").build();
//! let mut session = Session::new(config);
//! session.add_transport(Protocol::Tcp, 8012, TransportOptions::default())?;
//! session.set_default_handler(|msg| println!("{}: {}", msg.msg_type, msg.body));
//! session.start();
//!
//! loop {
//!     session.update(0.05);
//!     if session.is_connected() {
//!         session.send("echo", json!({"message": "hello"}))?;
//!     }
//!     tokio::time::sleep(std::time::Duration::from_millis(50)).await;
//! }
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Crypto layer (feature-gated)
#[cfg(feature = "crypto")]
#[cfg_attr(docsrs, doc(cfg(feature = "crypto")))]
pub mod crypto;

// Compression layer (feature-gated)
#[cfg(feature = "compression")]
#[cfg_attr(docsrs, doc(cfg(feature = "compression")))]
pub mod compression;

// Transport layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// Sync layer (feature-gated)
#[cfg(feature = "sync")]
#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
pub mod sync;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        CompressionType, Encoding, ErrorKind, Protocol, SessionError, SessionResult,
        TransportError, TransportResult,
    };

    #[cfg(feature = "crypto")]
    pub use crate::crypto::CipherType;

    #[cfg(feature = "transport")]
    pub use crate::transport::{ChannelState, Transport, TransportOptions, WireMessage};

    #[cfg(feature = "client")]
    pub use crate::client::{
        OutgoingMessage, ReceivedMessage, Session, SessionConfig, SessionEvent, SessionId,
        SessionState, TransportEvent,
    };
}

// Re-export commonly used items at crate root
pub use crate::core::{ErrorKind, Protocol, SessionError, TransportError};

#[cfg(feature = "client")]
pub use client::{Session, SessionConfig};
