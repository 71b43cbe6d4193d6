//! Tickwire - Session Layer
//!
//! High-level client API: a [`Session`] carries JSON messages over one or
//! more transports, keeps the server-assigned session id, and reconnects,
//! resends and follows redirects as configured.

mod config;
mod events;
mod message;
mod reconnect;
mod session;
mod session_id;
mod watchdog;

pub use config::{SessionConfig, SessionConfigBuilder};
pub use events::{SessionEvent, SessionState, TransportEvent};
pub use message::{
    Envelope, OutgoingMessage, QueuedMessage, ReceivedMessage, RedirectCommand, RedirectPort,
    RedirectResult,
};
pub use reconnect::Backoff;
pub use session::Session;
pub use session_id::SessionId;
pub use watchdog::{PendingReplies, ResponseTimer};
