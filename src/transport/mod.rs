//! Tickwire - Transport Layer
//!
//! Framed, encrypted channels to the server over three protocols:
//!
//! - **Frame encoding/decoding**: [`HeaderFields`], [`FrameDecoder`] and the
//!   `VER`/`LEN`/`ENC` wire format
//! - **Channel state machine**: [`ChannelCore`], shared by every driver
//! - **Drivers**: [`StreamChannel`] (TCP), [`DatagramChannel`] (UDP) and
//!   [`HttpChannel`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Session                      │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   frames, handshake, drivers            │
//! ├─────────────────────────────────────────┤
//! │         Encryption Layer                │
//! ├─────────────────────────────────────────┤
//! │         TCP  /  UDP  /  HTTP            │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The session owns its transports through the [`Transport`] trait and
//! learns about them through [`ChannelHandlers`].

mod buffer;
mod channel;
mod connection;
mod datagram;
mod driver;
pub mod frame;
mod http;
mod options;
mod stream;

pub use buffer::ReceiveBuffer;
pub use channel::*;
pub use connection::{ChannelCore, CoreEvent, CoreOutput, Outbound};
pub use datagram::DatagramChannel;
pub use frame::{DecodedFrame, FrameDecoder, HeaderFields};
pub use http::HttpChannel;
pub use options::TransportOptions;
pub use stream::StreamChannel;

/// Create the driver for `protocol`.
pub fn create_transport(
    protocol: crate::core::Protocol,
    host: &str,
    port: u16,
    options: &TransportOptions,
) -> Box<dyn Transport> {
    use crate::core::Protocol;

    match protocol {
        Protocol::Tcp => Box::new(StreamChannel::new(host, port, options)),
        Protocol::Udp => Box::new(DatagramChannel::new(host, port, options)),
        Protocol::Http => Box::new(HttpChannel::new(host, port, options)),
    }
}
