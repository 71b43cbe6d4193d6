//! Tickwire - Reliability Layer
//!
//! Implements:
//! - Wraparound-aware sequence arithmetic
//! - Per-protocol sequence stamping and gap detection
//! - Acknowledgment pruning and retransmission after reconnect
//! - Message carry-over across server redirects

mod redirect;
mod reliability;
mod resend;
mod seq;

pub use redirect::*;
pub use reliability::*;
pub use resend::*;
pub use seq::*;
