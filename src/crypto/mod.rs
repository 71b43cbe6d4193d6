//! Tickwire - Encryption Layer
//!
//! Cipher implementations and the per-connection handshake that selects
//! them:
//!
//! - [`EncryptionNegotiator`]: `None -> Handshaking -> Established` per cipher
//! - [`Cipher`]: enum dispatch over the fixed cipher set
//! - [`ChaChaCipher`]: X25519 + HKDF-SHA256 + XChaCha20-Poly1305

mod aead;
mod cipher;
mod keys;
mod negotiator;

pub use aead::{ChaChaCipher, Role};
pub use cipher::*;
pub use keys::*;
pub use negotiator::*;
