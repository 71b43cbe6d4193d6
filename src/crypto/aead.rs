//! XChaCha20-Poly1305 cipher negotiated over X25519.
//!
//! Handshake (one round):
//!
//! ```text
//! server -> client   ENC:4-<server public key, hex>      (empty body)
//! client -> server   ENC:4-<client public key, hex>      (empty body)
//! ```
//!
//! Each payload then carries its random 24-byte nonce, hex encoded, as the
//! cipher-specific part of the `ENC` header.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use rand::{RngCore, rngs::OsRng};

use super::keys::{EphemeralKeypair, SessionKey, derive_session_keys, parse_public_key};
use crate::core::{AEAD_NONCE_SIZE, AEAD_TAG_SIZE, EncryptionError};

/// Encrypt plaintext using XChaCha20-Poly1305.
///
/// Returns ciphertext with the 16-byte Poly1305 tag appended.
pub fn encrypt(
    key: &SessionKey,
    nonce: &[u8; AEAD_NONCE_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| EncryptionError::EncryptionFailed)
}

/// Decrypt ciphertext using XChaCha20-Poly1305.
pub fn decrypt(
    key: &SessionKey,
    nonce: &[u8; AEAD_NONCE_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    if ciphertext.len() < AEAD_TAG_SIZE {
        return Err(EncryptionError::DecryptionFailed);
    }

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| EncryptionError::DecryptionFailed)
}

/// Which end of the key agreement this cipher plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Receives the server key first and replies with its own.
    Client,
    /// Announces its key and accepts the client's reply.
    Server,
}

/// Per-connection XChaCha20-Poly1305 state.
#[derive(Debug)]
pub struct ChaChaCipher {
    role: Role,
    keypair: EphemeralKeypair,
    keys: Option<(SessionKey, SessionKey)>,
}

impl ChaChaCipher {
    /// Create a cipher waiting for its handshake round.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            keypair: EphemeralKeypair::generate(),
            keys: None,
        }
    }

    /// Hex-encoded local public key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.public_key())
    }

    /// Whether the key agreement has completed.
    pub fn is_established(&self) -> bool {
        self.keys.is_some()
    }

    /// Consume the peer's public key.
    ///
    /// A client returns its own public key as the reply header.
    pub fn handshake(&mut self, input: &str) -> Result<Option<String>, EncryptionError> {
        if self.keys.is_some() {
            return Err(EncryptionError::UnexpectedHandshake("chacha20"));
        }

        let remote = parse_public_key(input)?;
        let shared = self.keypair.diffie_hellman(&remote);
        let local = *self.keypair.public_key();

        let (client_public, server_public) = match self.role {
            Role::Client => (local, remote),
            Role::Server => (remote, local),
        };
        let derived = derive_session_keys(&shared, &client_public, &server_public)?;

        self.keys = Some(match self.role {
            Role::Client => (derived.client_to_server.clone(), derived.server_to_client.clone()),
            Role::Server => (derived.server_to_client.clone(), derived.client_to_server.clone()),
        });

        Ok(match self.role {
            Role::Client => Some(self.public_key_hex()),
            Role::Server => None,
        })
    }

    /// Encrypt a body, returning the ciphertext and the nonce header.
    pub fn encrypt(&self, body: &[u8]) -> Result<(Vec<u8>, String), EncryptionError> {
        let (send, _) = self
            .keys
            .as_ref()
            .ok_or(EncryptionError::NotEstablished("chacha20"))?;

        let mut nonce = [0u8; AEAD_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = encrypt(send, &nonce, body)?;
        Ok((ciphertext, hex::encode(nonce)))
    }

    /// Decrypt a body using the nonce carried in `header`.
    pub fn decrypt(&self, body: &[u8], header: &str) -> Result<Vec<u8>, EncryptionError> {
        let (_, recv) = self
            .keys
            .as_ref()
            .ok_or(EncryptionError::NotEstablished("chacha20"))?;

        let nonce: [u8; AEAD_NONCE_SIZE] = hex::decode(header.trim())
            .ok()
            .and_then(|n| n.try_into().ok())
            .ok_or(EncryptionError::DecryptionFailed)?;

        decrypt(recv, &nonce, body)
    }
}
