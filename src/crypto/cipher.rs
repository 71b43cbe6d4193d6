//! Cipher types and their per-connection state.
//!
//! The cipher set is fixed, so dispatch is a plain enum match.

use std::fmt;

use super::aead::{ChaChaCipher, Role};
use crate::core::EncryptionError;

/// Wire code of a cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CipherType {
    /// No encryption.
    None,
    /// Identity transform, established on creation.
    Dummy,
    /// Rolling-key XOR cipher keyed by one handshake round.
    Ife1,
    /// Length-keyed byte rotation, established on creation.
    Ife2,
    /// X25519 + XChaCha20-Poly1305.
    ChaCha20,
}

impl CipherType {
    /// Parse a wire code.
    pub fn from_code(code: &str) -> Result<Self, EncryptionError> {
        match code.trim() {
            "0" => Ok(CipherType::None),
            "1" => Ok(CipherType::Dummy),
            "2" => Ok(CipherType::Ife1),
            "3" => Ok(CipherType::Ife2),
            "4" => Ok(CipherType::ChaCha20),
            other => Err(EncryptionError::UnknownCipher(other.to_string())),
        }
    }

    /// Wire code.
    pub fn code(self) -> u8 {
        match self {
            CipherType::None => 0,
            CipherType::Dummy => 1,
            CipherType::Ife1 => 2,
            CipherType::Ife2 => 3,
            CipherType::ChaCha20 => 4,
        }
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            CipherType::None => "none",
            CipherType::Dummy => "dummy",
            CipherType::Ife1 => "ife1",
            CipherType::Ife2 => "ife2",
            CipherType::ChaCha20 => "chacha20",
        }
    }

    /// Whether the cipher is usable without a handshake round.
    pub fn needs_handshake(self) -> bool {
        matches!(self, CipherType::Ife1 | CipherType::ChaCha20)
    }
}

impl fmt::Display for CipherType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

/// Negotiation state of one cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherState {
    /// Not in use.
    None,
    /// Waiting for a handshake round.
    Handshaking,
    /// Keys are in place.
    Established,
}

/// C#-compatible 8-bit rotate: shifts of 9..=15 collapse to zero.
fn rotl8(value: u8, shift: u32) -> u8 {
    if shift <= 8 {
        value.rotate_left(shift)
    } else {
        0
    }
}

/// ife1 state: separate rolling keys per direction.
#[derive(Debug, Clone, Default)]
pub struct Ife1Cipher {
    enc_key: u32,
    dec_key: u32,
    established: bool,
}

impl Ife1Cipher {
    /// Block size of the XOR pass.
    const BLOCK_SIZE: usize = 4;

    /// Install the key announced by the server.
    pub fn handshake(&mut self, input: &str) -> Result<Option<String>, EncryptionError> {
        if self.established {
            return Err(EncryptionError::UnexpectedHandshake("ife1"));
        }
        let key: u32 = input
            .trim()
            .parse()
            .map_err(|_| EncryptionError::HandshakeFailed(format!("ife1 key {input:?}")))?;

        self.enc_key = key;
        self.dec_key = key;
        self.established = true;
        Ok(None)
    }

    fn apply(data: &mut [u8], key: &mut u32) {
        *key = key.wrapping_mul(8_253_729).wrapping_add(2_396_403);

        let shift = *key & 0x0F;
        let key32 = key.rotate_left(shift);

        let mut blocks = data.chunks_exact_mut(Self::BLOCK_SIZE);
        for block in &mut blocks {
            let mut word = [0u8; Self::BLOCK_SIZE];
            word.copy_from_slice(block);
            let mixed = u32::from_le_bytes(word) ^ key32;
            block.copy_from_slice(&mixed.to_le_bytes());
        }

        let key8 = rotl8(key.to_le_bytes()[0], shift);
        for byte in blocks.into_remainder() {
            *byte ^= key8;
        }
    }

    /// Encrypt in place, advancing the send key.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        Self::apply(data, &mut self.enc_key);
    }

    /// Decrypt in place, advancing the receive key.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        Self::apply(data, &mut self.dec_key);
    }
}

/// ife2 transform. The key is the body length truncated to a byte.
pub fn ife2_transform(data: &mut [u8], encrypt: bool) {
    let key = data.len() as u8;
    let rem = u32::from(key % 8);
    let shift = if encrypt { rem } else { 8 - rem };

    for byte in data.iter_mut() {
        *byte = if encrypt {
            rotl8(*byte ^ key, shift)
        } else {
            rotl8(*byte, shift) ^ key
        };
    }
}

/// A cipher instance bound to one connection.
#[derive(Debug)]
pub enum Cipher {
    /// See [`CipherType::Dummy`].
    Dummy,
    /// See [`CipherType::Ife1`].
    Ife1(Ife1Cipher),
    /// See [`CipherType::Ife2`].
    Ife2,
    /// See [`CipherType::ChaCha20`].
    ChaCha20(Box<ChaChaCipher>),
}

impl Cipher {
    /// Instantiate a client-side cipher for `cipher_type`.
    pub fn create(cipher_type: CipherType) -> Result<Self, EncryptionError> {
        match cipher_type {
            CipherType::Dummy => Ok(Cipher::Dummy),
            CipherType::Ife1 => Ok(Cipher::Ife1(Ife1Cipher::default())),
            CipherType::Ife2 => Ok(Cipher::Ife2),
            CipherType::ChaCha20 => Ok(Cipher::ChaCha20(Box::new(ChaChaCipher::new(Role::Client)))),
            CipherType::None => Err(EncryptionError::UnknownCipher("0".into())),
        }
    }

    /// The cipher's wire type.
    pub fn cipher_type(&self) -> CipherType {
        match self {
            Cipher::Dummy => CipherType::Dummy,
            Cipher::Ife1(_) => CipherType::Ife1,
            Cipher::Ife2 => CipherType::Ife2,
            Cipher::ChaCha20(_) => CipherType::ChaCha20,
        }
    }

    /// Current negotiation state.
    pub fn state(&self) -> CipherState {
        let established = match self {
            Cipher::Dummy | Cipher::Ife2 => true,
            Cipher::Ife1(c) => c.established,
            Cipher::ChaCha20(c) => c.is_established(),
        };
        if established {
            CipherState::Established
        } else {
            CipherState::Handshaking
        }
    }

    /// Run one handshake round; returns the header to send back, if any.
    pub fn handshake(&mut self, input: &str) -> Result<Option<String>, EncryptionError> {
        match self {
            Cipher::Ife1(c) => c.handshake(input),
            Cipher::ChaCha20(c) => c.handshake(input),
            other => Err(EncryptionError::UnexpectedHandshake(other.cipher_type().name())),
        }
    }

    /// Encrypt a body, returning the ciphertext and the cipher-specific header.
    pub fn encrypt(&mut self, mut body: Vec<u8>) -> Result<(Vec<u8>, String), EncryptionError> {
        if self.state() != CipherState::Established {
            return Err(EncryptionError::NotEstablished(self.cipher_type().name()));
        }
        match self {
            Cipher::Dummy => Ok((body, String::new())),
            Cipher::Ife1(c) => {
                c.encrypt(&mut body);
                Ok((body, String::new()))
            }
            Cipher::Ife2 => {
                ife2_transform(&mut body, true);
                Ok((body, String::new()))
            }
            Cipher::ChaCha20(c) => c.encrypt(&body),
        }
    }

    /// Decrypt a body using the cipher-specific header.
    pub fn decrypt(&mut self, mut body: Vec<u8>, header: &str) -> Result<Vec<u8>, EncryptionError> {
        if self.state() != CipherState::Established {
            return Err(EncryptionError::NotEstablished(self.cipher_type().name()));
        }
        match self {
            Cipher::ChaCha20(c) => c.decrypt(&body, header),
            _ if !header.is_empty() => Err(EncryptionError::DecryptionFailed),
            Cipher::Dummy => Ok(body),
            Cipher::Ife1(c) => {
                c.decrypt(&mut body);
                Ok(body)
            }
            Cipher::Ife2 => {
                ife2_transform(&mut body, false);
                Ok(body)
            }
        }
    }
}
