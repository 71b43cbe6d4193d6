//! Per-connection encryption handshake.
//!
//! The server opens every stream connection with an empty-body control frame
//! whose `ENC` header lists the ciphers it supports:
//!
//! ```text
//! ENC:HELLO!-1,2          (also accepted: ENC:0-HELLO!,1,2)
//! ```
//!
//! The first listed cipher becomes the default. Ciphers that need a key
//! exchange then receive one `ENC:<code>-<input>` control frame each, and may
//! answer with a control frame of their own. Payload is accepted only after
//! every listed cipher is established.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::cipher::{Cipher, CipherState, CipherType};
use crate::core::{
    ENCRYPTION_LIST_DELIMITER, ENCRYPTION_TYPE_DELIMITER, EncryptionError, HANDSHAKE_BEGIN,
};

/// Split an `ENC` value into the type token and the cipher-specific header.
pub fn split_encryption_header(value: &str) -> (&str, &str) {
    match value.split_once(ENCRYPTION_TYPE_DELIMITER) {
        Some((kind, rest)) => (kind, rest),
        // HTTP servers send a lone blank for "no encryption".
        None if value == " " => ("", ""),
        None => (value, ""),
    }
}

/// Extract the cipher list if `value` is a handshake-begin marker.
fn parse_hello(kind: &str, rest: &str) -> Option<Result<Vec<CipherType>, EncryptionError>> {
    let list = if kind == HANDSHAKE_BEGIN {
        rest
    } else if kind.trim() == "0" && rest.starts_with(HANDSHAKE_BEGIN) {
        rest[HANDSHAKE_BEGIN.len()..].trim_start_matches(ENCRYPTION_LIST_DELIMITER)
    } else {
        return None;
    };

    Some(
        list.split(ENCRYPTION_LIST_DELIMITER)
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(CipherType::from_code)
            .collect(),
    )
}

/// Result of feeding one control frame to the negotiator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandshakeStep {
    /// `ENC` values to send back, each as its own empty-body frame.
    pub replies: Vec<String>,
    /// True once every required cipher is established.
    pub complete: bool,
}

/// Encryption context of one transport channel.
#[derive(Debug, Default)]
pub struct EncryptionNegotiator {
    ciphers: BTreeMap<CipherType, Cipher>,
    default: Option<CipherType>,
    hello_received: bool,
}

impl EncryptionNegotiator {
    /// A negotiator that waits for the server's handshake.
    pub fn new() -> Self {
        Self::default()
    }

    /// A negotiator preset to one cipher, for channels without a handshake.
    ///
    /// Only ciphers that are established on creation are allowed.
    pub fn preset(cipher_type: Option<CipherType>) -> Result<Self, EncryptionError> {
        let mut negotiator = Self {
            hello_received: true,
            ..Self::default()
        };
        if let Some(t) = cipher_type.filter(|t| *t != CipherType::None) {
            if t.needs_handshake() {
                return Err(EncryptionError::HandshakeFailed(format!(
                    "{} requires a handshake",
                    t.name()
                )));
            }
            negotiator.ciphers.insert(t, Cipher::create(t)?);
            negotiator.default = Some(t);
        }
        Ok(negotiator)
    }

    /// Forget all negotiated state, ready for a new connection.
    pub fn reset(&mut self) {
        self.ciphers.clear();
        self.default = None;
        self.hello_received = false;
    }

    /// The cipher used when a message does not override it.
    pub fn default_cipher(&self) -> Option<CipherType> {
        self.default
    }

    /// State of one cipher.
    pub fn state(&self, cipher_type: CipherType) -> CipherState {
        self.ciphers
            .get(&cipher_type)
            .map_or(CipherState::None, Cipher::state)
    }

    /// Whether the handshake is finished and payload may flow.
    pub fn is_established(&self) -> bool {
        self.hello_received
            && self
                .ciphers
                .values()
                .all(|c| c.state() == CipherState::Established)
    }

    /// Process the `ENC` header of an empty-body control frame.
    pub fn on_handshake_frame(
        &mut self,
        encryption: Option<&str>,
    ) -> Result<HandshakeStep, EncryptionError> {
        let value = encryption
            .ok_or_else(|| EncryptionError::MissingHeader("handshake frame without ENC".into()))?;
        let (kind, rest) = split_encryption_header(value);

        let mut step = HandshakeStep::default();

        if let Some(list) = parse_hello(kind, rest) {
            let list = list?;
            if self.hello_received {
                return Err(EncryptionError::HandshakeFailed("duplicate hello".into()));
            }
            self.hello_received = true;
            self.default = list.first().copied().filter(|t| *t != CipherType::None);
            if let Some(t) = self.default {
                debug!(cipher = %t, "default encryption selected");
            }
            for t in list.into_iter().filter(|t| *t != CipherType::None) {
                self.ciphers.insert(t, Cipher::create(t)?);
            }
        } else {
            let cipher_type = CipherType::from_code(kind)?;
            let cipher = self
                .ciphers
                .get_mut(&cipher_type)
                .ok_or_else(|| EncryptionError::UnknownCipher(kind.to_string()))?;

            if cipher.state() != CipherState::Handshaking {
                warn!(cipher = %cipher_type, "unexpected handshake message");
                return Err(EncryptionError::UnexpectedHandshake(cipher_type.name()));
            }

            if let Some(reply) = cipher.handshake(rest)? {
                step.replies.push(format!(
                    "{}{}{}",
                    cipher_type.code(),
                    ENCRYPTION_TYPE_DELIMITER,
                    reply
                ));
            }
        }

        step.complete = self.is_established();
        Ok(step)
    }

    /// Encrypt an outgoing body.
    ///
    /// Returns the body to put on the wire and the `ENC` value, if any.
    pub fn encrypt(
        &mut self,
        preferred: Option<CipherType>,
        body: Vec<u8>,
    ) -> Result<(Vec<u8>, Option<String>), EncryptionError> {
        let Some(cipher_type) = preferred.or(self.default) else {
            return Ok((body, None));
        };
        if cipher_type == CipherType::None {
            return Ok((body, None));
        }

        let cipher = self
            .ciphers
            .get_mut(&cipher_type)
            .ok_or_else(|| EncryptionError::UnknownCipher(cipher_type.code().to_string()))?;
        let (body, header) = cipher.encrypt(body)?;

        Ok((
            body,
            Some(format!(
                "{}{}{}",
                cipher_type.code(),
                ENCRYPTION_TYPE_DELIMITER,
                header
            )),
        ))
    }

    /// Decrypt an incoming body given its `ENC` header.
    pub fn decrypt(
        &mut self,
        encryption: Option<&str>,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, EncryptionError> {
        let (kind, rest) = encryption.map_or(("", ""), split_encryption_header);

        if self.ciphers.is_empty() != kind.is_empty() {
            return Err(EncryptionError::MissingHeader(format!(
                "ENC {kind:?} with {} negotiated cipher(s)",
                self.ciphers.len()
            )));
        }
        if kind.is_empty() {
            return Ok(body);
        }

        let cipher_type = CipherType::from_code(kind)?;
        let cipher = self
            .ciphers
            .get_mut(&cipher_type)
            .ok_or_else(|| EncryptionError::UnknownCipher(kind.to_string()))?;
        cipher.decrypt(body, rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aead::{ChaChaCipher, Role};
    use crate::crypto::cipher::Ife1Cipher;

    #[test]
    fn test_split_encryption_header() {
        assert_eq!(split_encryption_header("2-1234"), ("2", "1234"));
        assert_eq!(split_encryption_header("3-"), ("3", ""));
        assert_eq!(split_encryption_header("HELLO!-1,2"), ("HELLO!", "1,2"));
        assert_eq!(split_encryption_header(" "), ("", ""));
    }

    #[test]
    fn test_basic_handshake_scenario() {
        let mut n = EncryptionNegotiator::new();
        assert!(!n.is_established());

        let step = n.on_handshake_frame(Some("0-HELLO!,1,2")).unwrap();
        assert!(step.replies.is_empty());
        assert!(!step.complete);

        assert_eq!(n.default_cipher(), Some(CipherType::Dummy));
        assert_eq!(n.state(CipherType::Dummy), CipherState::Established);
        assert_eq!(n.state(CipherType::Ife1), CipherState::Handshaking);
        assert!(!n.is_established());

        let step = n.on_handshake_frame(Some("2-4242")).unwrap();
        assert!(step.complete);
        assert!(n.is_established());
    }

    #[test]
    fn test_hello_plain_form() {
        let mut n = EncryptionNegotiator::new();
        let step = n.on_handshake_frame(Some("HELLO!-3")).unwrap();
        assert!(step.complete);
        assert_eq!(n.default_cipher(), Some(CipherType::Ife2));
    }

    #[test]
    fn test_empty_hello_completes_without_encryption() {
        let mut n = EncryptionNegotiator::new();
        let step = n.on_handshake_frame(Some("HELLO!-")).unwrap();
        assert!(step.complete);

        let (body, enc) = n.encrypt(None, b"plain".to_vec()).unwrap();
        assert_eq!(body, b"plain");
        assert_eq!(enc, None);
        assert_eq!(n.decrypt(None, b"plain".to_vec()).unwrap(), b"plain");
        assert!(n.decrypt(Some("1-"), b"x".to_vec()).is_err());
    }

    #[test]
    fn test_unknown_cipher_in_hello() {
        let mut n = EncryptionNegotiator::new();
        assert!(matches!(
            n.on_handshake_frame(Some("HELLO!-1,9")),
            Err(EncryptionError::UnknownCipher(_))
        ));
    }

    #[test]
    fn test_handshake_for_established_cipher_rejected() {
        let mut n = EncryptionNegotiator::new();
        n.on_handshake_frame(Some("HELLO!-1")).unwrap();
        assert_eq!(
            n.on_handshake_frame(Some("1-abc")),
            Err(EncryptionError::UnexpectedHandshake("dummy"))
        );
        assert!(n.on_handshake_frame(None).is_err());
    }

    #[test]
    fn test_encrypt_decrypt_with_server_side_ife1() {
        let mut n = EncryptionNegotiator::new();
        n.on_handshake_frame(Some("HELLO!-2")).unwrap();
        n.on_handshake_frame(Some("2-99")).unwrap();

        let (ct, enc) = n.encrypt(None, b"payload".to_vec()).unwrap();
        assert_eq!(enc.as_deref(), Some("2-"));

        let mut server = Ife1Cipher::default();
        server.handshake("99").unwrap();
        let mut pt = ct.clone();
        server.decrypt(&mut pt);
        assert_eq!(pt, b"payload");

        let mut reply = b"answer".to_vec();
        server.encrypt(&mut reply);
        assert_eq!(n.decrypt(Some("2-"), reply).unwrap(), b"answer");
    }

    #[test]
    fn test_per_message_override() {
        let mut n = EncryptionNegotiator::new();
        n.on_handshake_frame(Some("HELLO!-1,3")).unwrap();

        let (_, enc) = n.encrypt(Some(CipherType::Ife2), b"x".to_vec()).unwrap();
        assert_eq!(enc.as_deref(), Some("3-"));

        let (_, enc) = n.encrypt(Some(CipherType::None), b"x".to_vec()).unwrap();
        assert_eq!(enc, None);

        assert!(matches!(
            n.encrypt(Some(CipherType::Ife1), b"x".to_vec()),
            Err(EncryptionError::UnknownCipher(_))
        ));
    }

    #[test]
    fn test_chacha_handshake_reply() {
        let mut server = ChaChaCipher::new(Role::Server);
        let mut n = EncryptionNegotiator::new();

        n.on_handshake_frame(Some("HELLO!-4")).unwrap();
        let key_frame = format!("4-{}", server.public_key_hex());
        let step = n.on_handshake_frame(Some(key_frame.as_str())).unwrap();
        assert!(step.complete);
        assert_eq!(step.replies.len(), 1);

        let (_, client_key) = split_encryption_header(&step.replies[0]);
        server.handshake(client_key).unwrap();

        let (ct, enc) = n.encrypt(None, b"secret".to_vec()).unwrap();
        let enc = enc.unwrap();
        let (_, nonce) = split_encryption_header(&enc);
        assert_eq!(server.decrypt(&ct, nonce).unwrap(), b"secret");
    }

    #[test]
    fn test_preset() {
        let n = EncryptionNegotiator::preset(Some(CipherType::Ife2)).unwrap();
        assert!(n.is_established());
        assert_eq!(n.default_cipher(), Some(CipherType::Ife2));

        assert!(EncryptionNegotiator::preset(Some(CipherType::ChaCha20)).is_err());
        assert!(EncryptionNegotiator::preset(None).unwrap().is_established());
    }
}
