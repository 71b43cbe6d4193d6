//! X25519 key management and session key derivation.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::core::{EncryptionError, PUBLIC_KEY_SIZE};

/// Size of a derived session key (32 bytes for XChaCha20).
pub const SESSION_KEY_SIZE: usize = 32;

/// HKDF info label for the client-to-server key.
const CLIENT_TO_SERVER_INFO: &[u8] = b"tickwire v1 c2s";

/// HKDF info label for the server-to-client key.
const SERVER_TO_CLIENT_INFO: &[u8] = b"tickwire v1 s2c";

/// An ephemeral X25519 keypair, generated per connection.
///
/// The private key is zeroized on drop.
pub struct EphemeralKeypair {
    private: [u8; 32],
    public: [u8; PUBLIC_KEY_SIZE],
}

impl EphemeralKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            private: secret.to_bytes(),
            public: public.to_bytes(),
        }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public
    }

    /// Compute the DH shared secret with a remote public key.
    pub fn diffie_hellman(&self, remote_public: &[u8; PUBLIC_KEY_SIZE]) -> [u8; 32] {
        let secret = StaticSecret::from(self.private);
        let shared = secret.diffie_hellman(&PublicKey::from(*remote_public));
        *shared.as_bytes()
    }
}

impl Drop for EphemeralKeypair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl std::fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// A symmetric session key. Zeroized on drop.
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; SESSION_KEY_SIZE],
}

impl SessionKey {
    /// Create a session key from bytes.
    pub fn from_bytes(key: [u8; SESSION_KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Get the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.key
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Directional keys derived from one key agreement.
pub struct SessionKeys {
    /// Key for client-to-server traffic.
    pub client_to_server: SessionKey,
    /// Key for server-to-client traffic.
    pub server_to_client: SessionKey,
}

/// Derive directional session keys with HKDF-SHA256.
///
/// The salt is the client public key followed by the server public key.
pub fn derive_session_keys(
    shared_secret: &[u8; 32],
    client_public: &[u8; PUBLIC_KEY_SIZE],
    server_public: &[u8; PUBLIC_KEY_SIZE],
) -> Result<SessionKeys, EncryptionError> {
    let mut salt = [0u8; PUBLIC_KEY_SIZE * 2];
    salt[..PUBLIC_KEY_SIZE].copy_from_slice(client_public);
    salt[PUBLIC_KEY_SIZE..].copy_from_slice(server_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);

    let mut c2s = [0u8; SESSION_KEY_SIZE];
    let mut s2c = [0u8; SESSION_KEY_SIZE];
    hk.expand(CLIENT_TO_SERVER_INFO, &mut c2s)
        .map_err(|_| EncryptionError::HandshakeFailed("key derivation failed".into()))?;
    hk.expand(SERVER_TO_CLIENT_INFO, &mut s2c)
        .map_err(|_| EncryptionError::HandshakeFailed("key derivation failed".into()))?;

    let keys = SessionKeys {
        client_to_server: SessionKey::from_bytes(c2s),
        server_to_client: SessionKey::from_bytes(s2c),
    };
    c2s.zeroize();
    s2c.zeroize();
    Ok(keys)
}

/// Parse a hex-encoded X25519 public key.
pub fn parse_public_key(hex_key: &str) -> Result<[u8; PUBLIC_KEY_SIZE], EncryptionError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| EncryptionError::HandshakeFailed(format!("bad public key: {e}")))?;
    bytes.try_into().map_err(|_| {
        EncryptionError::HandshakeFailed(format!("public key must be {PUBLIC_KEY_SIZE} bytes"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let a = EphemeralKeypair::generate();
        let b = EphemeralKeypair::generate();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_dh_agreement() {
        let client = EphemeralKeypair::generate();
        let server = EphemeralKeypair::generate();

        let s1 = client.diffie_hellman(server.public_key());
        let s2 = server.diffie_hellman(client.public_key());
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_derived_keys_are_directional() {
        let client = EphemeralKeypair::generate();
        let server = EphemeralKeypair::generate();
        let shared = client.diffie_hellman(server.public_key());

        let keys = derive_session_keys(&shared, client.public_key(), server.public_key()).unwrap();
        assert_ne!(
            keys.client_to_server.as_bytes(),
            keys.server_to_client.as_bytes()
        );
    }

    #[test]
    fn test_parse_public_key() {
        let kp = EphemeralKeypair::generate();
        let encoded = hex::encode(kp.public_key());
        assert_eq!(&parse_public_key(&encoded).unwrap(), kp.public_key());
        assert!(parse_public_key("abcd").is_err());
        assert!(parse_public_key("not hex").is_err());
    }
}
