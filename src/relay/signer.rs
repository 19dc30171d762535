//! Local Identity
//!
//! [`Signer`] is the only holder of the identity's secret. The engine asks it
//! to sign outgoing events and to encrypt/decrypt history payloads.
//!
//! [`KeySigner`] keeps a secp256k1 key in memory:
//! - BIP-340 schnorr signatures over event ids
//! - Encryption: ECDH (x coordinate) → SHA-256 → AES-256-GCM, encoded as
//!   base64(`nonce || ciphertext`)

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use secp256k1::{ecdh, Keypair, Message, Parity, SecretKey, XOnlyPublicKey, SECP256K1};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use thiserror::Error;

use super::event::{Event, UnsignedEvent};

const NONCE_LEN: usize = 12;
const KDF_LABEL: &[u8] = b"nutzapd/v1/conversation";

/// Signer errors
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),
}

/// Local identity operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex x-only public key of this identity
    fn public_key(&self) -> String;

    /// Sign an event; the event's `pubkey` is replaced with this identity's
    async fn sign(&self, unsigned: UnsignedEvent) -> Result<Event, SignerError>;

    async fn encrypt(&self, peer: &str, plaintext: &str) -> Result<String, SignerError>;

    async fn decrypt(&self, peer: &str, ciphertext: &str) -> Result<String, SignerError>;
}

/// In-memory secp256k1 identity
pub struct KeySigner {
    secret: SecretKey,
    keypair: Keypair,
    public_key: String,
}

impl KeySigner {
    /// Generate a fresh identity
    pub fn generate() -> Self {
        Self::from_secret(SecretKey::new(&mut rand::thread_rng()))
    }

    /// Load from a hex-encoded 32-byte secret
    pub fn from_hex(secret_hex: &str) -> Result<Self, SignerError> {
        let secret = SecretKey::from_str(secret_hex.trim())
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let keypair = Keypair::from_secret_key(SECP256K1, &secret);
        let (xonly, _) = keypair.x_only_public_key();
        Self {
            secret,
            keypair,
            public_key: xonly.to_string(),
        }
    }

    /// Hex-encoded secret (for `keygen` output only)
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    fn cipher_for(&self, peer: &str) -> Result<Aes256Gcm, SignerError> {
        let xonly =
            XOnlyPublicKey::from_str(peer).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        // Only the x coordinate is used, so the assumed parity does not matter
        let point = ecdh::shared_secret_point(&xonly.public_key(Parity::Even), &self.secret);

        let key = Sha256::new()
            .chain_update(KDF_LABEL)
            .chain_update(&point[..32])
            .finalize();

        Aes256Gcm::new_from_slice(&key).map_err(|e| SignerError::Encryption(e.to_string()))
    }
}

impl std::fmt::Debug for KeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySigner")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for KeySigner {
    fn public_key(&self) -> String {
        self.public_key.clone()
    }

    async fn sign(&self, mut unsigned: UnsignedEvent) -> Result<Event, SignerError> {
        unsigned.pubkey = self.public_key.clone();
        let id = unsigned.id();
        let sig = SECP256K1.sign_schnorr(&Message::from_digest(id), &self.keypair);

        Ok(Event {
            id: hex::encode(id),
            pubkey: unsigned.pubkey,
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
            sig: sig.to_string(),
        })
    }

    async fn encrypt(&self, peer: &str, plaintext: &str) -> Result<String, SignerError> {
        let cipher = self.cipher_for(peer)?;
        let nonce: [u8; NONCE_LEN] = rand::random();

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| SignerError::Encryption(e.to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(payload))
    }

    async fn decrypt(&self, peer: &str, ciphertext: &str) -> Result<String, SignerError> {
        let payload = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| SignerError::Decryption(e.to_string()))?;
        if payload.len() <= NONCE_LEN {
            return Err(SignerError::Decryption("payload too short".to_string()));
        }

        let (nonce, body) = payload.split_at(NONCE_LEN);
        let plaintext = self
            .cipher_for(peer)?
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|e| SignerError::Decryption(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|e| SignerError::Decryption(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip_keeps_identity() {
        let signer = KeySigner::generate();
        let restored = KeySigner::from_hex(&signer.secret_hex()).unwrap();
        assert_eq!(signer.public_key(), restored.public_key());
        assert_eq!(signer.public_key().len(), 64);
    }

    #[test]
    fn test_invalid_secret_rejected() {
        assert!(KeySigner::from_hex("not-hex").is_err());
        assert!(KeySigner::from_hex(&"00".repeat(32)).is_err());
    }

    #[tokio::test]
    async fn test_self_encryption() {
        let signer = KeySigner::generate();
        let me = signer.public_key();

        let sealed = signer.encrypt(&me, r#"[["direction","in"]]"#).await.unwrap();
        assert!(!sealed.contains("direction"));
        assert_eq!(
            signer.decrypt(&me, &sealed).await.unwrap(),
            r#"[["direction","in"]]"#
        );
    }

    #[tokio::test]
    async fn test_conversation_key_is_shared() {
        let alice = KeySigner::generate();
        let bob = KeySigner::generate();

        let sealed = alice.encrypt(&bob.public_key(), "hello bob").await.unwrap();
        assert_eq!(
            bob.decrypt(&alice.public_key(), &sealed).await.unwrap(),
            "hello bob"
        );

        let eve = KeySigner::generate();
        assert!(eve.decrypt(&alice.public_key(), &sealed).await.is_err());
    }

    #[tokio::test]
    async fn test_sign_sets_pubkey() {
        let signer = KeySigner::generate();
        let unsigned = UnsignedEvent::new("placeholder", 1, vec![], "hi");
        let event = signer.sign(unsigned).await.unwrap();
        assert_eq!(event.pubkey, signer.public_key());
        assert!(event.verify().is_ok());
    }
}
