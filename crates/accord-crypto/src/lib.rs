//! Cryptographic utilities for Accord
//!
//! Participant signing and verification use Ed25519; keys travel as
//! hex-encoded strings. Payload digests use SHA-256. Event-chain continuity
//! hashes use BLAKE3 in keyed mode with a per-broker secret loaded at
//! startup and read-only thereafter.

use accord_types::ChainHash;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Crypto error kinds
#[derive(Debug, Clone, Error)]
pub enum CryptoError {
    #[error("Invalid key material: {message}")]
    InvalidKey { message: String },

    #[error("Invalid signature encoding: {message}")]
    InvalidSignature { message: String },

    #[error("Signature verification failed")]
    VerificationFailed,
}

/// A keypair for signing operations
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from a seed (32 bytes)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Get the public key as a hex string
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Sign a message, returning the hex signature
    pub fn sign(&self, message: &[u8]) -> String {
        let signature = self.signing_key.sign(message);
        hex::encode(signature.to_bytes())
    }

    /// Get the verifying key for verification
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Verify a hex signature against a hex public key
pub fn verify_signature(public_key_hex: &str, message: &[u8], signature_hex: &str) -> Result<()> {
    let public_key_bytes: [u8; 32] = hex::decode(public_key_hex)
        .map_err(|e| CryptoError::InvalidKey {
            message: format!("invalid public key hex: {}", e),
        })?
        .try_into()
        .map_err(|_| CryptoError::InvalidKey {
            message: "public key must be 32 bytes".to_string(),
        })?;

    let verifying_key =
        VerifyingKey::from_bytes(&public_key_bytes).map_err(|e| CryptoError::InvalidKey {
            message: format!("invalid public key: {}", e),
        })?;

    let signature_bytes: [u8; 64] = hex::decode(signature_hex)
        .map_err(|e| CryptoError::InvalidSignature {
            message: format!("invalid signature hex: {}", e),
        })?
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature {
            message: "signature must be 64 bytes".to_string(),
        })?;

    let signature = Signature::from_bytes(&signature_bytes);

    verifying_key
        .verify(message, &signature)
        .map_err(|_| CryptoError::VerificationFailed)?;
    Ok(())
}

/// Compute the SHA-256 digest of data as a hex string
pub fn hash_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Digest any serializable object via its canonical encoding
pub fn digest_canonical(value: &serde_json::Value) -> String {
    hash_sha256(&accord_types::canonical::to_bytes(value))
}

/// The per-broker secret used to key continuity hashes.
///
/// Process-wide, loaded once at startup, read-only afterwards.
#[derive(Clone)]
pub struct ChainKey([u8; 32]);

impl ChainKey {
    /// Load from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Load from a 64-character hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidKey {
            message: format!("invalid chain key hex: {}", e),
        })?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey {
            message: "chain key must be 32 bytes".to_string(),
        })?;
        Ok(Self(array))
    }

    /// Generate a random key (tests and ephemeral brokers)
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Keyed continuity hash: `H(key, previous_hash || body)`.
    pub fn continuity_hash(&self, previous: &ChainHash, body: &[u8]) -> ChainHash {
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher.update(previous.as_bytes());
        hasher.update(body);
        ChainHash(*hasher.finalize().as_bytes())
    }
}

impl std::fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key material
        f.debug_struct("ChainKey").finish_non_exhaustive()
    }
}

/// Stored representation of a public key with metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    pub key_id: String,
    pub public_key_hex: String,
    pub algorithm: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl PublicKeyInfo {
    pub fn from_keypair(key_id: impl Into<String>, keypair: &Keypair) -> Self {
        Self {
            key_id: key_id.into(),
            public_key_hex: keypair.public_key_hex(),
            algorithm: "Ed25519".to_string(),
            created_at: chrono::Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: chrono::DateTime<chrono::Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expiry| chrono::Utc::now() >= expiry)
            .unwrap_or(false)
    }

    pub fn verify(&self, message: &[u8], signature_hex: &str) -> Result<()> {
        verify_signature(&self.public_key_hex, message, signature_hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = Keypair::generate();
        let message = b"hello accord";
        let signature = keypair.sign(message);

        assert!(verify_signature(&keypair.public_key_hex(), message, &signature).is_ok());
        assert!(verify_signature(&keypair.public_key_hex(), b"tampered", &signature).is_err());
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let signer = Keypair::generate();
        let other = Keypair::generate();
        let signature = signer.sign(b"msg");
        assert!(matches!(
            verify_signature(&other.public_key_hex(), b"msg", &signature),
            Err(CryptoError::VerificationFailed)
        ));
    }

    #[test]
    fn test_keypair_from_seed_is_deterministic() {
        let seed = [9u8; 32];
        let a = Keypair::from_seed(&seed);
        let b = Keypair::from_seed(&seed);
        assert_eq!(a.public_key_hex(), b.public_key_hex());
        assert_eq!(a.sign(b"x"), b.sign(b"x"));
    }

    #[test]
    fn test_continuity_hash_depends_on_key_prev_and_body() {
        let key_a = ChainKey::from_bytes([1u8; 32]);
        let key_b = ChainKey::from_bytes([2u8; 32]);
        let genesis = ChainHash::genesis();

        let h1 = key_a.continuity_hash(&genesis, b"body");
        assert_ne!(h1, key_b.continuity_hash(&genesis, b"body"));
        assert_ne!(h1, key_a.continuity_hash(&genesis, b"other"));
        assert_ne!(h1, key_a.continuity_hash(&h1, b"body"));
        assert_eq!(h1, key_a.continuity_hash(&genesis, b"body"));
    }

    #[test]
    fn test_chain_key_hex_round_trip() {
        let key = ChainKey::from_bytes([7u8; 32]);
        let parsed = ChainKey::from_hex(&"07".repeat(32)).unwrap();
        assert_eq!(
            key.continuity_hash(&ChainHash::genesis(), b"x"),
            parsed.continuity_hash(&ChainHash::genesis(), b"x")
        );
        assert!(ChainKey::from_hex("abc").is_err());
    }

    #[test]
    fn test_key_expiry() {
        let keypair = Keypair::generate();
        let expired = PublicKeyInfo::from_keypair("k1", &keypair)
            .with_expiry(chrono::Utc::now() - chrono::Duration::hours(1));
        assert!(expired.is_expired());

        let live = PublicKeyInfo::from_keypair("k2", &keypair);
        assert!(!live.is_expired());
    }
}
