pub mod hybrid;
pub mod key_bundle;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use peernet_types::KeyId;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use hybrid::{encrypt_and_sign, verify_and_decrypt, SenderPublicKey};
pub use key_bundle::{KeyBundleService, KeyBundleStore};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Signature invalid")]
    SignatureInvalid,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

/// Public half of a key bundle: an ed25519 key for signatures and an x25519 key for encryption.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PubKey {
    pub signing_key: [u8; 32],
    pub encryption_key: [u8; 32],
}

impl PubKey {
    pub fn key_id(&self) -> KeyId {
        let mut hasher = Sha256::new();
        hasher.update(self.signing_key);
        hasher.update(self.encryption_key);
        KeyId::from_bytes(&hasher.finalize()[..20])
    }
}

#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    encryption_secret: x25519_dalek::StaticSecret,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            encryption_secret: x25519_dalek::StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_secret_bytes(signing: [u8; 32], encryption: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&signing),
            encryption_secret: x25519_dalek::StaticSecret::from(encryption),
        }
    }

    pub fn from_hex(signing: &str, encryption: &str) -> CryptoResult<Self> {
        Ok(Self::from_secret_bytes(
            decode_key(signing)?,
            decode_key(encryption)?,
        ))
    }

    pub fn public_key(&self) -> PubKey {
        PubKey {
            signing_key: self.signing_key.verifying_key().to_bytes(),
            encryption_key: x25519_dalek::PublicKey::from(&self.encryption_secret).to_bytes(),
        }
    }

    pub fn key_id(&self) -> KeyId {
        self.public_key().key_id()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    pub fn signing_secret(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn encryption_secret(&self) -> [u8; 32] {
        self.encryption_secret.to_bytes()
    }

    pub(crate) fn x25519_secret(&self) -> &x25519_dalek::StaticSecret {
        &self.encryption_secret
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_id", &self.key_id())
            .finish_non_exhaustive()
    }
}

pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> CryptoResult<()> {
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::SignatureInvalid)?;

    let signature: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::SignatureInvalid)?;

    verifying_key
        .verify(message, &Signature::from_bytes(&signature))
        .map_err(|_| CryptoError::SignatureInvalid)
}

pub fn hash_data(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn decode_key(encoded: &str) -> CryptoResult<[u8; 32]> {
    let bytes = hex::decode(encoded).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32 bytes".to_string()))
}
