//! Hybrid encryption with sender signature.
//!
//! An ephemeral x25519 secret is combined with the receiver's encryption key, HKDF-SHA256
//! derives the XChaCha20-Poly1305 key, and the sender signs the resulting envelope with
//! ed25519. The signature covers the receiver key so an envelope cannot be re-targeted.

use crate::{verify_signature, CryptoError, CryptoResult, KeyPair, PubKey};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use peernet_types::ConfidentialData;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

const KDF_INFO_PREFIX: &[u8] = b"peernet-confidential-v1";
const SIGNATURE_DOMAIN: &[u8] = b"peernet-confidential-sig-v1";

pub fn encrypt_and_sign(
    plaintext: &[u8],
    receiver: &PubKey,
    sender: &KeyPair,
) -> CryptoResult<ConfidentialData> {
    let sender_public = sender.public_key();

    let ephemeral = x25519_dalek::StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&x25519_dalek::PublicKey::from(receiver.encryption_key));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey(
            "receiver encryption key is a low order point".to_string(),
        ));
    }

    let key = derive_key(
        shared.as_bytes(),
        &ephemeral_public,
        &sender_public,
        &receiver.encryption_key,
    )?;

    let mut nonce = [0u8; 24];
    OsRng.fill_bytes(&mut nonce);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let aad = associated_data(&sender_public);
    let cipher_text = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let signature = sender.sign(&signed_bytes(
        &ephemeral_public,
        &nonce,
        &cipher_text,
        &receiver.encryption_key,
    ));

    Ok(ConfidentialData {
        sender_signing_key: sender_public.signing_key,
        sender_encryption_key: sender_public.encryption_key,
        ephemeral_public_key: ephemeral_public,
        nonce,
        cipher_text,
        signature,
    })
}

/// Verifies the sender signature, then decrypts. A bad signature is reported before
/// any decryption is attempted.
pub fn verify_and_decrypt(data: &ConfidentialData, receiver: &KeyPair) -> CryptoResult<Vec<u8>> {
    let receiver_public = receiver.public_key();

    verify_signature(
        &data.sender_signing_key,
        &signed_bytes(
            &data.ephemeral_public_key,
            &data.nonce,
            &data.cipher_text,
            &receiver_public.encryption_key,
        ),
        &data.signature,
    )?;

    let shared = receiver
        .x25519_secret()
        .diffie_hellman(&x25519_dalek::PublicKey::from(data.ephemeral_public_key));
    if !shared.was_contributory() {
        return Err(CryptoError::DecryptionFailed);
    }

    let sender_public = data.sender_public_key();
    let key = derive_key(
        shared.as_bytes(),
        &data.ephemeral_public_key,
        &sender_public,
        &receiver_public.encryption_key,
    )?;

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let aad = associated_data(&sender_public);
    cipher
        .decrypt(
            XNonce::from_slice(&data.nonce),
            Payload {
                msg: &data.cipher_text,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

pub trait SenderPublicKey {
    fn sender_public_key(&self) -> PubKey;
}

impl SenderPublicKey for ConfidentialData {
    fn sender_public_key(&self) -> PubKey {
        PubKey {
            signing_key: self.sender_signing_key,
            encryption_key: self.sender_encryption_key,
        }
    }
}

fn derive_key(
    shared_secret: &[u8; 32],
    ephemeral_public: &[u8; 32],
    sender: &PubKey,
    receiver_encryption_key: &[u8; 32],
) -> CryptoResult<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(ephemeral_public), shared_secret);

    let mut info = Vec::with_capacity(KDF_INFO_PREFIX.len() + 64);
    info.extend_from_slice(KDF_INFO_PREFIX);
    info.extend_from_slice(&sender.signing_key);
    info.extend_from_slice(receiver_encryption_key);

    let mut okm = [0u8; 32];
    hk.expand(&info, &mut okm)
        .map_err(|e| CryptoError::EncryptionFailed(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

fn associated_data(sender: &PubKey) -> Vec<u8> {
    let mut aad = Vec::with_capacity(64);
    aad.extend_from_slice(&sender.signing_key);
    aad.extend_from_slice(&sender.encryption_key);
    aad
}

fn signed_bytes(
    ephemeral_public: &[u8; 32],
    nonce: &[u8; 24],
    cipher_text: &[u8],
    receiver_encryption_key: &[u8; 32],
) -> Vec<u8> {
    let mut bytes =
        Vec::with_capacity(SIGNATURE_DOMAIN.len() + 32 + 24 + cipher_text.len() + 32);
    bytes.extend_from_slice(SIGNATURE_DOMAIN);
    bytes.extend_from_slice(ephemeral_public);
    bytes.extend_from_slice(nonce);
    bytes.extend_from_slice(cipher_text);
    bytes.extend_from_slice(receiver_encryption_key);
    bytes
}
