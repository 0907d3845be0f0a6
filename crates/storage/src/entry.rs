use crate::error::{StorageError, StorageResult};
use peernet_crypto::{hash_data, verify_signature, KeyPair, PubKey};
use peernet_types::{ConfidentialMessage, MetaData};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn of<T: Serialize>(value: &T) -> StorageResult<Self> {
        Ok(ContentHash(hash_data(&bincode::serialize(value)?)))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// A confidential message parked for a receiver that could not be reached directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailboxEntry {
    pub confidential_message: ConfidentialMessage,
    pub meta_data: MetaData,
    pub created_at: i64,
}

impl MailboxEntry {
    pub fn new(confidential_message: ConfidentialMessage, meta_data: MetaData, created_at: i64) -> Self {
        Self {
            confidential_message,
            meta_data,
            created_at,
        }
    }

    /// Hash of the stored content. The creation time is excluded so storing the same
    /// message twice maps to the same key.
    pub fn hash(&self) -> StorageResult<ContentHash> {
        ContentHash::of(&(&self.confidential_message, &self.meta_data))
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now.saturating_sub(self.created_at) > self.meta_data.ttl_ms as i64
    }
}

/// Signed removal of a mailbox entry. Only the receiver can produce it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveMailboxRequest {
    pub hash: ContentHash,
    pub receiver_public_key: PubKey,
    pub signature: Vec<u8>,
}

impl RemoveMailboxRequest {
    pub fn new(hash: ContentHash, receiver: &KeyPair) -> Self {
        Self {
            hash,
            receiver_public_key: receiver.public_key(),
            signature: receiver.sign(&hash.0),
        }
    }

    pub fn verify(&self, entry: &MailboxEntry) -> StorageResult<()> {
        if self.receiver_public_key.key_id() != entry.confidential_message.receiver_key_id {
            return Err(StorageError::Unauthorized {
                hash: self.hash,
                reason: "key does not match receiver".to_string(),
            });
        }
        verify_signature(&self.receiver_public_key.signing_key, &self.hash.0, &self.signature)
            .map_err(|_| StorageError::Unauthorized {
                hash: self.hash,
                reason: "bad signature".to_string(),
            })
    }
}

/// Public data signed by its owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthenticatedEntry {
    pub payload: Vec<u8>,
    pub meta_data: MetaData,
    pub owner: PubKey,
    pub created_at: i64,
    pub signature: Vec<u8>,
}

impl AuthenticatedEntry {
    pub fn new_signed(payload: Vec<u8>, meta_data: MetaData, owner: &KeyPair, created_at: i64) -> StorageResult<Self> {
        let owner_public = owner.public_key();
        let signature = owner.sign(&Self::signed_bytes(&payload, &meta_data, &owner_public)?);
        Ok(Self {
            payload,
            meta_data,
            owner: owner_public,
            created_at,
            signature,
        })
    }

    pub fn verify(&self) -> StorageResult<()> {
        let message = Self::signed_bytes(&self.payload, &self.meta_data, &self.owner)?;
        verify_signature(&self.owner.signing_key, &message, &self.signature)
            .map_err(|_| StorageError::InvalidSignature)
    }

    pub fn hash(&self) -> StorageResult<ContentHash> {
        ContentHash::of(&(&self.payload, &self.meta_data, &self.owner))
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now.saturating_sub(self.created_at) > self.meta_data.ttl_ms as i64
    }

    fn signed_bytes(payload: &[u8], meta_data: &MetaData, owner: &PubKey) -> StorageResult<Vec<u8>> {
        Ok(bincode::serialize(&(payload, meta_data, owner))?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveAuthenticatedRequest {
    pub hash: ContentHash,
    pub owner_public_key: PubKey,
    pub signature: Vec<u8>,
}

impl RemoveAuthenticatedRequest {
    pub fn new(hash: ContentHash, owner: &KeyPair) -> Self {
        Self {
            hash,
            owner_public_key: owner.public_key(),
            signature: owner.sign(&hash.0),
        }
    }

    pub fn verify(&self, entry: &AuthenticatedEntry) -> StorageResult<()> {
        if self.owner_public_key != entry.owner {
            return Err(StorageError::Unauthorized {
                hash: self.hash,
                reason: "not the owner".to_string(),
            });
        }
        verify_signature(&self.owner_public_key.signing_key, &self.hash.0, &self.signature)
            .map_err(|_| StorageError::Unauthorized {
                hash: self.hash,
                reason: "bad signature".to_string(),
            })
    }
}
