use crate::entry::ContentHash;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entry {hash} already stored")]
    AlreadyExists { hash: ContentHash },

    #[error("Entry {hash} is expired")]
    Expired { hash: ContentHash },

    #[error("Entry {hash} not found")]
    NotFound { hash: ContentHash },

    #[error("Unauthorized removal of {hash}: {reason}")]
    Unauthorized { hash: ContentHash, reason: String },

    #[error("Store for {class_name} is full ({max} entries)")]
    CapacityExceeded { class_name: String, max: usize },

    #[error("Invalid entry signature")]
    InvalidSignature,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}
