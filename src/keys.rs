use chrono::{DateTime, Utc};
use peernet_crypto::KeyPair;
use peernet_types::{PeerNetError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// On-disk form of a node key pair. Secrets are hex encoded.
#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    key_id: String,
    signing_secret: String,
    encryption_secret: String,
    created_at: DateTime<Utc>,
}

pub fn key_file_path(data_dir: impl AsRef<Path>, tag: &str) -> PathBuf {
    data_dir.as_ref().join("keys").join(format!("{}.json", tag))
}

/// Loads the key pair stored at `path`, generating and saving a new one if there is none.
pub async fn load_or_create_key_pair(path: &Path) -> Result<KeyPair> {
    if fs::try_exists(path).await.map_err(storage_error)? {
        return load_key_pair(path).await;
    }
    let key_pair = KeyPair::generate();
    save_key_pair(&key_pair, path).await?;
    Ok(key_pair)
}

pub async fn load_key_pair(path: &Path) -> Result<KeyPair> {
    info!("Loading key pair from {:?}", path);
    let json = fs::read_to_string(path).await.map_err(storage_error)?;
    let file: KeyFile = serde_json::from_str(&json).map_err(|e| PeerNetError::Serialization(e.to_string()))?;

    let key_pair = KeyPair::from_hex(&file.signing_secret, &file.encryption_secret)
        .map_err(|e| PeerNetError::CryptoError(e.to_string()))?;
    if key_pair.key_id().to_string() != file.key_id {
        return Err(PeerNetError::CryptoError(format!(
            "key file {:?} does not match its key id {}",
            path, file.key_id
        )));
    }
    Ok(key_pair)
}

pub async fn save_key_pair(key_pair: &KeyPair, path: &Path) -> Result<()> {
    info!("Saving key pair {} to {:?}", key_pair.key_id(), path);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await.map_err(storage_error)?;
    }

    let file = KeyFile {
        key_id: key_pair.key_id().to_string(),
        signing_secret: hex::encode(key_pair.signing_secret()),
        encryption_secret: hex::encode(key_pair.encryption_secret()),
        created_at: Utc::now(),
    };
    let json = serde_json::to_string_pretty(&file).map_err(|e| PeerNetError::Serialization(e.to_string()))?;
    fs::write(path, json).await.map_err(storage_error)?;
    Ok(())
}

fn storage_error(e: std::io::Error) -> PeerNetError {
    PeerNetError::StorageError(e.to_string())
}
