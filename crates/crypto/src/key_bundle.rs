use crate::KeyPair;
use parking_lot::RwLock;
use peernet_types::KeyId;
use std::collections::HashMap;
use tracing::debug;

/// Lookup of local key material. Key ids are what travels on the wire.
pub trait KeyBundleService: Send + Sync {
    fn find_key_pair(&self, key_id: &KeyId) -> Option<KeyPair>;

    /// Returns the key pair registered under `tag`, creating one on first use.
    fn get_or_create_key_pair(&self, tag: &str) -> KeyPair;
}

#[derive(Default)]
pub struct KeyBundleStore {
    tags: RwLock<HashMap<String, KeyId>>,
    key_pairs: RwLock<HashMap<KeyId, KeyPair>>,
}

impl KeyBundleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tag: impl Into<String>, key_pair: KeyPair) -> KeyId {
        let key_id = key_pair.key_id();
        self.key_pairs.write().insert(key_id.clone(), key_pair);
        self.tags.write().insert(tag.into(), key_id.clone());
        key_id
    }

    pub fn len(&self) -> usize {
        self.key_pairs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_pairs.read().is_empty()
    }
}

impl KeyBundleService for KeyBundleStore {
    fn find_key_pair(&self, key_id: &KeyId) -> Option<KeyPair> {
        self.key_pairs.read().get(key_id).cloned()
    }

    fn get_or_create_key_pair(&self, tag: &str) -> KeyPair {
        let mut tags = self.tags.write();
        if let Some(key_pair) = tags
            .get(tag)
            .and_then(|key_id| self.key_pairs.read().get(key_id).cloned())
        {
            return key_pair;
        }

        let key_pair = KeyPair::generate();
        let key_id = key_pair.key_id();
        debug!("Created key pair {} for tag {}", key_id, tag);
        self.key_pairs.write().insert(key_id.clone(), key_pair.clone());
        tags.insert(tag.to_string(), key_id);
        key_pair
    }
}
