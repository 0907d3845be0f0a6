//! In-process data store. Nodes sharing one instance see the same entries, which stands in
//! for a fully replicated network store.

use crate::data_store::{BroadcastFuture, BroadcastResult, DataStore, StoreEvent};
use crate::entry::{
    AuthenticatedEntry, ContentHash, MailboxEntry, RemoveAuthenticatedRequest,
    RemoveMailboxRequest,
};
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use peernet_common::{Clock, SystemClock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct Stored<T> {
    entry: T,
    size: u64,
}

pub struct InMemoryDataStore {
    mailbox: RwLock<HashMap<ContentHash, Stored<MailboxEntry>>>,
    authenticated: RwLock<HashMap<ContentHash, Stored<AuthenticatedEntry>>>,
    stored_bytes: AtomicU64,
    events: broadcast::Sender<StoreEvent>,
    clock: Arc<dyn Clock>,
    num_peers: usize,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            mailbox: RwLock::new(HashMap::new()),
            authenticated: RwLock::new(HashMap::new()),
            stored_bytes: AtomicU64::new(0),
            events,
            clock,
            num_peers: 1,
        }
    }

    /// Number of peers reported in every replication result.
    pub fn with_num_peers(mut self, num_peers: usize) -> Self {
        self.num_peers = num_peers;
        self
    }

    /// Removes every expired entry and notifies observers. Returns the number removed.
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now_millis();

        let expired_mailbox: Vec<ContentHash> = self
            .mailbox
            .read()
            .iter()
            .filter(|(_, stored)| stored.entry.is_expired(now))
            .map(|(hash, _)| *hash)
            .collect();
        let expired_authenticated: Vec<ContentHash> = self
            .authenticated
            .read()
            .iter()
            .filter(|(_, stored)| stored.entry.is_expired(now))
            .map(|(hash, _)| *hash)
            .collect();

        for hash in &expired_mailbox {
            if let Some(stored) = self.mailbox.write().remove(hash) {
                self.stored_bytes.fetch_sub(stored.size, Ordering::SeqCst);
                self.notify(StoreEvent::MailboxRemoved { hash: *hash });
            }
        }
        for hash in &expired_authenticated {
            if let Some(stored) = self.authenticated.write().remove(hash) {
                self.stored_bytes.fetch_sub(stored.size, Ordering::SeqCst);
                self.notify(StoreEvent::AuthenticatedRemoved { hash: *hash });
            }
        }

        let pruned = expired_mailbox.len() + expired_authenticated.len();
        if pruned > 0 {
            info!("Pruned {} expired entries", pruned);
        }
        pruned
    }

    pub fn contains_mailbox_entry(&self, hash: &ContentHash) -> bool {
        self.mailbox.read().contains_key(hash)
    }

    fn notify(&self, event: StoreEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn replicated(&self) -> BroadcastFuture {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(BroadcastResult {
            num_peers: self.num_peers,
            num_success: self.num_peers,
        });
        rx
    }
}

impl Default for InMemoryDataStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_capacity<T>(
    map: &HashMap<ContentHash, Stored<T>>,
    class_name: &str,
    max: usize,
    class_of: impl Fn(&T) -> &str,
) -> StorageResult<()> {
    let count = map
        .values()
        .filter(|stored| class_of(&stored.entry) == class_name)
        .count();
    if count >= max {
        return Err(StorageError::CapacityExceeded {
            class_name: class_name.to_string(),
            max,
        });
    }
    Ok(())
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn add_mailbox_entry(&self, entry: MailboxEntry) -> StorageResult<(ContentHash, BroadcastFuture)> {
        let hash = entry.hash()?;
        if entry.is_expired(self.clock.now_millis()) {
            return Err(StorageError::Expired { hash });
        }
        let size = bincode::serialized_size(&entry)?;

        {
            let mut mailbox = self.mailbox.write();
            if mailbox.contains_key(&hash) {
                return Err(StorageError::AlreadyExists { hash });
            }
            check_capacity(
                &mailbox,
                &entry.meta_data.class_name,
                entry.meta_data.max_map_size,
                |e: &MailboxEntry| e.meta_data.class_name.as_str(),
            )?;
            mailbox.insert(
                hash,
                Stored {
                    entry: entry.clone(),
                    size,
                },
            );
        }
        self.stored_bytes.fetch_add(size, Ordering::SeqCst);

        debug!("Added mailbox entry {} for key {}", hash, entry.confidential_message.receiver_key_id);
        self.notify(StoreEvent::MailboxAdded { hash, entry });
        Ok((hash, self.replicated()))
    }

    async fn remove_mailbox_entry(&self, request: RemoveMailboxRequest) -> StorageResult<BroadcastFuture> {
        let hash = request.hash;
        let removed = {
            let mut mailbox = self.mailbox.write();
            let stored = mailbox.get(&hash).ok_or(StorageError::NotFound { hash })?;
            request.verify(&stored.entry)?;
            mailbox.remove(&hash)
        };
        if let Some(stored) = removed {
            self.stored_bytes.fetch_sub(stored.size, Ordering::SeqCst);
        }

        debug!("Removed mailbox entry {}", hash);
        self.notify(StoreEvent::MailboxRemoved { hash });
        Ok(self.replicated())
    }

    async fn add_authenticated_entry(
        &self,
        entry: AuthenticatedEntry,
    ) -> StorageResult<(ContentHash, BroadcastFuture)> {
        entry.verify()?;
        let hash = entry.hash()?;
        if entry.is_expired(self.clock.now_millis()) {
            return Err(StorageError::Expired { hash });
        }
        let size = bincode::serialized_size(&entry)?;

        {
            let mut authenticated = self.authenticated.write();
            if authenticated.contains_key(&hash) {
                return Err(StorageError::AlreadyExists { hash });
            }
            check_capacity(
                &authenticated,
                &entry.meta_data.class_name,
                entry.meta_data.max_map_size,
                |e: &AuthenticatedEntry| e.meta_data.class_name.as_str(),
            )?;
            authenticated.insert(
                hash,
                Stored {
                    entry: entry.clone(),
                    size,
                },
            );
        }
        self.stored_bytes.fetch_add(size, Ordering::SeqCst);

        self.notify(StoreEvent::AuthenticatedAdded { hash, entry });
        Ok((hash, self.replicated()))
    }

    async fn remove_authenticated_entry(
        &self,
        request: RemoveAuthenticatedRequest,
    ) -> StorageResult<BroadcastFuture> {
        let hash = request.hash;
        let removed = {
            let mut authenticated = self.authenticated.write();
            let stored = authenticated.get(&hash).ok_or(StorageError::NotFound { hash })?;
            request.verify(&stored.entry)?;
            authenticated.remove(&hash)
        };
        if let Some(stored) = removed {
            self.stored_bytes.fetch_sub(stored.size, Ordering::SeqCst);
        }

        self.notify(StoreEvent::AuthenticatedRemoved { hash });
        Ok(self.replicated())
    }

    fn mailbox_entries(&self) -> Vec<(ContentHash, MailboxEntry)> {
        self.mailbox
            .read()
            .iter()
            .map(|(hash, stored)| (*hash, stored.entry.clone()))
            .collect()
    }

    fn authenticated_entries(&self) -> Vec<(ContentHash, AuthenticatedEntry)> {
        self.authenticated
            .read()
            .iter()
            .map(|(hash, stored)| (*hash, stored.entry.clone()))
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn stored_bytes(&self) -> u64 {
        self.stored_bytes.load(Ordering::SeqCst)
    }
}
