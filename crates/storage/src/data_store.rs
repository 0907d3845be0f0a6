use crate::entry::{
    AuthenticatedEntry, ContentHash, MailboxEntry, RemoveAuthenticatedRequest,
    RemoveMailboxRequest,
};
use crate::error::StorageResult;
use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};

/// Outcome of replicating one change to the peers of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastResult {
    pub num_peers: usize,
    pub num_success: usize,
}

impl BroadcastResult {
    pub fn is_success(&self) -> bool {
        self.num_success > 0 || self.num_peers == 0
    }
}

/// Resolves once replication of a change finished. Never awaited on the send path.
pub type BroadcastFuture = oneshot::Receiver<BroadcastResult>;

#[derive(Debug, Clone)]
pub enum StoreEvent {
    MailboxAdded { hash: ContentHash, entry: MailboxEntry },
    MailboxRemoved { hash: ContentHash },
    AuthenticatedAdded { hash: ContentHash, entry: AuthenticatedEntry },
    AuthenticatedRemoved { hash: ContentHash },
}

/// The distributed data store as seen by this node.
///
/// At most one entry exists per content hash. Adding an existing entry fails with
/// `AlreadyExists` and does not notify observers again.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn add_mailbox_entry(&self, entry: MailboxEntry) -> StorageResult<(ContentHash, BroadcastFuture)>;

    async fn remove_mailbox_entry(&self, request: RemoveMailboxRequest) -> StorageResult<BroadcastFuture>;

    async fn add_authenticated_entry(
        &self,
        entry: AuthenticatedEntry,
    ) -> StorageResult<(ContentHash, BroadcastFuture)>;

    async fn remove_authenticated_entry(
        &self,
        request: RemoveAuthenticatedRequest,
    ) -> StorageResult<BroadcastFuture>;

    fn mailbox_entries(&self) -> Vec<(ContentHash, MailboxEntry)>;

    fn authenticated_entries(&self) -> Vec<(ContentHash, AuthenticatedEntry)>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

    /// Serialized size of everything currently stored.
    fn stored_bytes(&self) -> u64;
}
