pub mod data_store;
pub mod entry;
pub mod error;
pub mod memory;

pub use data_store::{BroadcastFuture, BroadcastResult, DataStore, StoreEvent};
pub use entry::{
    AuthenticatedEntry, ContentHash, MailboxEntry, RemoveAuthenticatedRequest,
    RemoveMailboxRequest,
};
pub use error::{StorageError, StorageResult};
pub use memory::InMemoryDataStore;
