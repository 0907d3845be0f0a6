//! Encrypted and signed delivery of application messages, with a mailbox fallback through
//! the data store when the receiver cannot be reached directly.
//!
//! Inbound messages arrive either over a live connection or as mailbox entries observed in
//! the data store. Both paths share [`ConfidentialMessageService::process`]: key lookup,
//! decryption on the blocking pool, then hand-off to a single dispatch thread so every
//! listener sees messages in the same order.

use crate::connection::Connection;
use crate::envelope::EnvelopePayload;
use crate::error::{NetworkError, NetworkResult};
use crate::network_load::snapshot::now_millis;
use crate::node::{ListenerHandle, Node, NodeListener};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use peernet_common::RateLimiter;
use peernet_crypto::{
    encrypt_and_sign, hash_data, verify_and_decrypt, KeyBundleService, KeyPair, PubKey,
    SenderPublicKey,
};
use peernet_storage::{
    BroadcastFuture, ContentHash, DataStore, MailboxEntry, RemoveMailboxRequest, StorageError,
    StoreEvent,
};
use peernet_types::{Address, ConfidentialMessage, MessageDeliveryStatus, MetaData};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// An application message that can travel confidentially.
pub trait ConfidentialPayload: Serialize + DeserializeOwned + Clone + Send + Sync + Debug + 'static {
    /// Retention used when the receiver is unreachable. `None` means direct delivery only.
    fn mailbox_meta_data(&self) -> Option<MetaData> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageSource {
    Direct { sender: Address },
    Mailbox { hash: ContentHash },
}

#[derive(Debug, Clone)]
pub struct DecryptedMessage<M> {
    pub message: M,
    pub sender_public_key: PubKey,
    pub source: MessageSource,
}

/// Receives decrypted messages on the dispatch thread.
pub trait MessageListener<M>: Send + Sync {
    fn on_message(&self, message: &M, source: &MessageSource);

    fn on_confidential_message(&self, _message: &DecryptedMessage<M>) {}
}

#[derive(Debug)]
pub struct SendConfidentialMessageResult {
    pub status: MessageDeliveryStatus,
    pub error: Option<String>,
    pub mailbox_hash: Option<ContentHash>,
    /// Replication result of the mailbox write. `None` if the entry already existed.
    pub mailbox_future: Option<BroadcastFuture>,
}

impl SendConfidentialMessageResult {
    fn sent() -> Self {
        Self {
            status: MessageDeliveryStatus::Sent,
            error: None,
            mailbox_hash: None,
            mailbox_future: None,
        }
    }

    fn failed(error: impl ToString) -> Self {
        Self {
            status: MessageDeliveryStatus::Failed,
            error: Some(error.to_string()),
            mailbox_hash: None,
            mailbox_future: None,
        }
    }

    fn added_to_mailbox(hash: ContentHash, future: Option<BroadcastFuture>, cause: String) -> Self {
        Self {
            status: MessageDeliveryStatus::AddedToMailbox,
            error: Some(cause),
            mailbox_hash: Some(hash),
            mailbox_future: future,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.status == MessageDeliveryStatus::Sent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No local key matches the receiver key id.
    NotAddressedToUs,
    Dropped,
    Duplicate,
    /// Mailbox entry past its time to live.
    Expired,
    Dispatched,
}

#[derive(Debug, Clone, Copy)]
pub struct ConfidentialConfig {
    pub dispatch_channel_capacity: usize,
}

impl Default for ConfidentialConfig {
    fn default() -> Self {
        Self {
            dispatch_channel_capacity: 1024,
        }
    }
}

pub struct ConfidentialMessageService<M: ConfidentialPayload> {
    node: Arc<Node>,
    key_bundles: Arc<dyn KeyBundleService>,
    data_store: Option<Arc<dyn DataStore>>,
    config: ConfidentialConfig,
    rate_limiter: Option<Arc<RateLimiter<Address>>>,
    listeners: Arc<RwLock<Vec<Arc<dyn MessageListener<M>>>>>,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<DecryptedMessage<M>>>>>,
    dispatch_tx: Mutex<Option<mpsc::Sender<DecryptedMessage<M>>>>,
    /// Digests of handled plaintexts, kept until they can no longer be redelivered.
    processed: DashMap<[u8; 32], i64>,
    node_listener: Mutex<Option<ListenerHandle>>,
    store_observer: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl<M: ConfidentialPayload> ConfidentialMessageService<M> {
    /// Starts the dispatch thread, listens for inbound messages and processes mailbox
    /// entries already in the store. Must be called from within a tokio runtime.
    pub fn new(
        node: Arc<Node>,
        key_bundles: Arc<dyn KeyBundleService>,
        data_store: Option<Arc<dyn DataStore>>,
        config: ConfidentialConfig,
    ) -> NetworkResult<Arc<Self>> {
        Self::build(node, key_bundles, data_store, config, None)
    }

    /// Like [`ConfidentialMessageService::new`], additionally dropping direct messages from
    /// senders that exceed `rate_limiter`.
    pub fn with_rate_limiter(
        node: Arc<Node>,
        key_bundles: Arc<dyn KeyBundleService>,
        data_store: Option<Arc<dyn DataStore>>,
        config: ConfidentialConfig,
        rate_limiter: Arc<RateLimiter<Address>>,
    ) -> NetworkResult<Arc<Self>> {
        Self::build(node, key_bundles, data_store, config, Some(rate_limiter))
    }

    fn build(
        node: Arc<Node>,
        key_bundles: Arc<dyn KeyBundleService>,
        data_store: Option<Arc<dyn DataStore>>,
        config: ConfidentialConfig,
        rate_limiter: Option<Arc<RateLimiter<Address>>>,
    ) -> NetworkResult<Arc<Self>> {
        let listeners: Arc<RwLock<Vec<Arc<dyn MessageListener<M>>>>> = Arc::new(RwLock::new(Vec::new()));
        let subscribers = Arc::new(Mutex::new(Vec::new()));
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_channel_capacity.max(1));
        spawn_dispatch_thread(dispatch_rx, Arc::clone(&listeners), Arc::clone(&subscribers))?;

        let service = Arc::new(Self {
            node,
            key_bundles,
            data_store,
            config,
            rate_limiter,
            listeners,
            subscribers,
            dispatch_tx: Mutex::new(Some(dispatch_tx)),
            processed: DashMap::new(),
            node_listener: Mutex::new(None),
            store_observer: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let node_listener = service.node.add_listener(Arc::new(InboundListener {
            service: Arc::downgrade(&service),
        }));
        *service.node_listener.lock() = Some(node_listener);

        if let Some(store) = service.data_store.clone() {
            let observer = tokio::spawn(observe_mailbox(Arc::downgrade(&service), store));
            *service.store_observer.lock() = Some(observer);
        }

        info!("Confidential message service started");
        Ok(service)
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageListener<M>>) {
        self.listeners.write().push(listener);
    }

    /// Channel of every dispatched message, for subsystems that prefer a consumer task.
    pub fn subscribe(&self) -> mpsc::Receiver<DecryptedMessage<M>> {
        let (tx, rx) = mpsc::channel(self.config.dispatch_channel_capacity.max(1));
        self.subscribers.lock().push(tx);
        rx
    }

    /// Encrypts `message` to `receiver` and tries direct delivery, then the mailbox if the
    /// message supports it. Never retries.
    pub async fn send(
        &self,
        message: &M,
        destination: &Address,
        receiver: &PubKey,
        sender: &KeyPair,
    ) -> SendConfidentialMessageResult {
        if self.shut_down.load(Ordering::SeqCst) {
            return SendConfidentialMessageResult::failed(NetworkError::Shutdown);
        }

        let confidential_message = match seal(message, receiver, sender) {
            Ok(confidential_message) => confidential_message,
            Err(e) => {
                warn!("Failed to encrypt {:?}: {}", message, e);
                return SendConfidentialMessageResult::failed(e);
            }
        };

        let direct = if self.node.is_running() {
            self.node
                .send_to(
                    destination,
                    EnvelopePayload::ConfidentialMessage(confidential_message.clone()),
                )
                .await
                .map(|_| ())
        } else {
            Err(NetworkError::InvalidState(format!("node is {:?}", self.node.state())))
        };

        match direct {
            Ok(()) => {
                debug!("Sent confidential message to {}", destination);
                SendConfidentialMessageResult::sent()
            }
            Err(e) => {
                debug!("Direct delivery to {} failed: {}", destination, e);
                self.send_to_mailbox(message, confidential_message, e).await
            }
        }
    }

    async fn send_to_mailbox(
        &self,
        message: &M,
        confidential_message: ConfidentialMessage,
        cause: NetworkError,
    ) -> SendConfidentialMessageResult {
        let Some(meta_data) = message.mailbox_meta_data() else {
            return SendConfidentialMessageResult::failed(cause);
        };
        let Some(store) = self.data_store.as_ref() else {
            warn!("No data store available for mailbox delivery");
            return SendConfidentialMessageResult::failed(cause);
        };

        let entry = MailboxEntry::new(confidential_message, meta_data, now_millis());
        match store.add_mailbox_entry(entry).await {
            Ok((hash, future)) => {
                info!("Added message to mailbox as {}", hash);
                SendConfidentialMessageResult::added_to_mailbox(hash, Some(future), cause.to_string())
            }
            Err(StorageError::AlreadyExists { hash }) => {
                debug!("Mailbox entry {} already exists", hash);
                SendConfidentialMessageResult::added_to_mailbox(hash, None, cause.to_string())
            }
            Err(e) => {
                warn!("Failed to add message to mailbox: {}", e);
                SendConfidentialMessageResult::failed(e)
            }
        }
    }

    /// Decrypts and dispatches one inbound message. Mailbox entries are removed from the
    /// store once their message was handed to the dispatch thread, or found to be a repeat.
    pub async fn process(&self, message: ConfidentialMessage, source: MessageSource) -> ProcessOutcome {
        let remember_until = now_millis().saturating_add(MetaData::TTL_10_DAYS_MS as i64);
        self.process_until(message, source, remember_until).await
    }

    /// Processes a stored entry unless its time to live has run out.
    async fn process_entry(&self, hash: ContentHash, entry: MailboxEntry) -> ProcessOutcome {
        if entry.is_expired(now_millis()) {
            debug!("Skipping expired mailbox entry {}", hash);
            return ProcessOutcome::Expired;
        }
        let remember_until = entry.created_at.saturating_add(entry.meta_data.ttl_ms as i64);
        self.process_until(entry.confidential_message, MessageSource::Mailbox { hash }, remember_until)
            .await
    }

    async fn process_until(&self, message: ConfidentialMessage, source: MessageSource, remember_until: i64) -> ProcessOutcome {
        let Some(key_pair) = self.key_bundles.find_key_pair(&message.receiver_key_id) else {
            return ProcessOutcome::NotAddressedToUs;
        };

        let data = message.confidential_data;
        let decrypt_key = key_pair.clone();
        let decrypted = tokio::task::spawn_blocking(move || open::<M>(&data, &decrypt_key)).await;
        let (payload, sender_public_key, digest) = match decrypted {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                warn!("Dropping confidential message from {:?}: {}", source, e);
                return ProcessOutcome::Dropped;
            }
            Err(e) => {
                error!("Decryption task failed: {}", e);
                return ProcessOutcome::Dropped;
            }
        };

        let repeated = match self.processed.entry(digest) {
            dashmap::mapref::entry::Entry::Occupied(mut seen) => {
                if *seen.get() < remember_until {
                    seen.insert(remember_until);
                }
                true
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(remember_until);
                false
            }
        };
        if repeated {
            debug!("Ignoring already processed message from {:?}", source);
            if let MessageSource::Mailbox { hash } = source {
                self.remove_mailbox_entry(hash, &key_pair).await;
            }
            return ProcessOutcome::Duplicate;
        }

        let dispatch_tx = self.dispatch_tx.lock().clone();
        let Some(dispatch_tx) = dispatch_tx else {
            return ProcessOutcome::Dropped;
        };
        let decrypted = DecryptedMessage {
            message: payload,
            sender_public_key,
            source: source.clone(),
        };
        if dispatch_tx.send(decrypted).await.is_err() {
            return ProcessOutcome::Dropped;
        }

        if let MessageSource::Mailbox { hash } = source {
            self.remove_mailbox_entry(hash, &key_pair).await;
        }
        ProcessOutcome::Dispatched
    }

    /// Forgets processed digests whose retention ended before `now`.
    pub fn prune_processed(&self, now: i64) -> usize {
        let before = self.processed.len();
        self.processed.retain(|_, remember_until| *remember_until >= now);
        before - self.processed.len()
    }

    pub fn num_processed(&self) -> usize {
        self.processed.len()
    }

    async fn remove_mailbox_entry(&self, hash: ContentHash, receiver: &KeyPair) {
        let Some(store) = self.data_store.as_ref() else { return };
        match store
            .remove_mailbox_entry(RemoveMailboxRequest::new(hash, receiver))
            .await
        {
            Ok(_) => debug!("Removed mailbox entry {}", hash),
            Err(e) => warn!("Failed to remove mailbox entry {}: {}", hash, e),
        }
    }

    async fn on_direct_message(&self, message: &ConfidentialMessage, connection: &Arc<Connection>, sender: &Address) {
        if let Some(rate_limiter) = &self.rate_limiter {
            if rate_limiter.exceeds_limit(sender) {
                warn!(
                    "Rate limit exceeded by {}, dropping message on connection {}",
                    sender,
                    connection.id()
                );
                return;
            }
        }
        self.process(
            message.clone(),
            MessageSource::Direct {
                sender: sender.clone(),
            },
        )
        .await;
    }

    /// Stops receiving. Messages already queued are still dispatched.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.node_listener.lock().take();
        if let Some(observer) = self.store_observer.lock().take() {
            observer.abort();
        }
        self.dispatch_tx.lock().take();
        info!("Confidential message service stopped");
    }
}

fn seal<M: Serialize>(message: &M, receiver: &PubKey, sender: &KeyPair) -> NetworkResult<ConfidentialMessage> {
    let plaintext = bincode::serialize(message).map_err(|e| NetworkError::Serialization(e.to_string()))?;
    let confidential_data = encrypt_and_sign(&plaintext, receiver, sender)?;
    Ok(ConfidentialMessage {
        confidential_data,
        receiver_key_id: receiver.key_id(),
    })
}

fn open<M: DeserializeOwned>(
    data: &peernet_types::ConfidentialData,
    receiver: &KeyPair,
) -> NetworkResult<(M, PubKey, [u8; 32])> {
    let plaintext = verify_and_decrypt(data, receiver)?;
    let message = bincode::deserialize(&plaintext).map_err(|e| NetworkError::DeserializationFailed(e.to_string()))?;
    Ok((message, data.sender_public_key(), hash_data(&plaintext)))
}

fn spawn_dispatch_thread<M: ConfidentialPayload>(
    mut dispatch_rx: mpsc::Receiver<DecryptedMessage<M>>,
    listeners: Arc<RwLock<Vec<Arc<dyn MessageListener<M>>>>>,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<DecryptedMessage<M>>>>>,
) -> NetworkResult<()> {
    std::thread::Builder::new()
        .name("confidential-dispatch".to_string())
        .spawn(move || {
            while let Some(decrypted) = dispatch_rx.blocking_recv() {
                let current: Vec<_> = listeners.read().clone();
                for listener in current {
                    let delivered = catch_unwind(AssertUnwindSafe(|| {
                        listener.on_message(&decrypted.message, &decrypted.source);
                        listener.on_confidential_message(&decrypted);
                    }));
                    if delivered.is_err() {
                        error!("Message listener panicked while handling {:?}", decrypted.message);
                    }
                }

                let current: Vec<_> = subscribers.lock().clone();
                let mut any_closed = false;
                for subscriber in current {
                    match subscriber.try_send(decrypted.clone()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!("Subscriber queue full, dropping {:?}", decrypted.message);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => any_closed = true,
                    }
                }
                if any_closed {
                    subscribers.lock().retain(|subscriber| !subscriber.is_closed());
                }
            }
            debug!("Confidential dispatch thread stopped");
        })?;
    Ok(())
}

async fn observe_mailbox<M: ConfidentialPayload>(service: Weak<ConfidentialMessageService<M>>, store: Arc<dyn DataStore>) {
    let mut events = store.subscribe();
    // Subscribed first so nothing added during the scan is missed.
    let mut rescan = true;
    loop {
        if rescan {
            for (hash, entry) in store.mailbox_entries() {
                let Some(service) = service.upgrade() else { return };
                service.process_entry(hash, entry).await;
            }
            rescan = false;
        }

        match events.recv().await {
            Ok(StoreEvent::MailboxAdded { hash, entry }) => {
                let Some(service) = service.upgrade() else { return };
                service.process_entry(hash, entry).await;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("Mailbox observer skipped {} store events, rescanning", skipped);
                rescan = true;
            }
            Err(RecvError::Closed) => return,
        }
    }
}

struct InboundListener<M: ConfidentialPayload> {
    service: Weak<ConfidentialMessageService<M>>,
}

#[async_trait]
impl<M: ConfidentialPayload> NodeListener for InboundListener<M> {
    async fn on_message(&self, payload: &EnvelopePayload, connection: &Arc<Connection>, sender: &Address) {
        let EnvelopePayload::ConfidentialMessage(message) = payload else { return };
        if let Some(service) = self.service.upgrade() {
            service.on_direct_message(message, connection, sender).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeConfig;
    use crate::transport::{MemoryNetwork, MemoryTransport, TransportRegistry};
    use peernet_crypto::KeyBundleStore;
    use peernet_storage::InMemoryDataStore;
    use peernet_types::TransportType;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
        mailbox: bool,
    }

    impl ConfidentialPayload for Note {
        fn mailbox_meta_data(&self) -> Option<MetaData> {
            self.mailbox
                .then(|| MetaData::new(MetaData::TTL_10_DAYS_MS, "Note"))
        }
    }

    struct Collector {
        tx: std::sync::mpsc::Sender<(Note, MessageSource)>,
    }

    impl MessageListener<Note> for Collector {
        fn on_message(&self, message: &Note, source: &MessageSource) {
            let _ = self.tx.send((message.clone(), source.clone()));
        }
    }

    fn offline_node() -> Arc<Node> {
        let registry = TransportRegistry::new().with_transport(Arc::new(MemoryTransport::new(
            MemoryNetwork::new(),
            TransportType::Clear,
        )));
        Node::new(NodeConfig::default(), Arc::new(registry))
    }

    fn service(
        key_bundles: Arc<KeyBundleStore>,
        store: Option<Arc<InMemoryDataStore>>,
    ) -> Arc<ConfidentialMessageService<Note>> {
        ConfidentialMessageService::new(
            offline_node(),
            key_bundles,
            store.map(|store| store as Arc<dyn DataStore>),
            ConfidentialConfig::default(),
        )
        .unwrap()
    }

    fn note(text: &str, mailbox: bool) -> Note {
        Note {
            text: text.to_string(),
            mailbox,
        }
    }

    #[tokio::test]
    async fn test_process_dispatches_once() {
        let receiver = KeyPair::generate();
        let key_bundles = Arc::new(KeyBundleStore::new());
        key_bundles.insert("default", receiver.clone());
        let service = service(key_bundles, None);

        let (tx, rx) = std::sync::mpsc::channel();
        service.add_listener(Arc::new(Collector { tx }));

        let message = seal(&note("hi", false), &receiver.public_key(), &KeyPair::generate()).unwrap();
        let source = MessageSource::Direct {
            sender: Address::localhost(1),
        };
        assert_eq!(
            service.process(message.clone(), source.clone()).await,
            ProcessOutcome::Dispatched
        );
        assert_eq!(service.process(message, source).await, ProcessOutcome::Duplicate);

        let (received, _) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(received, note("hi", false));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[tokio::test]
    async fn test_unknown_key_is_not_addressed_to_us() {
        let service = service(Arc::new(KeyBundleStore::new()), None);
        let message = seal(&note("hi", false), &KeyPair::generate().public_key(), &KeyPair::generate()).unwrap();

        assert_eq!(
            service
                .process(message, MessageSource::Direct { sender: Address::localhost(1) })
                .await,
            ProcessOutcome::NotAddressedToUs
        );
    }

    #[tokio::test]
    async fn test_tampered_message_is_dropped() {
        let receiver = KeyPair::generate();
        let key_bundles = Arc::new(KeyBundleStore::new());
        key_bundles.insert("default", receiver.clone());
        let service = service(key_bundles, None);

        let mut message = seal(&note("hi", false), &receiver.public_key(), &KeyPair::generate()).unwrap();
        message.confidential_data.cipher_text[0] ^= 0x01;

        assert_eq!(
            service
                .process(message, MessageSource::Direct { sender: Address::localhost(1) })
                .await,
            ProcessOutcome::Dropped
        );
    }

    #[tokio::test]
    async fn test_not_running_node_uses_mailbox() {
        let store = Arc::new(InMemoryDataStore::new());
        let service = service(Arc::new(KeyBundleStore::new()), Some(Arc::clone(&store)));
        let receiver = KeyPair::generate().public_key();
        let sender = KeyPair::generate();

        let result = service
            .send(&note("later", true), &Address::localhost(9), &receiver, &sender)
            .await;
        assert_eq!(result.status, MessageDeliveryStatus::AddedToMailbox);
        assert!(result.mailbox_future.is_some());
        assert_eq!(store.mailbox_entries().len(), 1);

        let result = service
            .send(&note("now", false), &Address::localhost(9), &receiver, &sender)
            .await;
        assert_eq!(result.status, MessageDeliveryStatus::Failed);
        assert_eq!(store.mailbox_entries().len(), 1);
    }

    #[tokio::test]
    async fn test_mailbox_without_store_fails() {
        let service = service(Arc::new(KeyBundleStore::new()), None);
        let result = service
            .send(
                &note("later", true),
                &Address::localhost(9),
                &KeyPair::generate().public_key(),
                &KeyPair::generate(),
            )
            .await;
        assert_eq!(result.status, MessageDeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let service = service(Arc::new(KeyBundleStore::new()), None);
        service.shutdown();
        let result = service
            .send(
                &note("hi", true),
                &Address::localhost(9),
                &KeyPair::generate().public_key(),
                &KeyPair::generate(),
            )
            .await;
        assert_eq!(result.status, MessageDeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn test_subscribe_receives_dispatched_messages() {
        let receiver = KeyPair::generate();
        let key_bundles = Arc::new(KeyBundleStore::new());
        key_bundles.insert("default", receiver.clone());
        let service = service(key_bundles, None);
        let mut subscription = service.subscribe();

        let message = seal(&note("stream", false), &receiver.public_key(), &KeyPair::generate()).unwrap();
        service
            .process(message, MessageSource::Direct { sender: Address::localhost(1) })
            .await;

        let decrypted = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decrypted.message, note("stream", false));
    }

    fn receiver_service(
        store: Option<Arc<InMemoryDataStore>>,
        config: ConfidentialConfig,
    ) -> (KeyPair, Arc<ConfidentialMessageService<Note>>) {
        let receiver = KeyPair::generate();
        let key_bundles = Arc::new(KeyBundleStore::new());
        key_bundles.insert("default", receiver.clone());
        let service = ConfidentialMessageService::new(
            offline_node(),
            key_bundles,
            store.map(|store| store as Arc<dyn DataStore>),
            config,
        )
        .unwrap();
        (receiver, service)
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_stall_listeners() {
        let (receiver, service) = receiver_service(None, ConfidentialConfig { dispatch_channel_capacity: 1 });
        let (tx, rx) = std::sync::mpsc::channel();
        service.add_listener(Arc::new(Collector { tx }));
        let _never_drained = service.subscribe();

        let sender = KeyPair::generate();
        for text in ["one", "two", "three"] {
            let message = seal(&note(text, false), &receiver.public_key(), &sender).unwrap();
            service
                .process(message, MessageSource::Direct { sender: Address::localhost(1) })
                .await;
        }

        for text in ["one", "two", "three"] {
            let (received, _) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(received.text, text);
        }
    }

    #[tokio::test]
    async fn test_pruned_digest_is_dispatched_again() {
        let (receiver, service) = receiver_service(None, ConfidentialConfig::default());
        let message = seal(&note("again", false), &receiver.public_key(), &KeyPair::generate()).unwrap();
        let source = MessageSource::Direct {
            sender: Address::localhost(1),
        };

        assert_eq!(
            service.process(message.clone(), source.clone()).await,
            ProcessOutcome::Dispatched
        );
        assert_eq!(service.prune_processed(now_millis()), 0);
        assert_eq!(service.num_processed(), 1);

        let after_retention = now_millis() + MetaData::TTL_10_DAYS_MS as i64 + 1_000;
        assert_eq!(service.prune_processed(after_retention), 1);
        assert_eq!(service.num_processed(), 0);
        assert_eq!(service.process(message, source).await, ProcessOutcome::Dispatched);
    }

    #[tokio::test]
    async fn test_expired_mailbox_entry_is_skipped() {
        // The store's clock sits at the epoch so it still accepts the stale entry.
        let store = Arc::new(InMemoryDataStore::with_clock(Arc::new(peernet_common::ManualClock::new(0))));
        let (receiver, service) = receiver_service(None, ConfidentialConfig::default());
        let (tx, rx) = std::sync::mpsc::channel();
        service.add_listener(Arc::new(Collector { tx }));

        let message = seal(&note("stale", true), &receiver.public_key(), &KeyPair::generate()).unwrap();
        let entry = MailboxEntry::new(message, MetaData::new(60_000, "Note"), 0);
        let (hash, _) = store.add_mailbox_entry(entry.clone()).await.unwrap();

        assert_eq!(service.process_entry(hash, entry).await, ProcessOutcome::Expired);
        assert_eq!(service.num_processed(), 0);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[tokio::test]
    async fn test_repeated_mailbox_message_is_removed() {
        let store = Arc::new(InMemoryDataStore::new());
        let message_sender = KeyPair::generate();
        let (receiver, service) = receiver_service(Some(Arc::clone(&store)), ConfidentialConfig::default());
        let (tx, rx) = std::sync::mpsc::channel();
        service.add_listener(Arc::new(Collector { tx }));

        // Same sealed message stored under two meta data, so two entries carry one plaintext.
        let message = seal(&note("twice", true), &receiver.public_key(), &message_sender).unwrap();
        for class_name in ["Note", "NoteCopy"] {
            let entry = MailboxEntry::new(
                message.clone(),
                MetaData::new(MetaData::TTL_10_DAYS_MS, class_name),
                now_millis(),
            );
            store.add_mailbox_entry(entry).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while !store.mailbox_entries().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let (received, _) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(received.text, "twice");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
