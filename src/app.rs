use crate::config::AppConfig;
use crate::keys;
use peernet_common::RateLimiter;
use peernet_crypto::{KeyBundleService, KeyBundleStore, KeyPair, PubKey};
use peernet_network::{
    ConfidentialMessageService, ConfidentialPayload, MessageListener, MessageSource,
    NetworkLoadExchangeService, NetworkLoadService, Node, TcpTransport, TransportRegistry,
};
use peernet_storage::{DataStore, InMemoryDataStore};
use peernet_types::{Address, KeyId, MetaData, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Plain text note exchanged between nodes. Kept in the mailbox when the receiver is offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextMessage {
    pub text: String,
}

impl ConfidentialPayload for TextMessage {
    fn mailbox_meta_data(&self) -> Option<MetaData> {
        Some(MetaData::new(MetaData::TTL_10_DAYS_MS, "TextMessage"))
    }
}

struct LoggingListener;

impl MessageListener<TextMessage> for LoggingListener {
    fn on_message(&self, message: &TextMessage, source: &MessageSource) {
        match source {
            MessageSource::Direct { sender } => info!("Message from {}: {}", sender, message.text),
            MessageSource::Mailbox { hash } => info!("Message from mailbox entry {}: {}", hash, message.text),
        }
    }
}

pub struct PeerNetApp {
    config: AppConfig,
    node: Arc<Node>,
    data_store: Arc<InMemoryDataStore>,
    key_bundles: Arc<KeyBundleStore>,
    key_pair: KeyPair,
}

impl PeerNetApp {
    /// Builds the node and loads the key pair under the data directory, creating it on
    /// first start.
    pub async fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;

        let registry = TransportRegistry::new().with_transport(Arc::new(TcpTransport::with_max_frame_bytes(
            config.network.max_frame_bytes,
        )));
        let node = Node::new(config.node_config()?, Arc::new(registry));

        let key_path = keys::key_file_path(&config.node.data_dir, &config.node.key_id_tag);
        let key_pair = keys::load_or_create_key_pair(&key_path).await?;
        let key_bundles = Arc::new(KeyBundleStore::new());
        key_bundles.insert(config.node.key_id_tag.clone(), key_pair.clone());

        info!("Initializing PeerNet node");
        info!("Listen address: {}", config.node.listen_addr);
        info!("Key id: {}", key_pair.key_id());

        Ok(Self {
            config,
            node,
            data_store: Arc::new(InMemoryDataStore::new()),
            key_bundles,
            key_pair,
        })
    }

    pub fn key_id(&self) -> KeyId {
        self.key_pair.key_id()
    }

    pub fn public_key(&self) -> PubKey {
        self.key_pair.public_key()
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Starts the node and every service on top of it, then runs until ctrl-c.
    pub async fn run(self) -> Result<()> {
        let address = self.node.start().await?;
        info!("Listening on {}", address);

        let data_store = Arc::clone(&self.data_store) as Arc<dyn DataStore>;

        let load_service = NetworkLoadService::new(
            Arc::clone(&self.node),
            Some(Arc::clone(&data_store)),
            self.config.load_service_config(),
        );
        load_service.initialize()?;

        let exchange = NetworkLoadExchangeService::new(Arc::clone(&self.node), self.config.exchange_config());
        exchange.initialize()?;

        let rate_limiter = Arc::new(RateLimiter::<Address>::new(self.config.rate_limit_config()));
        let confidential = ConfidentialMessageService::<TextMessage>::with_rate_limiter(
            Arc::clone(&self.node),
            Arc::clone(&self.key_bundles) as Arc<dyn KeyBundleService>,
            Some(data_store),
            self.config.confidential_config(),
            Arc::clone(&rate_limiter),
        )?;
        confidential.add_listener(Arc::new(LoggingListener));

        self.connect_bootstrap_peers().await?;

        let mut status = tokio::time::interval(STATUS_INTERVAL);
        loop {
            tokio::select! {
                _ = status.tick() => {
                    let connections = self.node.connections().await;
                    let swept = housekeeping(&self.data_store, &rate_limiter, &*confidential);
                    info!(
                        "Status: {} peers connected {:?}, my load {}, {:?}",
                        connections.len(),
                        connections.iter().map(|c| c.peer_address().to_string()).collect::<Vec<_>>(),
                        self.node.network_load().current(),
                        swept
                    );
                }
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!("Failed to listen for ctrl-c: {}", e);
                    }
                    break;
                }
            }
        }

        info!("Shutting down");
        confidential.shutdown();
        exchange.shutdown();
        load_service.shutdown();
        self.node.shutdown().await;
        info!("Node stopped");
        Ok(())
    }

    async fn connect_bootstrap_peers(&self) -> Result<()> {
        let peers = self.config.bootstrap_peers()?;
        if peers.is_empty() {
            return Ok(());
        }

        info!("Connecting to {} bootstrap peers...", peers.len());
        for peer in peers {
            match self.node.connect(&peer).await {
                Ok(connection) => info!("Connected to bootstrap peer {} ({})", peer, connection.id()),
                Err(e) => warn!("Failed to connect to bootstrap peer {}: {}", peer, e),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Housekeeping {
    pub idle_senders: usize,
    pub expired_entries: usize,
    pub forgotten_digests: usize,
}

/// Periodic cleanup of state that would otherwise grow for the lifetime of the node.
pub fn housekeeping<M: ConfidentialPayload>(
    data_store: &InMemoryDataStore,
    rate_limiter: &RateLimiter<Address>,
    confidential: &ConfidentialMessageService<M>,
) -> Housekeeping {
    Housekeeping {
        idle_senders: rate_limiter.cleanup_idle(),
        expired_entries: data_store.prune_expired(),
        forgotten_digests: confidential.prune_processed(chrono::Utc::now().timestamp_millis()),
    }
}
