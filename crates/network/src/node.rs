//! A peer node: owns the transports, the live connections and the listener fan-out.

use crate::connection::{Connection, Direction};
use crate::envelope::{EnvelopePayload, NetworkEnvelope};
use crate::error::{NetworkError, NetworkResult};
use crate::network_load::NetworkLoadSnapshot;
use crate::transport::{FrameSink, FrameStream, Listening, RawLink, Transport, TransportRegistry};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use peernet_types::{Address, CloseReason};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const AWAIT_CONNECTION_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_address: Address,
    pub connect_timeout: Duration,
    pub event_channel_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_address: Address::localhost(9000),
            connect_timeout: Duration::from_secs(10),
            event_channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
}

#[derive(Debug, Clone)]
pub enum NodeEvent {
    Message {
        connection: Arc<Connection>,
        sender: Address,
        payload: EnvelopePayload,
    },
    Connected(Arc<Connection>),
    Disconnected {
        connection: Arc<Connection>,
        reason: CloseReason,
    },
}

/// Observer of a node's traffic. Every listener is driven by its own consumer task fed by a
/// bounded queue. A panicking listener affects no other listener; a slow one slows the
/// node down instead of missing events.
///
/// Closing a connection from inside a callback publishes into the caller's own queue; keep
/// such work off the callback when the queue can fill.
#[async_trait]
pub trait NodeListener: Send + Sync {
    async fn on_message(&self, payload: &EnvelopePayload, connection: &Arc<Connection>, sender: &Address);

    async fn on_connection(&self, _connection: &Arc<Connection>) {}

    async fn on_disconnect(&self, _connection: &Arc<Connection>, _reason: CloseReason) {}
}

/// Keeps a listener registered. Dropping it removes the listener.
pub struct ListenerHandle {
    id: u64,
    listeners: Weak<RwLock<Vec<ListenerQueue>>>,
    task: JoinHandle<()>,
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.write().retain(|queue| queue.id != self.id);
        }
    }
}

#[derive(Clone)]
struct ListenerQueue {
    id: u64,
    tx: mpsc::Sender<NodeEvent>,
}

pub struct Node {
    config: NodeConfig,
    registry: Arc<TransportRegistry>,
    state: RwLock<NodeState>,
    my_address: RwLock<Address>,
    connections: AsyncRwLock<HashMap<Address, Arc<Connection>>>,
    dialing: DashMap<Address, Arc<AsyncMutex<()>>>,
    listeners: Arc<RwLock<Vec<ListenerQueue>>>,
    next_listener_id: AtomicU64,
    network_load: NetworkLoadSnapshot,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// The node takes ownership of the transports in `registry`; shutdown closes them.
    pub fn new(config: NodeConfig, registry: Arc<TransportRegistry>) -> Arc<Self> {
        Arc::new(Self {
            my_address: RwLock::new(config.listen_address.clone()),
            config,
            registry,
            state: RwLock::new(NodeState::New),
            connections: AsyncRwLock::new(HashMap::new()),
            dialing: DashMap::new(),
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_listener_id: AtomicU64::new(0),
            network_load: NetworkLoadSnapshot::default(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Binds the listen address and starts accepting. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> NetworkResult<Address> {
        {
            let mut state = self.state.write();
            if *state != NodeState::New {
                return Err(NetworkError::InvalidState(format!("cannot start a {:?} node", *state)));
            }
            *state = NodeState::Starting;
        }

        let listen_address = self.config.listen_address.clone();
        let listening = match self.bind(&listen_address).await {
            Ok(listening) => listening,
            Err(e) => {
                *self.state.write() = NodeState::New;
                return Err(e);
            }
        };
        let local_address = listening.local_address.clone();
        *self.my_address.write() = local_address.clone();

        let node = Arc::downgrade(self);
        let mut incoming = listening.incoming;
        let accept_loop = tokio::spawn(async move {
            while let Some(link) = incoming.recv().await {
                let Some(node) = node.upgrade() else { break };
                tokio::spawn(node.accept(link));
            }
        });
        self.tasks.lock().push(accept_loop);

        *self.state.write() = NodeState::Running;
        info!("Node started on {}", local_address);
        Ok(local_address)
    }

    async fn bind(&self, address: &Address) -> NetworkResult<Listening> {
        let transport = self.registry.get(address.transport_type())?;
        Ok(transport.listen(address).await?)
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == NodeState::Running
    }

    pub fn my_address(&self) -> Address {
        self.my_address.read().clone()
    }

    /// Our own load, as computed by the load service.
    pub fn network_load(&self) -> &NetworkLoadSnapshot {
        &self.network_load
    }

    pub fn registry(&self) -> &Arc<TransportRegistry> {
        &self.registry
    }

    /// Returns the open connection to `address`, establishing one if there is none.
    pub async fn connect(self: &Arc<Self>, address: &Address) -> NetworkResult<Arc<Connection>> {
        if let Some(existing) = self.find_connection(address).await {
            return Ok(existing);
        }
        if matches!(self.state(), NodeState::Stopping | NodeState::Terminated) {
            return Err(NetworkError::Shutdown);
        }
        let transport = self.registry.get(address.transport_type())?;

        let dial_lock = self.dialing.entry(address.clone()).or_default().clone();
        let result = {
            let _guard = dial_lock.lock().await;
            match self.find_connection(address).await {
                Some(existing) => Ok(existing),
                None => self.dial(transport, address).await,
            }
        };
        self.dialing
            .remove_if(address, |_, lock| Arc::strong_count(lock) <= 2);
        result
    }

    async fn dial(self: &Arc<Self>, transport: Arc<dyn Transport>, address: &Address) -> NetworkResult<Arc<Connection>> {
        let timeout = self.config.connect_timeout;
        let started = Instant::now();
        let handshake = match tokio::time::timeout(timeout, self.handshake(transport, address)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(NetworkError::ConnectFailed {
                    address: address.clone(),
                    reason: format!("timed out after {:?}", timeout),
                })
            }
        };
        match handshake {
            Handshake::Established(connection, stream) => Ok(self.register(connection, stream).await),
            Handshake::PeerKeepsOwn => {
                // The peer dialed us at the same time and kept its own link. It shows up here
                // once our acceptor registers it.
                let remaining = timeout.saturating_sub(started.elapsed());
                self.await_connection(address, remaining)
                    .await
                    .ok_or_else(|| NetworkError::ConnectFailed {
                        address: address.clone(),
                        reason: "peer kept its own connection, which never arrived".to_string(),
                    })
            }
        }
    }

    async fn await_connection(&self, address: &Address, timeout: Duration) -> Option<Arc<Connection>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(connection) = self.find_connection(address).await {
                return Some(connection);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(AWAIT_CONNECTION_POLL).await;
        }
    }

    /// Of two links between the same pair of nodes, both sides keep the one dialed by the
    /// node with the lower address.
    fn keeps_outbound(&self, peer: &Address) -> bool {
        self.my_address() < *peer
    }

    fn supersedes(&self, new: &Connection, existing: &Connection) -> bool {
        new.direction() != existing.direction()
            && (new.direction() == Direction::Outbound) == self.keeps_outbound(new.peer_address())
    }

    async fn handshake(
        &self,
        transport: Arc<dyn Transport>,
        address: &Address,
    ) -> NetworkResult<Handshake> {
        let failed = |reason: String| NetworkError::ConnectFailed {
            address: address.clone(),
            reason,
        };

        let RawLink {
            mut sink, mut stream, ..
        } = transport.connect(address).await.map_err(|e| failed(e.to_string()))?;

        let my_load = self.network_load.current();
        let hello = NetworkEnvelope::new(EnvelopePayload::Handshake {
            address: self.my_address(),
            network_load: my_load,
        })
        .to_bytes()?;
        let started = Instant::now();
        sink.send_frame(&hello).await.map_err(|e| failed(e.to_string()))?;
        let send_time = started.elapsed();

        let frame = stream
            .next_frame()
            .await
            .map_err(|e| failed(e.to_string()))?
            .ok_or_else(|| failed("link closed during handshake".to_string()))?;
        let started = Instant::now();
        let envelope = NetworkEnvelope::from_bytes(&frame).map_err(|e| failed(e.to_string()))?;
        let deserialize_time = started.elapsed();

        match envelope.payload {
            EnvelopePayload::HandshakeAck { network_load, .. } => {
                let connection = Connection::new(address.clone(), Direction::Outbound, sink, my_load, network_load);
                connection.on_handshake_sent("Handshake", hello.len(), send_time);
                connection.on_received(frame.len(), deserialize_time);
                Ok(Handshake::Established(connection, stream))
            }
            EnvelopePayload::CloseConnection {
                reason: CloseReason::DuplicateConnection,
            } => {
                let _ = sink.close().await;
                Ok(Handshake::PeerKeepsOwn)
            }
            EnvelopePayload::CloseConnection { reason } => Err(failed(format!("rejected by peer: {}", reason))),
            other => Err(failed(format!("unexpected {} during handshake", other.kind()))),
        }
    }

    async fn accept(self: Arc<Self>, link: RawLink) {
        let RawLink {
            remote,
            mut sink,
            mut stream,
        } = link;

        let frame = match tokio::time::timeout(self.config.connect_timeout, stream.next_frame()).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                debug!("Link from {} closed before handshake", remote);
                return;
            }
            Ok(Err(e)) => {
                warn!("Handshake from {} failed: {}", remote, e);
                return;
            }
            Err(_) => {
                warn!("Handshake from {} timed out", remote);
                let _ = sink.close().await;
                return;
            }
        };

        let started = Instant::now();
        let (peer_address, peers_load) = match NetworkEnvelope::from_bytes(&frame).map(|e| e.payload) {
            Ok(EnvelopePayload::Handshake { address, network_load }) => (address, network_load),
            Ok(other) => {
                warn!("Expected handshake from {}, got {}", remote, other.kind());
                reject(&mut sink, CloseReason::HandshakeFailed).await;
                return;
            }
            Err(e) => {
                warn!("Malformed handshake from {}: {}", remote, e);
                reject(&mut sink, CloseReason::HandshakeFailed).await;
                return;
            }
        };
        let deserialize_time = started.elapsed();

        if !self.is_running() {
            reject(&mut sink, CloseReason::Shutdown).await;
            return;
        }
        if let Some(existing) = self.find_connection(&peer_address).await {
            if existing.direction() == Direction::Inbound || self.keeps_outbound(&peer_address) {
                debug!("Rejecting duplicate connection from {}", peer_address);
                reject(&mut sink, CloseReason::DuplicateConnection).await;
                return;
            }
        }

        let my_load = self.network_load.current();
        let ack = match NetworkEnvelope::new(EnvelopePayload::HandshakeAck {
            address: self.my_address(),
            network_load: my_load,
        })
        .to_bytes()
        {
            Ok(ack) => ack,
            Err(e) => {
                error!("Failed to encode handshake ack: {}", e);
                return;
            }
        };
        let started = Instant::now();
        if let Err(e) = sink.send_frame(&ack).await {
            warn!("Failed to acknowledge handshake from {}: {}", peer_address, e);
            return;
        }

        let connection = Connection::new(peer_address, Direction::Inbound, sink, my_load, peers_load);
        connection.on_received(frame.len(), deserialize_time);
        connection.on_handshake_sent("HandshakeAck", ack.len(), started.elapsed());
        self.register(connection, stream).await;
    }

    /// Makes `connection` visible and starts reading. If another open connection to the same
    /// peer exists, only the link both sides agree on survives and is returned.
    async fn register(self: &Arc<Self>, connection: Connection, stream: Box<dyn FrameStream>) -> Arc<Connection> {
        let connection = Arc::new(connection);
        let address = connection.peer_address().clone();
        let replaced = {
            let mut connections = self.connections.write().await;
            let existing = connections.get(&address).filter(|c| !c.is_closed()).cloned();
            match existing {
                Some(existing) if !self.supersedes(&connection, &existing) => {
                    drop(connections);
                    debug!("Keeping connection {} to {}, closing duplicate", existing.id(), address);
                    connection.close(CloseReason::DuplicateConnection, true).await;
                    return existing;
                }
                existing => {
                    connections.insert(address.clone(), Arc::clone(&connection));
                    existing
                }
            }
        };
        if let Some(replaced) = replaced {
            debug!("Connection {} to {} replaces {}", connection.id(), address, replaced.id());
            replaced.abort_reader();
            self.finish_connection(&replaced, CloseReason::DuplicateConnection, true).await;
        }

        let reader = tokio::spawn(read_loop(Arc::downgrade(self), Arc::clone(&connection), stream));
        connection.set_reader(reader.abort_handle());

        info!(
            "Connection {} to {} established ({:?})",
            connection.id(),
            address,
            connection.direction()
        );
        self.publish(NodeEvent::Connected(Arc::clone(&connection))).await;
        connection
    }

    pub async fn find_connection(&self, address: &Address) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .await
            .get(address)
            .filter(|connection| !connection.is_closed())
            .cloned()
    }

    /// All open connections.
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .await
            .values()
            .filter(|connection| !connection.is_closed())
            .cloned()
            .collect()
    }

    pub async fn send(&self, connection: &Connection, payload: EnvelopePayload) -> NetworkResult<()> {
        connection.send(payload).await
    }

    /// Connects if needed and sends.
    pub async fn send_to(self: &Arc<Self>, address: &Address, payload: EnvelopePayload) -> NetworkResult<Arc<Connection>> {
        let connection = self.connect(address).await?;
        connection.send(payload).await?;
        Ok(connection)
    }

    pub async fn close_connection(&self, connection: &Arc<Connection>, reason: CloseReason) -> bool {
        connection.abort_reader();
        self.finish_connection(connection, reason, true).await
    }

    async fn finish_connection(&self, connection: &Arc<Connection>, reason: CloseReason, notify_peer: bool) -> bool {
        {
            let mut connections = self.connections.write().await;
            let address = connection.peer_address();
            if connections
                .get(address)
                .map_or(false, |registered| Arc::ptr_eq(registered, connection))
            {
                connections.remove(address);
            }
        }
        if !connection.close(reason, notify_peer).await {
            return false;
        }
        self.publish(NodeEvent::Disconnected {
            connection: Arc::clone(connection),
            reason,
        })
        .await;
        true
    }

    /// Registers `listener` with its own consumer task. Events published before this call
    /// are not replayed.
    pub fn add_listener(&self, listener: Arc<dyn NodeListener>) -> ListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut events) = mpsc::channel::<NodeEvent>(self.config.event_channel_capacity.max(1));
        self.listeners.write().push(ListenerQueue { id, tx });

        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let dispatch = AssertUnwindSafe(dispatch(listener.as_ref(), &event)).catch_unwind();
                if dispatch.await.is_err() {
                    error!("Node listener panicked while handling an event");
                }
            }
        });
        ListenerHandle {
            id,
            listeners: Arc::downgrade(&self.listeners),
            task,
        }
    }

    /// Hands `event` to every listener, waiting while a listener's queue is full.
    async fn publish(&self, event: NodeEvent) {
        let queues: Vec<ListenerQueue> = self.listeners.read().clone();
        let mut gone = Vec::new();
        for queue in queues {
            if queue.tx.send(event.clone()).await.is_err() {
                gone.push(queue.id);
            }
        }
        if !gone.is_empty() {
            self.listeners.write().retain(|queue| !gone.contains(&queue.id));
        }
    }

    /// Closes every connection with `CloseReason::Shutdown` and stops all transports.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if matches!(*state, NodeState::Stopping | NodeState::Terminated) {
                return;
            }
            *state = NodeState::Stopping;
        }
        info!("Shutting down node {}", self.my_address());

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let connections: Vec<Arc<Connection>> = self.connections.write().await.drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.abort_reader();
            if connection.close(CloseReason::Shutdown, true).await {
                self.publish(NodeEvent::Disconnected {
                    connection,
                    reason: CloseReason::Shutdown,
                })
                .await;
            }
        }

        self.registry.close_all().await;
        *self.state.write() = NodeState::Terminated;
        info!("Node terminated");
    }
}

enum Handshake {
    Established(Connection, Box<dyn FrameStream>),
    /// The peer rejected our link as a duplicate of one it dialed itself.
    PeerKeepsOwn,
}

async fn reject(sink: &mut Box<dyn FrameSink>, reason: CloseReason) {
    if let Ok(bytes) = NetworkEnvelope::new(EnvelopePayload::CloseConnection { reason }).to_bytes() {
        let _ = sink.send_frame(&bytes).await;
    }
    let _ = sink.close().await;
}

async fn dispatch(listener: &dyn NodeListener, event: &NodeEvent) {
    match event {
        NodeEvent::Message {
            connection,
            sender,
            payload,
        } => listener.on_message(payload, connection, sender).await,
        NodeEvent::Connected(connection) => listener.on_connection(connection).await,
        NodeEvent::Disconnected { connection, reason } => listener.on_disconnect(connection, *reason).await,
    }
}

async fn read_loop(node: Weak<Node>, connection: Arc<Connection>, mut stream: Box<dyn FrameStream>) {
    let reason = loop {
        let frame = match stream.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break CloseReason::ClosedByPeer,
            Err(e) => {
                if !connection.is_closed() {
                    warn!("Read from {} failed: {}", connection.peer_address(), e);
                }
                break CloseReason::ReadFailed;
            }
        };

        let started = Instant::now();
        let envelope = match NetworkEnvelope::from_bytes(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping envelope from {}: {}", connection.peer_address(), e);
                continue;
            }
        };
        connection.on_received(frame.len(), started.elapsed());

        let Some(owner) = node.upgrade() else { return };
        match envelope.payload {
            EnvelopePayload::CloseConnection { reason } => {
                debug!("{} closed the connection: {}", connection.peer_address(), reason);
                break reason;
            }
            EnvelopePayload::Handshake { .. } | EnvelopePayload::HandshakeAck { .. } => {
                warn!(
                    "Protocol violation: handshake on established connection {}",
                    connection.id()
                );
            }
            payload => {
                owner
                    .publish(NodeEvent::Message {
                        sender: connection.peer_address().clone(),
                        connection: Arc::clone(&connection),
                        payload,
                    })
                    .await
            }
        }
    };

    if let Some(owner) = node.upgrade() {
        owner.finish_connection(&connection, reason, false).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, MemoryTransport};
    use peernet_types::TransportType;
    use tokio::sync::mpsc;

    fn memory_node(network: &Arc<MemoryNetwork>, port: u16) -> Arc<Node> {
        memory_node_with(network, port, NodeConfig::default().event_channel_capacity)
    }

    fn memory_node_with(network: &Arc<MemoryNetwork>, port: u16, event_channel_capacity: usize) -> Arc<Node> {
        let registry = TransportRegistry::new().with_transport(Arc::new(MemoryTransport::new(
            Arc::clone(network),
            TransportType::Clear,
        )));
        Node::new(
            NodeConfig {
                listen_address: Address::localhost(port),
                connect_timeout: Duration::from_secs(2),
                event_channel_capacity,
            },
            Arc::new(registry),
        )
    }

    struct Forwarder {
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl NodeListener for Forwarder {
        async fn on_message(&self, payload: &EnvelopePayload, _connection: &Arc<Connection>, sender: &Address) {
            let _ = self.tx.send(format!("{}:{}", payload.kind(), sender));
        }

        async fn on_disconnect(&self, _connection: &Arc<Connection>, reason: CloseReason) {
            let _ = self.tx.send(format!("closed:{}", reason));
        }
    }

    struct Slow {
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl NodeListener for Slow {
        async fn on_message(&self, payload: &EnvelopePayload, _connection: &Arc<Connection>, _sender: &Address) {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = self.tx.send(payload.kind().to_string());
        }

        async fn on_disconnect(&self, _connection: &Arc<Connection>, reason: CloseReason) {
            let _ = self.tx.send(format!("closed:{}", reason));
        }
    }

    struct Panicking;

    #[async_trait]
    impl NodeListener for Panicking {
        async fn on_message(&self, _payload: &EnvelopePayload, _connection: &Arc<Connection>, _sender: &Address) {
            panic!("listener failure");
        }
    }

    #[tokio::test]
    async fn test_connect_send_and_receive() {
        let network = MemoryNetwork::new();
        let a = memory_node(&network, 7001);
        let b = memory_node(&network, 7002);
        a.start().await.unwrap();
        b.start().await.unwrap();
        assert_eq!(b.state(), NodeState::Running);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _panicking = b.add_listener(Arc::new(Panicking));
        let _listener = b.add_listener(Arc::new(Forwarder { tx }));

        let connection = a.connect(&b.my_address()).await.unwrap();
        connection.send(EnvelopePayload::Application(vec![1, 2])).await.unwrap();
        connection.send(EnvelopePayload::Application(vec![3])).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "Application:127.0.0.1:7001");
        assert_eq!(rx.recv().await.unwrap(), "Application:127.0.0.1:7001");

        // Handshake plus two application messages.
        assert_eq!(connection.metrics().snapshot().total.num_messages_sent, 3);
        assert_eq!(b.connections().await.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_reuses_open_connection() {
        let network = MemoryNetwork::new();
        let a = memory_node(&network, 7011);
        let b = memory_node(&network, 7012);
        a.start().await.unwrap();
        b.start().await.unwrap();

        let first = a.connect(&b.my_address()).await.unwrap();
        let second = a.connect(&b.my_address()).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(a.connections().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_connect_failed() {
        let network = MemoryNetwork::new();
        let a = memory_node(&network, 7021);
        a.start().await.unwrap();

        let err = a.connect(&Address::localhost(7999)).await.unwrap_err();
        assert!(matches!(err, NetworkError::ConnectFailed { .. }));
    }

    #[tokio::test]
    async fn test_missing_transport_is_unavailable() {
        let network = MemoryNetwork::new();
        let a = memory_node(&network, 7031);

        let err = a.connect(&Address::new("peer.onion", 9999)).await.unwrap_err();
        assert!(matches!(err, NetworkError::TransportUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_close_is_reported_to_peer() {
        let network = MemoryNetwork::new();
        let a = memory_node(&network, 7041);
        let b = memory_node(&network, 7042);
        a.start().await.unwrap();
        b.start().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _listener = b.add_listener(Arc::new(Forwarder { tx }));

        let connection = a.connect(&b.my_address()).await.unwrap();
        assert!(a.close_connection(&connection, CloseReason::ManuallyClosed).await);
        assert!(!a.close_connection(&connection, CloseReason::ManuallyClosed).await);
        assert!(a.connections().await.is_empty());
        assert_eq!(connection.metrics().snapshot().total.num_messages_sent, 0);

        assert_eq!(rx.recv().await.unwrap(), format!("closed:{}", CloseReason::ManuallyClosed));
        assert!(b.connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let network = MemoryNetwork::new();
        let a = memory_node(&network, 7051);
        let b = memory_node(&network, 7052);
        a.start().await.unwrap();
        b.start().await.unwrap();
        a.connect(&b.my_address()).await.unwrap();

        a.shutdown().await;
        assert_eq!(a.state(), NodeState::Terminated);
        assert!(a.connections().await.is_empty());
        assert!(!network.is_listening(&Address::localhost(7051)));
        assert!(matches!(
            a.connect(&b.my_address()).await,
            Err(NetworkError::Shutdown)
        ));
        assert!(matches!(a.start().await, Err(NetworkError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_slow_listener_sees_every_event() {
        let network = MemoryNetwork::new();
        let a = memory_node(&network, 7061);
        let b = memory_node_with(&network, 7062, 2);
        a.start().await.unwrap();
        b.start().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _listener = b.add_listener(Arc::new(Slow { tx }));

        let connection = a.connect(&b.my_address()).await.unwrap();
        for i in 0..20u8 {
            connection.send(EnvelopePayload::Application(vec![i])).await.unwrap();
        }
        a.close_connection(&connection, CloseReason::ManuallyClosed).await;

        for _ in 0..20 {
            assert_eq!(rx.recv().await.unwrap(), "Application");
        }
        assert_eq!(rx.recv().await.unwrap(), format!("closed:{}", CloseReason::ManuallyClosed));
    }

    #[tokio::test]
    async fn test_dropped_listener_handle_unregisters() {
        let network = MemoryNetwork::new();
        let a = memory_node(&network, 7071);
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = a.add_listener(Arc::new(Forwarder { tx }));
        assert_eq!(a.listeners.read().len(), 1);
        drop(handle);
        assert!(a.listeners.read().is_empty());
    }

    async fn settled(node: &Arc<Node>, peer: &Address) -> Arc<Connection> {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let connections = node.connections().await;
                if connections.len() == 1 && connections[0].peer_address() == peer {
                    return Arc::clone(&connections[0]);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_simultaneous_connect_keeps_one_link() {
        let network = MemoryNetwork::new();
        for round in 0..5u16 {
            let low = memory_node(&network, 7100 + round * 2);
            let high = memory_node(&network, 7101 + round * 2);
            low.start().await.unwrap();
            high.start().await.unwrap();

            let high_addr = high.my_address();
            let low_addr = low.my_address();
            let (from_low, from_high) = tokio::join!(low.connect(&high_addr), high.connect(&low_addr));
            assert!(from_low.is_ok(), "round {}: {:?}", round, from_low.err());
            assert!(from_high.is_ok(), "round {}: {:?}", round, from_high.err());

            // The surviving link is the one dialed by the lower address.
            let on_low = settled(&low, &high.my_address()).await;
            let on_high = settled(&high, &low.my_address()).await;
            assert_eq!(on_low.direction(), Direction::Outbound);
            assert_eq!(on_high.direction(), Direction::Inbound);
            assert!(!on_low.is_closed());
            assert!(!on_high.is_closed());

            on_low.send(EnvelopePayload::Application(vec![round as u8])).await.unwrap();

            low.shutdown().await;
            high.shutdown().await;
        }
    }
}
