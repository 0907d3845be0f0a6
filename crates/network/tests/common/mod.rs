//! Shared fixtures for the network integration tests.

#![allow(dead_code)]

use peernet_network::{Connection, MemoryNetwork, MemoryTransport, Node, NodeConfig, TransportRegistry};
use peernet_types::{Address, TransportType};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A node on `network` listening on `127.0.0.1:port`, not yet started.
pub fn memory_node(network: &Arc<MemoryNetwork>, port: u16) -> Arc<Node> {
    let registry = TransportRegistry::new().with_transport(Arc::new(MemoryTransport::new(
        Arc::clone(network),
        TransportType::Clear,
    )));
    Node::new(
        NodeConfig {
            listen_address: Address::localhost(port),
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        Arc::new(registry),
    )
}

pub async fn started_memory_node(network: &Arc<MemoryNetwork>, port: u16) -> Arc<Node> {
    let node = memory_node(network, port);
    node.start().await.unwrap();
    node
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The connection `node` accepted from `peer`. The acceptor registers a connection shortly
/// after acknowledging the handshake, so this waits for it.
pub async fn accepted_connection(node: &Arc<Node>, peer: &Address) -> Arc<Connection> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(connection) = node.find_connection(peer).await {
            return connection;
        }
        assert!(tokio::time::Instant::now() < deadline, "no connection from {}", peer);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
