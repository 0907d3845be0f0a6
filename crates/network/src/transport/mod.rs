//! Transport contract and the registry that owns one transport per network type.

pub mod memory;
pub mod tcp;

use crate::error::{NetworkError, NetworkResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use peernet_types::{Address, TransportType};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

/// Writing half of a framed link.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    async fn close(&mut self) -> io::Result<()>;
}

/// Reading half of a framed link. `Ok(None)` means the remote closed the link.
#[async_trait]
pub trait FrameStream: Send {
    async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// A raw bidirectional link before the handshake.
pub struct RawLink {
    pub remote: Address,
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

pub struct Listening {
    pub local_address: Address,
    pub incoming: mpsc::Receiver<RawLink>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn transport_type(&self) -> TransportType;

    async fn connect(&self, address: &Address) -> io::Result<RawLink>;

    async fn listen(&self, address: &Address) -> io::Result<Listening>;

    /// Stops accepting. Established links are not affected.
    async fn close(&self);
}

/// Transports available to one node.
#[derive(Default)]
pub struct TransportRegistry {
    transports: RwLock<HashMap<TransportType, Arc<dyn Transport>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(self, transport: Arc<dyn Transport>) -> Self {
        self.register(transport);
        self
    }

    /// Replaces any transport previously registered for the same type.
    pub fn register(&self, transport: Arc<dyn Transport>) {
        let transport_type = transport.transport_type();
        info!("Registered transport {}", transport_type);
        self.transports.write().insert(transport_type, transport);
    }

    pub fn get(&self, transport_type: TransportType) -> NetworkResult<Arc<dyn Transport>> {
        self.transports
            .read()
            .get(&transport_type)
            .cloned()
            .ok_or(NetworkError::TransportUnavailable { transport_type })
    }

    pub fn supported(&self) -> Vec<TransportType> {
        let mut types: Vec<_> = self.transports.read().keys().copied().collect();
        types.sort();
        types
    }

    pub async fn close_all(&self) {
        let transports: Vec<_> = self.transports.read().values().cloned().collect();
        for transport in transports {
            transport.close().await;
        }
    }
}
