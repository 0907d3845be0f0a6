//! In-process transport. Links are pairs of bounded channels.

use super::{FrameSink, FrameStream, Listening, RawLink, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use peernet_types::{Address, TransportType};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

const LINK_CAPACITY: usize = 256;
const ACCEPT_CAPACITY: usize = 64;

/// The shared medium memory transports connect through.
pub struct MemoryNetwork {
    listeners: Mutex<HashMap<Address, mpsc::Sender<RawLink>>>,
    next_ephemeral_port: AtomicU16,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
            next_ephemeral_port: AtomicU16::new(40_000),
        })
    }

    pub fn is_listening(&self, address: &Address) -> bool {
        self.listeners.lock().contains_key(address)
    }

    fn unbind(&self, address: &Address) {
        self.listeners.lock().remove(address);
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    transport_type: TransportType,
    bound: Mutex<Vec<Address>>,
}

impl MemoryTransport {
    pub fn new(network: Arc<MemoryNetwork>, transport_type: TransportType) -> Self {
        Self {
            network,
            transport_type,
            bound: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    async fn connect(&self, address: &Address) -> io::Result<RawLink> {
        let acceptor = self
            .network
            .listeners
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, format!("nobody listens on {}", address)))?;

        let (to_remote, from_local) = mpsc::channel(LINK_CAPACITY);
        let (to_local, from_remote) = mpsc::channel(LINK_CAPACITY);

        let port = self.network.next_ephemeral_port.fetch_add(1, Ordering::SeqCst);
        let remote_side = RawLink {
            remote: Address::new("memory", port),
            sink: Box::new(MemorySink { tx: Some(to_local) }),
            stream: Box::new(MemoryStream { rx: from_local }),
        };
        acceptor
            .send(remote_side)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener closed"))?;

        debug!("Memory link established to {}", address);
        Ok(RawLink {
            remote: address.clone(),
            sink: Box::new(MemorySink { tx: Some(to_remote) }),
            stream: Box::new(MemoryStream { rx: from_remote }),
        })
    }

    async fn listen(&self, address: &Address) -> io::Result<Listening> {
        let (tx, rx) = mpsc::channel(ACCEPT_CAPACITY);
        {
            let mut listeners = self.network.listeners.lock();
            if listeners.contains_key(address) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} already bound", address),
                ));
            }
            listeners.insert(address.clone(), tx);
        }
        self.bound.lock().push(address.clone());

        Ok(Listening {
            local_address: address.clone(),
            incoming: rx,
        })
    }

    async fn close(&self) {
        let bound: Vec<Address> = self.bound.lock().drain(..).collect();
        for address in bound {
            self.network.unbind(&address);
        }
    }
}

struct MemorySink {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "link closed"))?;
        tx.send(frame.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "remote dropped the link"))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.tx = None;
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}
