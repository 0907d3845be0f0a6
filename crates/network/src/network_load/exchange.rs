//! Periodic, nonce-correlated exchange of load values between connected peers.
//!
//! One round trip updates both sides: the responder learns the requester's load from the
//! request itself, the requester learns the responder's load from the matching response.

use super::snapshot::now_millis;
use crate::connection::Connection;
use crate::envelope::EnvelopePayload;
use crate::error::{NetworkError, NetworkResult};
use crate::node::{ListenerHandle, Node, NodeListener};
use crate::request_response::{CorrelatedRequests, Resolution};
use async_trait::async_trait;
use parking_lot::Mutex;
use peernet_common::Scheduler;
use peernet_types::{
    Address, CloseReason, ConnectionId, NetworkLoad, NetworkLoadExchangeRequest,
    NetworkLoadExchangeResponse,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ExchangeConfig {
    pub initial_delay: Duration,
    pub interval: Duration,
    /// Peers whose reported load is older than this are asked again.
    pub max_idle: Duration,
    pub timeout: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            interval: Duration::from_secs(60),
            max_idle: Duration::from_secs(5 * 60),
            timeout: Duration::from_secs(120),
        }
    }
}

pub struct NetworkLoadExchangeService {
    node: Arc<Node>,
    config: ExchangeConfig,
    pending: CorrelatedRequests<ConnectionId, NetworkLoad>,
    scheduler: Mutex<Option<Scheduler>>,
    listener: Mutex<Option<ListenerHandle>>,
    shut_down: AtomicBool,
}

impl NetworkLoadExchangeService {
    pub fn new(node: Arc<Node>, config: ExchangeConfig) -> Arc<Self> {
        Arc::new(Self {
            node,
            config,
            pending: CorrelatedRequests::new(),
            scheduler: Mutex::new(None),
            listener: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Registers the node listener and starts the periodic scan. Must be called from within
    /// a tokio runtime.
    pub fn initialize(self: &Arc<Self>) -> NetworkResult<()> {
        let listener = self.node.add_listener(Arc::new(ExchangeListener {
            service: Arc::downgrade(self),
        }));
        *self.listener.lock() = Some(listener);

        let runtime = tokio::runtime::Handle::current();
        let service = Arc::downgrade(self);
        let scheduler = Scheduler::builder("network-load-exchange")
            .periodically_after(self.config.initial_delay, self.config.interval, move || {
                if let Some(service) = service.upgrade() {
                    runtime.spawn(async move {
                        service.request_from_idle_peers().await;
                    });
                }
            })?;
        *self.scheduler.lock() = Some(scheduler);

        info!(
            "Network load exchange started (interval {:?}, max idle {:?}, timeout {:?})",
            self.config.interval, self.config.max_idle, self.config.timeout
        );
        Ok(())
    }

    /// Starts one exchange with every peer whose reported load went stale. Returns the
    /// number of exchanges started.
    pub async fn request_from_idle_peers(self: &Arc<Self>) -> usize {
        let now = now_millis();
        let mut started = 0;
        for connection in self.node.connections().await {
            if !connection
                .peers_network_load_snapshot()
                .is_older_than(self.config.max_idle, now)
            {
                continue;
            }
            if self.pending.is_pending(connection.id()) {
                debug!("Load exchange with {} already pending", connection.peer_address());
                continue;
            }

            let service = Arc::clone(self);
            tokio::spawn(async move {
                match service.request(&connection).await {
                    Ok(network_load) => debug!(
                        "Load exchange with {} completed: {}",
                        connection.peer_address(),
                        network_load
                    ),
                    Err(NetworkError::AlreadyPending(_)) => {}
                    Err(e) => warn!("Load exchange with {} failed: {}", connection.peer_address(), e),
                }
            });
            started += 1;
        }
        started
    }

    /// Sends our load and waits for the peer's. At most one exchange per connection is in
    /// flight; a second call fails with `AlreadyPending`.
    pub async fn request(&self, connection: &Arc<Connection>) -> NetworkResult<NetworkLoad> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(NetworkError::Shutdown);
        }

        let nonce: i32 = rand::random();
        let pending = self.pending.register(connection.id().clone(), nonce)?;

        let my_load = self.node.network_load().current();
        let request = NetworkLoadExchangeRequest {
            nonce,
            network_load: my_load,
        };
        let started = Instant::now();
        // Any early return drops `pending` and frees the slot.
        connection
            .send(EnvelopePayload::NetworkLoadExchangeRequest(request))
            .await?;
        connection.network_load_snapshot().update(my_load);

        let peers_load = pending.wait(self.config.timeout).await?;
        connection.on_round_trip(started.elapsed());
        connection.peers_network_load_snapshot().update(peers_load);
        Ok(peers_load)
    }

    pub fn is_pending(&self, connection_id: &ConnectionId) -> bool {
        self.pending.is_pending(connection_id)
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    async fn on_request(&self, request: &NetworkLoadExchangeRequest, connection: &Arc<Connection>) {
        connection
            .peers_network_load_snapshot()
            .update(request.network_load.sanitized());

        let my_load = self.node.network_load().current();
        let response = NetworkLoadExchangeResponse {
            request_nonce: request.nonce,
            network_load: my_load,
        };
        match connection
            .send(EnvelopePayload::NetworkLoadExchangeResponse(response))
            .await
        {
            Ok(()) => connection.network_load_snapshot().update(my_load),
            Err(e) => warn!("Failed to answer load exchange from {}: {}", connection.peer_address(), e),
        }
    }

    fn on_response(&self, response: &NetworkLoadExchangeResponse, connection: &Arc<Connection>) {
        let peers_load = response.network_load.sanitized();
        match self
            .pending
            .resolve(connection.id(), response.request_nonce, peers_load)
        {
            Resolution::Completed => debug!("Load exchange response from {}", connection.peer_address()),
            Resolution::NonceMismatch { expected, received } => warn!(
                "Protocol violation: load exchange response from {} carries nonce {}, expected {}",
                connection.peer_address(),
                received,
                expected
            ),
            Resolution::NotPending => debug!(
                "Ignoring unsolicited load exchange response from {}",
                connection.peer_address()
            ),
        }
    }

    fn on_disconnect(&self, connection: &Arc<Connection>) {
        self.pending.fail(
            connection.id(),
            NetworkError::ConnectionClosed {
                connection_id: connection.id().clone(),
            },
        );
    }

    /// Stops the scan, removes the listener and fails every exchange still in flight.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }
        self.listener.lock().take();
        let failed = self.pending.fail_all(|| NetworkError::Shutdown);
        if failed > 0 {
            debug!("Failed {} pending load exchanges on shutdown", failed);
        }
    }
}

struct ExchangeListener {
    service: Weak<NetworkLoadExchangeService>,
}

#[async_trait]
impl NodeListener for ExchangeListener {
    async fn on_message(&self, payload: &EnvelopePayload, connection: &Arc<Connection>, _sender: &Address) {
        let Some(service) = self.service.upgrade() else { return };
        match payload {
            EnvelopePayload::NetworkLoadExchangeRequest(request) => service.on_request(request, connection).await,
            EnvelopePayload::NetworkLoadExchangeResponse(response) => service.on_response(response, connection),
            _ => {}
        }
    }

    async fn on_disconnect(&self, connection: &Arc<Connection>, _reason: CloseReason) {
        if let Some(service) = self.service.upgrade() {
            service.on_disconnect(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExchangeConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(120));
        assert!(config.initial_delay < config.max_idle);
    }
}
