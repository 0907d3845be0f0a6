//! Composite load score of the local node.

use crate::error::NetworkResult;
use crate::metrics::ConnectionMetricsSnapshot;
use crate::node::Node;
use parking_lot::Mutex;
use peernet_common::Scheduler;
use peernet_storage::DataStore;
use peernet_types::NetworkLoad;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const MB: f64 = 1024.0 * 1024.0;

/// One weighted term of the load score. `value / reference_max * weight` is added per term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadFactor {
    pub name: &'static str,
    pub weight: f64,
    pub reference_max: f64,
}

pub const LOAD_POLICY: [LoadFactor; 8] = [
    LoadFactor { name: "connections", weight: 0.1, reference_max: 30.0 },
    LoadFactor { name: "sent_bytes_per_hour", weight: 0.1, reference_max: 20.0 * MB },
    LoadFactor { name: "spent_send_time_per_hour_ms", weight: 0.1, reference_max: 60_000.0 },
    LoadFactor { name: "messages_sent_per_hour", weight: 0.1, reference_max: 2_000.0 },
    LoadFactor { name: "received_bytes_per_hour", weight: 0.1, reference_max: 20.0 * MB },
    LoadFactor { name: "deserialize_time_per_hour_ms", weight: 0.1, reference_max: 60_000.0 },
    LoadFactor { name: "messages_received_per_hour", weight: 0.1, reference_max: 1_000.0 },
    LoadFactor { name: "store_size_bytes", weight: 0.3, reference_max: 100.0 * MB },
];

/// Raw inputs of the score, in the order of [`LOAD_POLICY`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadInputs {
    pub num_connections: u64,
    pub sent_bytes_last_hour: u64,
    pub spent_send_time_last_hour: Duration,
    pub num_sent_last_hour: u64,
    pub received_bytes_last_hour: u64,
    pub deserialize_time_last_hour: Duration,
    pub num_received_last_hour: u64,
    pub store_size_bytes: u64,
}

impl LoadInputs {
    pub fn from_metrics(metrics: &[ConnectionMetricsSnapshot], store_size_bytes: u64) -> Self {
        let mut inputs = LoadInputs {
            num_connections: metrics.len() as u64,
            store_size_bytes,
            ..Default::default()
        };
        for snapshot in metrics {
            let hour = &snapshot.last_hour;
            inputs.sent_bytes_last_hour += hour.sent_bytes;
            inputs.spent_send_time_last_hour += hour.spent_send_time;
            inputs.num_sent_last_hour += hour.num_messages_sent;
            inputs.received_bytes_last_hour += hour.received_bytes;
            inputs.deserialize_time_last_hour += hour.deserialize_time;
            inputs.num_received_last_hour += hour.num_messages_received;
        }
        inputs
    }

    fn values(&self) -> [f64; 8] {
        [
            self.num_connections as f64,
            self.sent_bytes_last_hour as f64,
            self.spent_send_time_last_hour.as_millis() as f64,
            self.num_sent_last_hour as f64,
            self.received_bytes_last_hour as f64,
            self.deserialize_time_last_hour.as_millis() as f64,
            self.num_received_last_hour as f64,
            self.store_size_bytes as f64,
        ]
    }
}

/// Weighted sum of all factors, clamped to [0, 1].
pub fn calculate_load(inputs: &LoadInputs) -> f64 {
    let sum: f64 = LOAD_POLICY
        .iter()
        .zip(inputs.values())
        .map(|(factor, value)| value / factor.reference_max * factor.weight)
        .sum();
    if sum.is_finite() {
        sum.clamp(0.0, 1.0)
    } else {
        1.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoadServiceConfig {
    pub initial_delay: Duration,
    pub interval: Duration,
}

impl Default for LoadServiceConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(15),
            interval: Duration::from_secs(180),
        }
    }
}

pub struct NetworkLoadService {
    node: Arc<Node>,
    data_store: Option<Arc<dyn DataStore>>,
    config: LoadServiceConfig,
    scheduler: Mutex<Option<Scheduler>>,
}

impl NetworkLoadService {
    pub fn new(node: Arc<Node>, data_store: Option<Arc<dyn DataStore>>, config: LoadServiceConfig) -> Arc<Self> {
        Arc::new(Self {
            node,
            data_store,
            config,
            scheduler: Mutex::new(None),
        })
    }

    /// Starts the periodic refresh. Must be called from within a tokio runtime.
    pub fn initialize(self: &Arc<Self>) -> NetworkResult<()> {
        let runtime = tokio::runtime::Handle::current();
        let service = Arc::downgrade(self);

        let scheduler = Scheduler::builder("network-load-service")
            .periodically_after(self.config.initial_delay, self.config.interval, move || {
                if let Some(service) = service.upgrade() {
                    runtime.spawn(async move {
                        service.update_network_load().await;
                    });
                }
            })?;

        info!(
            "Network load service started (initial delay {:?}, interval {:?})",
            self.config.initial_delay, self.config.interval
        );
        *self.scheduler.lock() = Some(scheduler);
        Ok(())
    }

    /// Recomputes the node's load from its live connections and the local store.
    pub async fn update_network_load(&self) -> NetworkLoad {
        let metrics: Vec<ConnectionMetricsSnapshot> = self
            .node
            .connections()
            .await
            .iter()
            .map(|connection| connection.metrics().snapshot())
            .collect();
        let store_size = self
            .data_store
            .as_ref()
            .map(|store| store.stored_bytes())
            .unwrap_or(0);
        self.update_my_load(&metrics, store_size)
    }

    pub fn update_my_load(&self, metrics: &[ConnectionMetricsSnapshot], store_size: u64) -> NetworkLoad {
        let inputs = LoadInputs::from_metrics(metrics, store_size);
        let network_load = NetworkLoad::with_difficulty_adjustment(
            calculate_load(&inputs),
            metrics.len() as i32,
            self.node.network_load().current().difficulty_adjustment_factor(),
        );
        self.node.network_load().update(network_load);
        debug!("Updated my network load: {}", network_load);
        network_load
    }

    pub fn shutdown(&self) {
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }
    }
}
