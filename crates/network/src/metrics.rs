//! Per-connection traffic accounting.
//!
//! A [`ConnectionMetrics`] belongs to exactly one connection and is only written from
//! that connection's send and receive path. Everyone else reads immutable snapshots.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

const MINUTES_PER_HOUR: u64 = 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficTotals {
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub num_messages_sent: u64,
    pub num_messages_received: u64,
    pub spent_send_time: Duration,
    pub deserialize_time: Duration,
}

impl TrafficTotals {
    fn add(&mut self, other: &TrafficTotals) {
        self.sent_bytes += other.sent_bytes;
        self.received_bytes += other.received_bytes;
        self.num_messages_sent += other.num_messages_sent;
        self.num_messages_received += other.num_messages_received;
        self.spent_send_time += other.spent_send_time;
        self.deserialize_time += other.deserialize_time;
    }
}

#[derive(Default)]
struct MetricsState {
    // minute since creation -> traffic during that minute
    buckets: BTreeMap<u64, TrafficTotals>,
    total: TrafficTotals,
    rtt_samples: Vec<Duration>,
    sent_by_kind: HashMap<&'static str, u64>,
    last_sent: Option<Instant>,
    last_received: Option<Instant>,
}

impl MetricsState {
    fn bucket(&mut self, minute: u64) -> &mut TrafficTotals {
        // Only the last hour is ever read.
        let oldest = minute.saturating_sub(MINUTES_PER_HOUR - 1);
        self.buckets = self.buckets.split_off(&oldest);
        self.buckets.entry(minute).or_default()
    }
}

pub struct ConnectionMetrics {
    created: Instant,
    state: Mutex<MetricsState>,
}

/// Immutable view of a connection's metrics at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionMetricsSnapshot {
    pub age: Duration,
    pub total: TrafficTotals,
    pub last_hour: TrafficTotals,
    pub last_minute: TrafficTotals,
    pub rtt_samples: Vec<Duration>,
    pub sent_by_kind: Vec<(String, u64)>,
    pub idle_for: Option<Duration>,
}

impl ConnectionMetricsSnapshot {
    pub fn average_rtt(&self) -> Option<Duration> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        let sum: Duration = self.rtt_samples.iter().sum();
        Some(sum / self.rtt_samples.len() as u32)
    }

    /// Messages sent per minute, averaged over the last hour or the connection age if shorter.
    pub fn sent_per_minute(&self) -> f64 {
        self.last_hour.num_messages_sent as f64 / self.window_minutes()
    }

    pub fn received_per_minute(&self) -> f64 {
        self.last_hour.num_messages_received as f64 / self.window_minutes()
    }

    fn window_minutes(&self) -> f64 {
        let minutes = (self.age.as_secs_f64() / 60.0).ceil();
        minutes.clamp(1.0, MINUTES_PER_HOUR as f64)
    }
}

impl ConnectionMetrics {
    pub(crate) fn new() -> Self {
        Self {
            created: Instant::now(),
            state: Mutex::new(MetricsState::default()),
        }
    }

    pub(crate) fn on_sent(&self, kind: &'static str, bytes: usize, send_time: Duration) {
        self.on_sent_at(self.minute_now(), kind, bytes, send_time);
    }

    pub(crate) fn on_received(&self, bytes: usize, deserialize_time: Duration) {
        self.on_received_at(self.minute_now(), bytes, deserialize_time);
    }

    pub(crate) fn add_rtt(&self, rtt: Duration) {
        self.state.lock().rtt_samples.push(rtt);
    }

    pub(crate) fn clear(&self) {
        *self.state.lock() = MetricsState::default();
    }

    pub(crate) fn on_sent_at(&self, minute: u64, kind: &'static str, bytes: usize, send_time: Duration) {
        let mut state = self.state.lock();
        let traffic = TrafficTotals {
            sent_bytes: bytes as u64,
            num_messages_sent: 1,
            spent_send_time: send_time,
            ..Default::default()
        };
        state.bucket(minute).add(&traffic);
        state.total.add(&traffic);
        *state.sent_by_kind.entry(kind).or_insert(0) += 1;
        state.last_sent = Some(Instant::now());
    }

    pub(crate) fn on_received_at(&self, minute: u64, bytes: usize, deserialize_time: Duration) {
        let mut state = self.state.lock();
        let traffic = TrafficTotals {
            received_bytes: bytes as u64,
            num_messages_received: 1,
            deserialize_time,
            ..Default::default()
        };
        state.bucket(minute).add(&traffic);
        state.total.add(&traffic);
        state.last_received = Some(Instant::now());
    }

    pub fn snapshot(&self) -> ConnectionMetricsSnapshot {
        self.snapshot_at(self.minute_now())
    }

    pub(crate) fn snapshot_at(&self, minute: u64) -> ConnectionMetricsSnapshot {
        let state = self.state.lock();
        let oldest = minute.saturating_sub(MINUTES_PER_HOUR - 1);

        let mut last_hour = TrafficTotals::default();
        for (_, bucket) in state.buckets.range(oldest..=minute) {
            last_hour.add(bucket);
        }

        let mut sent_by_kind: Vec<(String, u64)> = state
            .sent_by_kind
            .iter()
            .map(|(kind, count)| (kind.to_string(), *count))
            .collect();
        sent_by_kind.sort();

        let last_activity = match (state.last_sent, state.last_received) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        ConnectionMetricsSnapshot {
            age: self.created.elapsed(),
            total: state.total,
            last_hour,
            last_minute: state.buckets.get(&minute).copied().unwrap_or_default(),
            rtt_samples: state.rtt_samples.clone(),
            sent_by_kind,
            idle_for: last_activity.map(|at| at.elapsed()),
        }
    }

    fn minute_now(&self) -> u64 {
        self.created.elapsed().as_secs() / 60
    }
}
