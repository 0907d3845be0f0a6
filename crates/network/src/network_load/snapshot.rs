use parking_lot::Mutex;
use peernet_types::NetworkLoad;
use std::time::Duration;

/// One consistent reading of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapshotState {
    pub current: NetworkLoad,
    pub previous: Option<NetworkLoad>,
    pub last_updated: i64,
}

/// Holder of the latest and the preceding load value. All three fields change together.
#[derive(Debug)]
pub struct NetworkLoadSnapshot {
    state: Mutex<SnapshotState>,
}

impl NetworkLoadSnapshot {
    pub fn new(initial: NetworkLoad) -> Self {
        Self::new_at(initial, now_millis())
    }

    pub fn new_at(initial: NetworkLoad, now: i64) -> Self {
        Self {
            state: Mutex::new(SnapshotState {
                current: initial,
                previous: None,
                last_updated: now,
            }),
        }
    }

    pub fn update(&self, network_load: NetworkLoad) {
        self.update_at(network_load, now_millis());
    }

    /// `last_updated` never goes backwards, even if `now` does.
    pub fn update_at(&self, network_load: NetworkLoad, now: i64) {
        let mut state = self.state.lock();
        state.previous = Some(state.current);
        state.current = network_load;
        state.last_updated = state.last_updated.max(now);
    }

    pub fn current(&self) -> NetworkLoad {
        self.state.lock().current
    }

    pub fn previous(&self) -> Option<NetworkLoad> {
        self.state.lock().previous
    }

    pub fn last_updated(&self) -> i64 {
        self.state.lock().last_updated
    }

    pub fn state(&self) -> SnapshotState {
        *self.state.lock()
    }

    pub fn is_older_than(&self, max_age: Duration, now: i64) -> bool {
        now.saturating_sub(self.last_updated()) > max_age.as_millis() as i64
    }
}

impl Default for NetworkLoadSnapshot {
    fn default() -> Self {
        Self::new(NetworkLoad::default())
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
