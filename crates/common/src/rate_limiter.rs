//! Sliding-window rate limiting per identity.
//!
//! Each identity keeps one timestamp queue covering the daily window. The queue is
//! behind its own lock; the map only hands out the queue.

use crate::clock::{Clock, SystemClock};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

const SECOND_MS: i64 = 1_000;
const MINUTE_MS: i64 = 60 * SECOND_MS;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Maximum number of events allowed inside each window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_per_second: usize,
    pub max_per_minute: usize,
    pub max_per_hour: usize,
    pub max_per_day: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_second: 10,
            max_per_minute: 100,
            max_per_hour: 1_000,
            max_per_day: 10_000,
        }
    }
}

pub struct RateLimiter<K = String>
where
    K: Eq + Hash + Clone,
{
    config: RateLimitConfig,
    queues: DashMap<K, Arc<Mutex<VecDeque<i64>>>>,
    clock: Arc<dyn Clock>,
}

impl<K> RateLimiter<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            queues: DashMap::new(),
            clock,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Records an event for `identity` and reports whether any window is now over its limit.
    pub fn exceeds_limit(&self, identity: &K) -> bool {
        let now = self.clock.now_millis();
        let queue = self.queue(identity);
        let mut timestamps = queue.lock();

        timestamps.push_back(now);
        evict_older_than(&mut timestamps, now - DAY_MS);

        let per_second = count_since(&timestamps, now - SECOND_MS);
        let per_minute = count_since(&timestamps, now - MINUTE_MS);
        let per_hour = count_since(&timestamps, now - HOUR_MS);
        let per_day = timestamps.len();

        let exceeded = per_second > self.config.max_per_second
            || per_minute > self.config.max_per_minute
            || per_hour > self.config.max_per_hour
            || per_day > self.config.max_per_day;

        if exceeded {
            debug!(
                "Rate limit exceeded: second={} minute={} hour={} day={}",
                per_second, per_minute, per_hour, per_day
            );
        }
        exceeded
    }

    /// Number of events recorded for `identity` inside the daily window.
    pub fn daily_count(&self, identity: &K) -> usize {
        let now = self.clock.now_millis();
        self.queues
            .get(identity)
            .map(|queue| count_since(&queue.lock(), now - DAY_MS))
            .unwrap_or(0)
    }

    pub fn remove_identity(&self, identity: &K) {
        self.queues.remove(identity);
    }

    /// Drops identities with no events inside the daily window.
    pub fn cleanup_idle(&self) -> usize {
        let cutoff = self.clock.now_millis() - DAY_MS;
        let before = self.queues.len();
        self.queues.retain(|_, queue| {
            let mut timestamps = queue.lock();
            evict_older_than(&mut timestamps, cutoff);
            !timestamps.is_empty()
        });
        before - self.queues.len()
    }

    pub fn tracked_identities(&self) -> usize {
        self.queues.len()
    }

    fn queue(&self, identity: &K) -> Arc<Mutex<VecDeque<i64>>> {
        if let Some(queue) = self.queues.get(identity) {
            return Arc::clone(queue.value());
        }
        Arc::clone(
            self.queues
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
                .value(),
        )
    }
}

fn evict_older_than(timestamps: &mut VecDeque<i64>, cutoff: i64) {
    while matches!(timestamps.front(), Some(&ts) if ts <= cutoff) {
        timestamps.pop_front();
    }
}

fn count_since(timestamps: &VecDeque<i64>, cutoff: i64) -> usize {
    timestamps.iter().rev().take_while(|&&ts| ts > cutoff).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::thread;
    use std::time::Duration;

    fn limiter(config: RateLimitConfig) -> (Arc<ManualClock>, RateLimiter<String>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let limiter = RateLimiter::with_clock(config, clock.clone());
        (clock, limiter)
    }

    fn config(second: usize, minute: usize, hour: usize, day: usize) -> RateLimitConfig {
        RateLimitConfig {
            max_per_second: second,
            max_per_minute: minute,
            max_per_hour: hour,
            max_per_day: day,
        }
    }

    #[test]
    fn test_fourth_call_within_second_exceeds() {
        let (_clock, limiter) = limiter(config(3, 100, 1_000, 10_000));
        let peer = "peer-a".to_string();

        assert!(!limiter.exceeds_limit(&peer));
        assert!(!limiter.exceeds_limit(&peer));
        assert!(!limiter.exceeds_limit(&peer));
        assert!(limiter.exceeds_limit(&peer));
    }

    #[test]
    fn test_short_windows_roll_off() {
        let (clock, limiter) = limiter(config(3, 100, 1_000, 10_000));
        let peer = "peer-a".to_string();

        for _ in 0..4 {
            limiter.exceeds_limit(&peer);
        }
        clock.advance(Duration::from_secs(3_601));

        assert!(!limiter.exceeds_limit(&peer));
        assert_eq!(limiter.daily_count(&peer), 5);
    }

    #[test]
    fn test_daily_window_still_counts_after_an_hour() {
        let (clock, limiter) = limiter(config(10, 10, 10, 3));
        let peer = "peer-a".to_string();

        for _ in 0..3 {
            assert!(!limiter.exceeds_limit(&peer));
            clock.advance(Duration::from_secs(2 * 3_600));
        }
        assert!(limiter.exceeds_limit(&peer));

        clock.advance(Duration::from_secs(25 * 3_600));
        assert!(!limiter.exceeds_limit(&peer));
        assert_eq!(limiter.daily_count(&peer), 1);
    }

    #[test]
    fn test_minute_window() {
        let (clock, limiter) = limiter(config(10, 2, 100, 100));
        let peer = "peer-a".to_string();

        assert!(!limiter.exceeds_limit(&peer));
        clock.advance(Duration::from_secs(10));
        assert!(!limiter.exceeds_limit(&peer));
        clock.advance(Duration::from_secs(10));
        assert!(limiter.exceeds_limit(&peer));

        clock.advance(Duration::from_secs(61));
        assert!(!limiter.exceeds_limit(&peer));
    }

    #[test]
    fn test_identities_are_independent() {
        let (_clock, limiter) = limiter(config(1, 100, 100, 100));
        let a = "peer-a".to_string();
        let b = "peer-b".to_string();

        assert!(!limiter.exceeds_limit(&a));
        assert!(limiter.exceeds_limit(&a));
        assert!(!limiter.exceeds_limit(&b));
        assert_eq!(limiter.tracked_identities(), 2);
    }

    #[test]
    fn test_cleanup_idle_identities() {
        let (clock, limiter) = limiter(RateLimitConfig::default());
        limiter.exceeds_limit(&"old".to_string());
        clock.advance(Duration::from_secs(23 * 3_600));
        limiter.exceeds_limit(&"recent".to_string());
        clock.advance(Duration::from_secs(2 * 3_600));

        assert_eq!(limiter.cleanup_idle(), 1);
        assert_eq!(limiter.tracked_identities(), 1);
        assert_eq!(limiter.daily_count(&"recent".to_string()), 1);
    }

    #[test]
    fn test_concurrent_identities() {
        let (_clock, limiter) = limiter(config(1_000, 1_000, 1_000, 1_000));
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || {
                    let id = format!("peer-{}", i % 4);
                    for _ in 0..100 {
                        limiter.exceeds_limit(&id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for i in 0..4 {
            assert_eq!(limiter.daily_count(&format!("peer-{}", i)), 200);
        }
    }
}
