//! Correlation of asynchronous responses with their requests.
//!
//! At most one request is pending per key. A response resolves it only when it carries the
//! nonce the request was sent with. Every pending slot is single use.

use crate::error::{NetworkError, NetworkResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

struct PendingRequest<R> {
    nonce: i32,
    requested_at: Instant,
    slot: oneshot::Sender<NetworkResult<R>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    NonceMismatch { expected: i32, received: i32 },
    NotPending,
}

/// Receiving side of one pending request. Dropping it before the response arrives releases
/// the slot, so an abandoned request never blocks the next one.
pub struct PendingResponse<'a, K, R>
where
    K: Eq + Hash + Clone + Debug,
{
    requests: &'a CorrelatedRequests<K, R>,
    key: K,
    nonce: i32,
    rx: Option<oneshot::Receiver<NetworkResult<R>>>,
}

impl<'a, K, R> PendingResponse<'a, K, R>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn nonce(&self) -> i32 {
        self.nonce
    }

    /// Waits for the response. On timeout the slot is cleared so a late response is
    /// reported as not pending.
    pub async fn wait(mut self, timeout: Duration) -> NetworkResult<R> {
        let Some(rx) = self.rx.take() else {
            return Err(NetworkError::ChannelClosed);
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetworkError::ChannelClosed),
            Err(_) => Err(NetworkError::Timeout(format!(
                "no response for {:?} within {:?}",
                self.key, timeout
            ))),
        }
    }
}

impl<'a, K, R> Drop for PendingResponse<'a, K, R>
where
    K: Eq + Hash + Clone + Debug,
{
    fn drop(&mut self) {
        let nonce = self.nonce;
        self.requests
            .pending
            .remove_if(&self.key, |_, pending| pending.nonce == nonce);
    }
}

pub struct CorrelatedRequests<K, R>
where
    K: Eq + Hash + Clone + Debug,
{
    pending: DashMap<K, PendingRequest<R>>,
}

impl<K, R> CorrelatedRequests<K, R>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Opens the slot for `key`. Fails if a request for `key` is still pending.
    pub fn register(&self, key: K, nonce: i32) -> NetworkResult<PendingResponse<'_, K, R>> {
        match self.pending.entry(key.clone()) {
            Entry::Occupied(entry) => Err(NetworkError::AlreadyPending(format!("{:?}", entry.key()))),
            Entry::Vacant(entry) => {
                let (slot, rx) = oneshot::channel();
                entry.insert(PendingRequest {
                    nonce,
                    requested_at: Instant::now(),
                    slot,
                });
                Ok(PendingResponse {
                    requests: self,
                    key,
                    nonce,
                    rx: Some(rx),
                })
            }
        }
    }

    pub fn resolve(&self, key: &K, nonce: i32, response: R) -> Resolution {
        match self.pending.remove_if(key, |_, pending| pending.nonce == nonce) {
            Some((_, pending)) => {
                // The requester may have given up already.
                let _ = pending.slot.send(Ok(response));
                Resolution::Completed
            }
            None => match self.pending.get(key) {
                Some(pending) => Resolution::NonceMismatch {
                    expected: pending.nonce,
                    received: nonce,
                },
                None => Resolution::NotPending,
            },
        }
    }

    /// Fails the pending request for `key`, if any.
    pub fn fail(&self, key: &K, error: NetworkError) -> bool {
        match self.pending.remove(key) {
            Some((_, pending)) => {
                let _ = pending.slot.send(Err(error));
                true
            }
            None => false,
        }
    }

    pub fn fail_all(&self, error: impl Fn() -> NetworkError) -> usize {
        let keys: Vec<K> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        keys.iter().filter(|key| self.fail(key, error())).count()
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending_since(&self, key: &K) -> Option<Instant> {
        self.pending.get(key).map(|pending| pending.requested_at)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<K, R> Default for CorrelatedRequests<K, R>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}
