//! Set of connected subscribers.
//!
//! Membership only changes through `register`/`unregister`. Readers take a
//! `snapshot`, a copy that later registrations and removals don't touch.

use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::DeliveryError;

/// Outbound half of a subscriber connection.
pub trait PayloadSink: Send + Sync {
    fn send(&self, text: Arc<str>) -> BoxFuture<'_, Result<(), DeliveryError>>;
}

/// Unique identifier for a subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl SubscriberId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        SubscriberId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A connected subscriber: its identity, where it connected from, and how to reach it.
#[derive(Clone)]
pub struct SubscriberHandle {
    pub id: SubscriberId,
    pub remote: SocketAddr,
    sink: Arc<dyn PayloadSink>,
}

impl SubscriberHandle {
    pub fn new(remote: SocketAddr, sink: Arc<dyn PayloadSink>) -> Self {
        Self {
            id: SubscriberId::new(),
            remote,
            sink,
        }
    }

    pub fn send(&self, text: Arc<str>) -> BoxFuture<'_, Result<(), DeliveryError>> {
        self.sink.send(text)
    }
}

impl std::fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHandle")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    subscribers: Mutex<BTreeMap<SubscriberId, SubscriberHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: SubscriberHandle) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.insert(handle.id, handle);
    }

    /// Returns false if the subscriber was not registered.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.remove(&id).is_some()
    }

    /// Point-in-time copy of the members, in registration order.
    pub fn snapshot(&self) -> Vec<SubscriberHandle> {
        let subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
