//! Registry store: the shared set of live peer addresses.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::info;

use crate::addr::PeerAddress;

/// A change to the registry contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A REGISTER added a new address.
    Registered(PeerAddress),
    /// An UNREGISTER removed an address.
    Unregistered(PeerAddress),
    /// Disconnect cleanup removed an address.
    Evicted(PeerAddress),
    /// TTL expiry removed an address.
    Expired(PeerAddress),
}

/// Concurrency-safe set of registered peer addresses.
///
/// Every operation takes the lock once, mutates or copies the in-memory map,
/// and releases it before returning. Listings are therefore point-in-time
/// snapshots. Each address maps to the instant it was last registered.
#[derive(Debug)]
pub struct RegistryStore {
    peers: Mutex<BTreeMap<PeerAddress, Instant>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_event_buffer(64)
    }

    /// Create an empty store whose event channel holds `capacity` events.
    pub fn with_event_buffer(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            peers: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    /// Subscribe to registry changes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Add `addr`, or refresh its registration time. Returns true if newly added.
    pub async fn register(&self, addr: PeerAddress) -> bool {
        let added = {
            let mut peers = self.peers.lock().await;
            peers.insert(addr.clone(), Instant::now()).is_none()
        };
        if added {
            info!(host = addr.host(), port = addr.port(), "peer registered");
            let _ = self.events.send(RegistryEvent::Registered(addr));
        }
        added
    }

    /// Remove `addr`. Returns true if it was present.
    pub async fn unregister(&self, addr: &PeerAddress) -> bool {
        let removed = self.peers.lock().await.remove(addr).is_some();
        if removed {
            info!(host = addr.host(), port = addr.port(), "peer unregistered");
            let _ = self.events.send(RegistryEvent::Unregistered(addr.clone()));
        }
        removed
    }

    /// Remove `addr` as part of disconnect cleanup.
    pub async fn evict(&self, addr: &PeerAddress) -> bool {
        let removed = self.peers.lock().await.remove(addr).is_some();
        if removed {
            info!(host = addr.host(), port = addr.port(), "peer evicted");
            let _ = self.events.send(RegistryEvent::Evicted(addr.clone()));
        }
        removed
    }

    /// Remove every address whose host is exactly `host`.
    pub async fn evict_host(&self, host: &str) -> Vec<PeerAddress> {
        let evicted: Vec<PeerAddress> = {
            let mut peers = self.peers.lock().await;
            let matching: Vec<PeerAddress> =
                peers.keys().filter(|a| a.host() == host).cloned().collect();
            for addr in &matching {
                peers.remove(addr);
            }
            matching
        };
        for addr in &evicted {
            info!(host = addr.host(), port = addr.port(), "peer evicted");
            let _ = self.events.send(RegistryEvent::Evicted(addr.clone()));
        }
        evicted
    }

    /// Remove every address not registered within `ttl` of `now`.
    pub async fn expire(&self, ttl: Duration, now: Instant) -> Vec<PeerAddress> {
        let expired: Vec<PeerAddress> = {
            let mut peers = self.peers.lock().await;
            let stale: Vec<PeerAddress> = peers
                .iter()
                .filter(|(_, seen)| now.saturating_duration_since(**seen) >= ttl)
                .map(|(addr, _)| addr.clone())
                .collect();
            for addr in &stale {
                peers.remove(addr);
            }
            stale
        };
        for addr in &expired {
            info!(host = addr.host(), port = addr.port(), "peer expired");
            let _ = self.events.send(RegistryEvent::Expired(addr.clone()));
        }
        expired
    }

    /// Point-in-time copy of every registered address, sorted.
    pub async fn snapshot(&self) -> Vec<PeerAddress> {
        self.peers.lock().await.keys().cloned().collect()
    }

    /// Whether exactly `addr` is registered.
    pub async fn contains(&self, addr: &PeerAddress) -> bool {
        self.peers.lock().await.contains_key(addr)
    }

    /// Number of registered addresses.
    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }
}
