//! Connection table: node-local map from peer address to live connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};

use crate::addr::PeerAddress;
use crate::config::with_timeout;
use crate::Result;

/// Write side of one tracked connection.
///
/// Cheap to clone; clones share the socket. Writes through different clones
/// are serialized per connection.
#[derive(Debug, Clone)]
pub struct PeerLink {
    id: u64,
    addr: PeerAddress,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl PeerLink {
    /// Unique id of this connection within its table.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The address the connection is tracked under.
    pub fn addr(&self) -> &PeerAddress {
        &self.addr
    }

    /// Write one frame.
    pub(crate) async fn send(&self, frame: &[u8], timeout: Option<Duration>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        with_timeout(timeout, "writing frame", async {
            writer.write_all(frame).await?;
            writer.flush().await
        })
        .await
    }

    /// Half-close the write side, ignoring errors.
    pub(crate) async fn close(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

struct Entry {
    link: PeerLink,
    reader: AbortHandle,
}

/// Live connections keyed by peer address, at most one per address.
///
/// The lock only guards the map; no socket I/O happens while it is held.
#[derive(Default)]
pub struct ConnectionTable {
    entries: Mutex<HashMap<PeerAddress, Entry>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ConnectionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTable")
            .field("entries", &"<Mutex<HashMap<PeerAddress, Entry>>>")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConnectionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `stream` under `addr` and start its receive loop.
    ///
    /// `start` is handed the new link and the read half and must spawn the
    /// loop. Returns `None`, dropping `stream`, if `addr` is already tracked.
    pub(crate) async fn attach<F>(
        &self,
        addr: PeerAddress,
        stream: TcpStream,
        start: F,
    ) -> Option<PeerLink>
    where
        F: FnOnce(PeerLink, OwnedReadHalf) -> JoinHandle<()>,
    {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&addr) {
            return None;
        }

        let (read_half, write_half) = stream.into_split();
        let link = PeerLink {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            addr: addr.clone(),
            writer: Arc::new(Mutex::new(write_half)),
        };
        let reader = start(link.clone(), read_half).abort_handle();
        entries.insert(
            addr,
            Entry {
                link: link.clone(),
                reader,
            },
        );
        Some(link)
    }

    /// Stop tracking `link`, unless its address now belongs to a newer connection.
    ///
    /// Returns the receive loop's abort handle when the entry was removed.
    pub(crate) async fn remove(&self, link: &PeerLink) -> Option<AbortHandle> {
        let mut entries = self.entries.lock().await;
        match entries.get(&link.addr) {
            Some(entry) if entry.link.id == link.id => {
                entries.remove(&link.addr).map(|entry| entry.reader)
            }
            _ => None,
        }
    }

    /// Remove every entry.
    pub(crate) async fn drain(&self) -> Vec<(PeerLink, AbortHandle)> {
        self.entries
            .lock()
            .await
            .drain()
            .map(|(_, entry)| (entry.link, entry.reader))
            .collect()
    }

    /// Immutable copy of every tracked link.
    pub async fn snapshot(&self) -> Vec<PeerLink> {
        self.entries
            .lock()
            .await
            .values()
            .map(|entry| entry.link.clone())
            .collect()
    }

    /// The link tracked under `addr`.
    pub async fn get(&self, addr: &PeerAddress) -> Option<PeerLink> {
        self.entries
            .lock()
            .await
            .get(addr)
            .map(|entry| entry.link.clone())
    }

    /// Whether `addr` is tracked.
    pub async fn contains(&self, addr: &PeerAddress) -> bool {
        self.entries.lock().await.contains_key(addr)
    }

    /// Every tracked address, sorted.
    pub async fn addresses(&self) -> Vec<PeerAddress> {
        let mut addrs: Vec<PeerAddress> = self.entries.lock().await.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// Number of tracked connections.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nothing is tracked.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
