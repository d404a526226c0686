//! Peer connection manager.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::join_all;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn, Instrument};

use super::table::{ConnectionTable, PeerLink};
use super::{InboundMessage, PeerIncoming};
use crate::addr::PeerAddress;
use crate::config::{with_timeout, NodeConfig};
use crate::registry::Rendezvous;
use crate::{Error, Result};

/// Result of a single [`PeerNode::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new connection was opened and tracked.
    Connected,
    /// The address was already tracked; nothing was opened.
    AlreadyConnected,
    /// The address is this node's own advertised address.
    SelfAddress,
}

/// Result of [`PeerNode::connect_all`].
#[derive(Debug, Default)]
pub struct ConnectReport {
    /// Newly connected addresses.
    pub connected: Vec<PeerAddress>,
    /// Addresses already connected, or this node itself.
    pub skipped: Vec<PeerAddress>,
    /// Addresses that could not be reached.
    pub failed: Vec<(PeerAddress, Error)>,
}

/// Result of [`PeerNode::broadcast`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the message was written to.
    pub delivered: usize,
    /// Connections whose write failed; they are no longer tracked.
    pub evicted: Vec<PeerAddress>,
}

struct NodeInner {
    config: NodeConfig,
    local_addr: SocketAddr,
    advertised: PeerAddress,
    table: ConnectionTable,
    rendezvous: Option<Arc<dyn Rendezvous>>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    shutdown_tx: broadcast::Sender<()>,
}

/// A running peer: listener, outbound dialer and connection table.
///
/// Dropping the node stops the acceptor; call [`shutdown`](Self::shutdown)
/// to also unregister and close every connection.
pub struct PeerNode {
    inner: Arc<NodeInner>,
    acceptor: Option<JoinHandle<()>>,
    registration: Option<JoinHandle<()>>,
}

impl PeerNode {
    /// Start a node that does not talk to a registry.
    pub async fn start(config: NodeConfig) -> Result<(Self, PeerIncoming)> {
        Self::launch(config, None).await
    }

    /// Start a node and announce it through `rendezvous`.
    ///
    /// Registration runs in the background; a failure is logged and does not
    /// stop the node from starting.
    pub async fn start_with_rendezvous<R: Rendezvous>(
        config: NodeConfig,
        rendezvous: R,
    ) -> Result<(Self, PeerIncoming)> {
        Self::launch(config, Some(Arc::new(rendezvous))).await
    }

    async fn launch(
        config: NodeConfig,
        rendezvous: Option<Arc<dyn Rendezvous>>,
    ) -> Result<(Self, PeerIncoming)> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let advertised = PeerAddress::new(config.advertise_host.clone(), local_addr.port());
        let (incoming, inbound) = PeerIncoming::new();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let inner = Arc::new(NodeInner {
            config,
            local_addr,
            advertised,
            table: ConnectionTable::new(),
            rendezvous,
            inbound,
            shutdown_tx,
        });

        info!(%local_addr, advertised = %inner.advertised, "peer node listening");

        let registration = inner.rendezvous.clone().map(|rendezvous| {
            let advertised = inner.advertised.clone();
            tokio::spawn(async move {
                match rendezvous.register(&advertised).await {
                    Ok(()) => debug!(%advertised, "registered with rendezvous"),
                    Err(e) => warn!(%advertised, error = %e, "rendezvous registration failed"),
                }
            })
        });

        let span = tracing::debug_span!("peer_acceptor", %local_addr);
        let acceptor = tokio::spawn(
            accept_loop(Arc::clone(&inner), listener, shutdown_rx).instrument(span),
        );

        Ok((
            Self {
                inner,
                acceptor: Some(acceptor),
                registration,
            },
            incoming,
        ))
    }

    /// The bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The address announced to the registry.
    pub fn advertised_addr(&self) -> &PeerAddress {
        &self.inner.advertised
    }

    /// The node's connection table.
    pub fn connections(&self) -> &ConnectionTable {
        &self.inner.table
    }

    /// Every address with a live tracked connection, sorted.
    pub async fn connected_peers(&self) -> Vec<PeerAddress> {
        self.inner.table.addresses().await
    }

    /// Open a connection to `addr` unless one is already tracked.
    pub async fn connect(&self, addr: &PeerAddress) -> Result<ConnectOutcome> {
        if *addr == self.inner.advertised {
            debug!(peer = %addr, "skipping own address");
            return Ok(ConnectOutcome::SelfAddress);
        }
        if self.inner.table.contains(addr).await {
            debug!(peer = %addr, "already connected");
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        let stream = with_timeout(
            self.inner.config.connect_timeout,
            "connecting to peer",
            TcpStream::connect((addr.host(), addr.port())),
        )
        .await
        .inspect_err(|e| warn!(peer = %addr, error = %e, "failed to connect to peer"))?;

        match self.inner.attach(addr.clone(), stream).await {
            Some(_) => {
                info!(peer = %addr, "connected to peer");
                Ok(ConnectOutcome::Connected)
            }
            None => {
                debug!(peer = %addr, "lost connect race, dropping redundant connection");
                Ok(ConnectOutcome::AlreadyConnected)
            }
        }
    }

    /// Connect to every address concurrently. One failure never stops the others.
    pub async fn connect_all<I>(&self, addrs: I) -> ConnectReport
    where
        I: IntoIterator<Item = PeerAddress>,
    {
        let mut attempts: FuturesUnordered<_> = addrs
            .into_iter()
            .map(|addr| async move {
                let outcome = self.connect(&addr).await;
                (addr, outcome)
            })
            .collect();

        let mut report = ConnectReport::default();
        while let Some((addr, outcome)) = attempts.next().await {
            match outcome {
                Ok(ConnectOutcome::Connected) => report.connected.push(addr),
                Ok(_) => report.skipped.push(addr),
                Err(e) => report.failed.push((addr, e)),
            }
        }
        report
    }

    /// Fetch every registered address and connect to all of them.
    pub async fn discover(&self) -> Result<ConnectReport> {
        let rendezvous = self
            .inner
            .rendezvous
            .as_ref()
            .ok_or_else(|| Error::connection("no rendezvous configured"))?;
        let peers = rendezvous.peers().await?;
        debug!(count = peers.len(), "discovered peers");
        Ok(self.connect_all(peers).await)
    }

    /// Write `message` to every tracked connection.
    ///
    /// Writes go to a snapshot of the table taken up front, all concurrently.
    /// Connections whose write fails are evicted once every write has finished.
    pub async fn broadcast(&self, message: &str) -> BroadcastReport {
        let snapshot = self.inner.table.snapshot().await;
        let timeout = self.inner.config.write_timeout;
        let frame = message.as_bytes();

        let results = join_all(
            snapshot
                .iter()
                .map(|link| async move { (link, link.send(frame, timeout).await) }),
        )
        .await;

        let mut report = BroadcastReport::default();
        for (link, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(peer = %link.addr(), error = %e, "broadcast write failed");
                    self.inner.evict(link).await;
                    report.evicted.push(link.addr().clone());
                }
            }
        }
        trace!(delivered = report.delivered, evicted = report.evicted.len(), "broadcast");
        report
    }

    /// Write `message` to the connection tracked under `target`.
    ///
    /// A failed write evicts the connection and returns the error.
    pub async fn unicast(&self, message: &str, target: &PeerAddress) -> Result<()> {
        let link = self
            .inner
            .table
            .get(target)
            .await
            .ok_or_else(|| Error::NotConnected(target.clone()))?;

        if let Err(e) = link.send(message.as_bytes(), self.inner.config.write_timeout).await {
            warn!(peer = %target, error = %e, "unicast write failed");
            self.inner.evict(&link).await;
            return Err(e);
        }
        Ok(())
    }

    /// Unregister, stop accepting and close every connection.
    ///
    /// A registration still in flight is awaited first so the unregister
    /// lands after it. Both rendezvous steps are bounded by
    /// [`NodeConfig::shutdown_timeout`]. Every error along the way is logged
    /// and swallowed.
    pub async fn shutdown(mut self) -> Result<()> {
        let limit = self.inner.config.shutdown_timeout;

        if let Some(mut registration) = self.registration.take() {
            if tokio::time::timeout(limit, &mut registration).await.is_err() {
                debug!("rendezvous registration still pending at shutdown, aborting it");
                registration.abort();
            }
        }

        if let Some(rendezvous) = &self.inner.rendezvous {
            match tokio::time::timeout(limit, rendezvous.unregister(&self.inner.advertised)).await {
                Ok(Ok(())) => debug!(advertised = %self.inner.advertised, "unregistered from rendezvous"),
                Ok(Err(e)) => debug!(error = %e, "rendezvous unregister failed during shutdown"),
                Err(_) => debug!("rendezvous unregister timed out during shutdown"),
            }
        }

        let _ = self.inner.shutdown_tx.send(());
        if let Some(acceptor) = self.acceptor.take() {
            if let Err(e) = acceptor.await {
                debug!(error = %e, "acceptor task ended abnormally");
            }
        }

        let connections = self.inner.table.drain().await;
        let count = connections.len();
        for (link, reader) in connections {
            reader.abort();
            link.close().await;
        }

        info!(advertised = %self.inner.advertised, closed = count, "peer node stopped");
        Ok(())
    }
}

impl Drop for PeerNode {
    fn drop(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.abort();
        }
    }
}

impl NodeInner {
    /// Track `stream` under `addr` and spawn its receive loop.
    async fn attach(self: &Arc<Self>, addr: PeerAddress, stream: TcpStream) -> Option<PeerLink> {
        let inner = Arc::clone(self);
        self.table
            .attach(addr, stream, move |link, reader| {
                let span = tracing::debug_span!("peer_conn", peer = %link.addr(), id = link.id());
                tokio::spawn(receive_loop(inner, link, reader).instrument(span))
            })
            .await
    }

    /// Stop tracking `link` and close it.
    async fn evict(&self, link: &PeerLink) {
        if let Some(reader) = self.table.remove(link).await {
            reader.abort();
            link.close().await;
            info!(peer = %link.addr(), "evicted peer connection");
        }
    }
}

async fn accept_loop(
    inner: Arc<NodeInner>,
    listener: TcpListener,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("acceptor received shutdown signal");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let addr = PeerAddress::from(remote);
                    if inner.attach(addr.clone(), stream).await.is_some() {
                        info!(peer = %addr, "accepted peer connection");
                    } else {
                        debug!(peer = %addr, "dropping duplicate inbound connection");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "peer accept failed");
                }
            },
        }
    }
}

async fn receive_loop(inner: Arc<NodeInner>, link: PeerLink, mut reader: OwnedReadHalf) {
    let mut buf = vec![0u8; inner.config.read_buffer_size.max(1)];

    loop {
        let read = with_timeout(
            inner.config.idle_timeout,
            "waiting for peer data",
            reader.read(&mut buf),
        )
        .await;

        match read {
            Ok(0) => {
                debug!("peer closed the connection");
                break;
            }
            Ok(n) => {
                let message = InboundMessage {
                    from: link.addr().clone(),
                    payload: String::from_utf8_lossy(&buf[..n]).into_owned(),
                    received_at: Instant::now(),
                };
                if inner.inbound.send(message).is_err() {
                    trace!("inbound receiver dropped, discarding frame");
                }
            }
            Err(e) => {
                warn!(error = %e, "peer read failed");
                break;
            }
        }
    }

    if inner.table.remove(&link).await.is_some() {
        info!(peer = %link.addr(), "peer disconnected");
    }
}
