//! Registry service: accept loop and per-connection request handler.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use super::store::RegistryStore;
use crate::config::{with_timeout, CleanupPolicy, RegistryConfig};
use crate::protocol::{Request, Response};
use crate::{Error, Result};

/// `tokio::time::interval` rejects a zero period.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// A bound, not yet running, registry service.
pub struct RegistryServer {
    listener: TcpListener,
    store: Arc<RegistryStore>,
    config: Arc<RegistryConfig>,
}

impl RegistryServer {
    /// Bind the service to `addr` with an empty store.
    pub async fn bind(addr: impl ToSocketAddrs, config: RegistryConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let store = Arc::new(RegistryStore::with_event_buffer(config.event_buffer));
        Ok(Self {
            listener,
            store,
            config: Arc::new(config),
        })
    }

    /// Serve an existing store instead of the empty one created by [`bind`](Self::bind).
    pub fn with_store(mut self, store: Arc<RegistryStore>) -> Self {
        self.store = store;
        self
    }

    /// The bound listening address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The store this service answers from.
    pub fn store(&self) -> Arc<RegistryStore> {
        Arc::clone(&self.store)
    }

    /// Run the accept loop forever.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Run the accept loop until `signal` completes.
    ///
    /// Requests already accepted keep running on their own tasks.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = self.local_addr()?;
        info!(%local_addr, "registry listening");

        let ttl = self.config.entry_ttl;
        let mut sweep = tokio::time::interval(self.config.sweep_interval.max(MIN_SWEEP_INTERVAL));
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    debug!(%local_addr, "registry received shutdown signal");
                    break;
                }
                _ = sweep.tick(), if ttl.is_some() => {
                    if let Some(ttl) = ttl {
                        let expired = self.store.expire(ttl, Instant::now()).await;
                        if !expired.is_empty() {
                            debug!(count = expired.len(), "expired stale registrations");
                        }
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let store = Arc::clone(&self.store);
                        let config = Arc::clone(&self.config);
                        let span = tracing::debug_span!("registry_conn", %peer);
                        tokio::spawn(
                            async move {
                                handle_connection(stream, peer, &store, &config).await;
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "registry accept failed");
                    }
                },
            }
        }

        info!(%local_addr, "registry stopped");
        Ok(())
    }

    /// Run the service on a background task.
    pub fn spawn(self) -> Result<RegistryHandle> {
        let local_addr = self.local_addr()?;
        let store = self.store();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let driver = tokio::spawn(self.serve_with_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        }));
        Ok(RegistryHandle {
            local_addr,
            store,
            shutdown_tx,
            driver,
        })
    }
}

/// Guard for a registry service running in the background.
pub struct RegistryHandle {
    local_addr: SocketAddr,
    store: Arc<RegistryStore>,
    shutdown_tx: broadcast::Sender<()>,
    driver: tokio::task::JoinHandle<Result<()>>,
}

impl RegistryHandle {
    /// The bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The store the service answers from.
    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    /// Stop accepting and wait for the accept loop to exit.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        match self.driver.await {
            Ok(res) => res,
            Err(e) => Err(Error::connection(format!("registry task failed: {e}"))),
        }
    }
}

/// Answer a single parsed request against `store`.
pub async fn dispatch(store: &RegistryStore, request: &Request) -> Response {
    match request {
        Request::Register(addr) => {
            store.register(addr.clone()).await;
            Response::Ok
        }
        Request::Unregister(addr) => {
            store.unregister(addr).await;
            Response::Ok
        }
        Request::GetPeers => Response::Peers(store.snapshot().await),
        Request::ListPeers => {
            let peers = store.snapshot().await;
            if peers.is_empty() {
                Response::NoPeers
            } else {
                Response::Peers(peers)
            }
        }
        Request::ConnectTo(addr) => {
            if store.contains(addr).await {
                Response::Peer(addr.clone())
            } else {
                Response::NotFound
            }
        }
    }
}

/// Serve exactly one request on `stream`, then close it.
///
/// Never fails: malformed requests are answered with an error code and
/// transport faults are logged and trigger disconnect cleanup.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    store: &RegistryStore,
    config: &RegistryConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; config.read_buffer_size.max(1)];
    let n = match with_timeout(config.request_timeout, "reading request", stream.read(&mut buf)).await
    {
        Ok(0) => {
            debug!(%peer, "client closed without a request");
            return;
        }
        Ok(n) => n,
        Err(e) => {
            cleanup_after_fault(&e, peer, None, store, config.cleanup).await;
            return;
        }
    };

    let text = String::from_utf8_lossy(&buf[..n]);
    let (request, response) = match Request::parse(&text) {
        Ok(request) => {
            let response = dispatch(store, &request).await;
            debug!(%peer, %request, %response, "handled request");
            (Some(request), response)
        }
        Err(e) => {
            debug!(%peer, error = %e, "rejected request");
            (None, e.response())
        }
    };

    let payload = response.encode();
    let written = with_timeout(config.request_timeout, "writing response", async {
        stream.write_all(payload.as_bytes()).await?;
        stream.flush().await
    })
    .await;

    if let Err(e) = written {
        cleanup_after_fault(&e, peer, request.as_ref(), store, config.cleanup).await;
        return;
    }
    let _ = stream.shutdown().await;
}

async fn cleanup_after_fault(
    err: &Error,
    peer: SocketAddr,
    request: Option<&Request>,
    store: &RegistryStore,
    policy: CleanupPolicy,
) {
    warn!(%peer, error = %err, "registry client transport failed");
    if !err.is_disconnect() {
        return;
    }

    match policy {
        CleanupPolicy::SourceHost => {
            let host = peer.ip().to_string();
            let evicted = store.evict_host(&host).await;
            if !evicted.is_empty() {
                info!(%peer, count = evicted.len(), "evicted registrations for disconnected host");
            }
        }
        CleanupPolicy::ExactAddress => {
            if let Some(addr) = request.and_then(Request::address) {
                store.evict(addr).await;
            }
        }
        CleanupPolicy::Disabled => {}
    }
}
