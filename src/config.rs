//! Configuration for the registry service, registry client and peer node.
//!
//! Socket operations carry no timeout by default and may block indefinitely
//! unless one is set. Only the rendezvous calls made during node shutdown are
//! bounded out of the box.

use std::net::SocketAddr;
use std::time::Duration;

/// Default size of a single socket read. Peer frames and registry requests
/// larger than this are split across reads.
pub const DEFAULT_READ_BUFFER: usize = 1024;

/// Default bound on the rendezvous calls a node makes while shutting down.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// What the registry evicts when a client's transport fails mid-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    /// Evict every entry whose host equals the client's source IP.
    ///
    /// Coarse: entries for other ports on the same host go too.
    #[default]
    SourceHost,
    /// Evict only the exact address named by the in-flight request.
    ExactAddress,
    /// Never evict on transport faults.
    Disabled,
}

/// Registry service options.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum bytes read for one request.
    pub read_buffer_size: usize,
    /// Bound on reading the request and writing the response.
    pub request_timeout: Option<Duration>,
    /// Eviction rule for abrupt client disconnects.
    pub cleanup: CleanupPolicy,
    /// Entries not re-registered within this window are expired.
    pub entry_ttl: Option<Duration>,
    /// How often the expiry sweeper runs when `entry_ttl` is set.
    pub sweep_interval: Duration,
    /// Capacity of the registry event channel.
    pub event_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER,
            request_timeout: None,
            cleanup: CleanupPolicy::default(),
            entry_ttl: None,
            sweep_interval: Duration::from_secs(5),
            event_buffer: 64,
        }
    }
}

impl RegistryConfig {
    /// Set the per-request read size. Default: 1024.
    pub fn read_buffer_size(mut self, n: usize) -> Self {
        self.read_buffer_size = n;
        self
    }

    /// Bound each request exchange.
    pub fn request_timeout(mut self, d: Duration) -> Self {
        self.request_timeout = Some(d);
        self
    }

    /// Choose the disconnect cleanup rule. Default: [`CleanupPolicy::SourceHost`].
    pub fn cleanup(mut self, policy: CleanupPolicy) -> Self {
        self.cleanup = policy;
        self
    }

    /// Expire entries after `ttl` without a fresh REGISTER.
    pub fn entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = Some(ttl);
        self
    }

    /// Set the expiry sweep period. Default: 5s.
    pub fn sweep_interval(mut self, d: Duration) -> Self {
        self.sweep_interval = d;
        self
    }

    /// Set the event channel capacity. Default: 64.
    pub fn event_buffer(mut self, n: usize) -> Self {
        self.event_buffer = n;
        self
    }
}

/// Registry client options.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Bound on connecting and on the whole request/response exchange.
    pub io_timeout: Option<Duration>,
}

impl ClientConfig {
    /// Bound connect and exchange.
    pub fn io_timeout(mut self, d: Duration) -> Self {
        self.io_timeout = Some(d);
        self
    }
}

/// Peer node options.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address the node listens on for inbound peers.
    pub listen_addr: SocketAddr,
    /// Host advertised to the registry. The port is always the bound port.
    pub advertise_host: String,
    /// Maximum bytes per inbound frame.
    pub read_buffer_size: usize,
    /// Bound on outbound connects.
    pub connect_timeout: Option<Duration>,
    /// Bound on a single frame write.
    pub write_timeout: Option<Duration>,
    /// Close a connection whose peer has been silent this long.
    pub idle_timeout: Option<Duration>,
    /// Bound on each rendezvous step of [`PeerNode::shutdown`](crate::PeerNode::shutdown).
    pub shutdown_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertise_host: "127.0.0.1".to_string(),
            read_buffer_size: DEFAULT_READ_BUFFER,
            connect_timeout: None,
            write_timeout: None,
            idle_timeout: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl NodeConfig {
    /// Set the listening address.
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set the advertised host. Default: `127.0.0.1`.
    pub fn advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = host.into();
        self
    }

    /// Set the inbound frame size. Default: 1024.
    pub fn read_buffer_size(mut self, n: usize) -> Self {
        self.read_buffer_size = n;
        self
    }

    /// Bound outbound connects.
    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = Some(d);
        self
    }

    /// Bound frame writes.
    pub fn write_timeout(mut self, d: Duration) -> Self {
        self.write_timeout = Some(d);
        self
    }

    /// Drop silent connections after `d`.
    pub fn idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = Some(d);
        self
    }

    /// Bound the registration wait and unregister at shutdown. Default: 5s.
    pub fn shutdown_timeout(mut self, d: Duration) -> Self {
        self.shutdown_timeout = d;
        self
    }
}

/// Run `fut` under an optional timeout, mapping expiry to [`crate::Error::Timeout`].
pub(crate) async fn with_timeout<T, F>(
    limit: Option<Duration>,
    what: &'static str,
    fut: F,
) -> crate::Result<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match limit {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| crate::Error::Timeout(what))?
            .map_err(Into::into),
        None => fut.await.map_err(Into::into),
    }
}
