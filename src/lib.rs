//! Rendezvous discovery and direct peer-to-peer messaging over TCP.
//!
//! Two halves:
//!
//! - [`registry`]: a rendezvous service that stores live peer endpoints and
//!   answers one text request per connection
//! - [`peer`]: a per-node connection manager that registers itself, dials
//!   the peers the registry knows about and broadcasts over every open
//!   connection
//!
//! ```no_run
//! use rendezvous_mesh::{NodeConfig, PeerAddress, PeerNode, RegistryClient, RegistryConfig, RegistryServer};
//!
//! # async fn run() -> rendezvous_mesh::Result<()> {
//! let registry = RegistryServer::bind("127.0.0.1:5000", RegistryConfig::default())
//!     .await?
//!     .spawn()?;
//!
//! let client = RegistryClient::new(PeerAddress::from(registry.local_addr()));
//! let (node, mut incoming) = PeerNode::start_with_rendezvous(NodeConfig::default(), client).await?;
//! node.discover().await?;
//! node.broadcast("hello").await;
//!
//! if let Some(msg) = incoming.recv().await {
//!     println!("{}: {}", msg.from, msg.payload);
//! }
//! node.shutdown().await?;
//! registry.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod addr;
pub mod config;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod registry;

// Re-export key types
pub use addr::PeerAddress;
pub use config::{CleanupPolicy, ClientConfig, NodeConfig, RegistryConfig};
pub use error::{Error, ProtocolError, Result};
pub use peer::{BroadcastReport, ConnectOutcome, ConnectReport, InboundMessage, PeerIncoming, PeerNode};
pub use protocol::{Request, Response};
pub use registry::{
    RegistryClient, RegistryEvent, RegistryHandle, RegistryServer, RegistryStore, Rendezvous,
};
