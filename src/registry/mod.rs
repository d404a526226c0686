//! Rendezvous registry: store, service and client.
//!
//! - [`RegistryStore`] owns the address set and its lock
//! - [`RegistryServer`] answers one request per TCP connection
//! - [`RegistryClient`] speaks the same protocol from the node side

pub mod client;
pub mod server;
pub mod store;

pub use client::RegistryClient;
pub use server::{RegistryHandle, RegistryServer};
pub use store::{RegistryEvent, RegistryStore};

use async_trait::async_trait;

use crate::addr::PeerAddress;
use crate::Result;

/// The registry operations a peer node depends on.
///
/// [`RegistryClient`] is the network implementation; anything else that can
/// announce and list addresses works too.
#[async_trait]
pub trait Rendezvous: Send + Sync + 'static {
    /// Announce `addr` as live.
    async fn register(&self, addr: &PeerAddress) -> Result<()>;

    /// Withdraw `addr`.
    async fn unregister(&self, addr: &PeerAddress) -> Result<()>;

    /// Every currently announced address.
    async fn peers(&self) -> Result<Vec<PeerAddress>>;
}

#[async_trait]
impl Rendezvous for RegistryClient {
    async fn register(&self, addr: &PeerAddress) -> Result<()> {
        RegistryClient::register(self, addr).await
    }

    async fn unregister(&self, addr: &PeerAddress) -> Result<()> {
        RegistryClient::unregister(self, addr).await
    }

    async fn peers(&self) -> Result<Vec<PeerAddress>> {
        self.get_peers().await
    }
}
