//! Client for the registry's one-request-per-connection protocol.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::addr::PeerAddress;
use crate::config::{with_timeout, ClientConfig};
use crate::protocol::{parse_peer_list, Request, Response};
use crate::{Error, Result};

/// Talks to a registry service at a fixed endpoint.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    endpoint: PeerAddress,
    config: ClientConfig,
}

impl RegistryClient {
    /// Create a client for the registry at `endpoint`.
    pub fn new(endpoint: PeerAddress) -> Self {
        Self::with_config(endpoint, ClientConfig::default())
    }

    /// Create a client with explicit options.
    pub fn with_config(endpoint: PeerAddress, config: ClientConfig) -> Self {
        Self { endpoint, config }
    }

    /// The registry endpoint.
    pub fn endpoint(&self) -> &PeerAddress {
        &self.endpoint
    }

    /// Add `addr` to the registry.
    pub async fn register(&self, addr: &PeerAddress) -> Result<()> {
        self.expect_ok(Request::Register(addr.clone())).await
    }

    /// Remove `addr` from the registry.
    pub async fn unregister(&self, addr: &PeerAddress) -> Result<()> {
        self.expect_ok(Request::Unregister(addr.clone())).await
    }

    /// Every registered address (`GET_PEERS`).
    pub async fn get_peers(&self) -> Result<Vec<PeerAddress>> {
        let payload = self.request(&Request::GetPeers).await?;
        if let Some(code) = Response::code(&payload) {
            return Err(unexpected(code, payload));
        }
        parse_peer_list(&payload).map_err(|_| Error::UnexpectedResponse(payload))
    }

    /// Every registered address (`LIST_PEERS`); `NO_PEERS` becomes an empty list.
    pub async fn list_peers(&self) -> Result<Vec<PeerAddress>> {
        let payload = self.request(&Request::ListPeers).await?;
        match Response::code(&payload) {
            Some(Response::NoPeers) => Ok(Vec::new()),
            Some(code) => Err(unexpected(code, payload)),
            None => parse_peer_list(&payload).map_err(|_| Error::UnexpectedResponse(payload)),
        }
    }

    /// Look up exactly `addr`. `None` when it is not registered.
    pub async fn connect_to(&self, addr: &PeerAddress) -> Result<Option<PeerAddress>> {
        let payload = self.request(&Request::ConnectTo(addr.clone())).await?;
        match Response::code(&payload) {
            Some(Response::NotFound) => Ok(None),
            Some(code) => Err(unexpected(code, payload)),
            None => payload
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Error::UnexpectedResponse(payload)),
        }
    }

    /// Send one request and return the raw response text.
    pub async fn request(&self, request: &Request) -> Result<String> {
        let host = self.endpoint.host();
        let port = self.endpoint.port();
        let timeout = self.config.io_timeout;

        let mut stream = with_timeout(
            timeout,
            "connecting to registry",
            TcpStream::connect((host, port)),
        )
        .await?;

        let encoded = request.encode();
        let payload = with_timeout(timeout, "exchanging with registry", async {
            stream.write_all(encoded.as_bytes()).await?;
            stream.shutdown().await?;
            let mut payload = String::new();
            stream.read_to_string(&mut payload).await?;
            Ok::<_, std::io::Error>(payload)
        })
        .await?;

        debug!(registry = %self.endpoint, %request, response = %payload, "registry exchange");
        Ok(payload)
    }

    async fn expect_ok(&self, request: Request) -> Result<()> {
        let payload = self.request(&request).await?;
        match Response::code(&payload) {
            Some(Response::Ok) => Ok(()),
            Some(code) => Err(unexpected(code, payload)),
            None => Err(Error::UnexpectedResponse(payload)),
        }
    }
}

fn unexpected(code: Response, payload: String) -> Error {
    match code {
        Response::InvalidCommand | Response::UnknownCommand => Error::Rejected(code),
        _ => Error::UnexpectedResponse(payload),
    }
}
