//! Registry wire codec.
//!
//! One request per TCP connection, whitespace separated text tokens:
//!
//! ```text
//! REGISTER <host> <port>      -> OK | INVALID_COMMAND
//! UNREGISTER <host> <port>    -> OK | INVALID_COMMAND
//! GET_PEERS                   -> "host:port\nhost:port" (empty if none)
//! LIST_PEERS                  -> "host:port\nhost:port" | NO_PEERS
//! CONNECT_TO <host> <port>    -> "host:port" | NOT_FOUND | INVALID_COMMAND
//! anything else               -> UNKNOWN_COMMAND
//! ```

use std::fmt;
use std::str::FromStr;

use crate::addr::PeerAddress;
use crate::error::ProtocolError;
use crate::Result;

const REGISTER: &str = "REGISTER";
const UNREGISTER: &str = "UNREGISTER";
const GET_PEERS: &str = "GET_PEERS";
const LIST_PEERS: &str = "LIST_PEERS";
const CONNECT_TO: &str = "CONNECT_TO";

const OK: &str = "OK";
const INVALID_COMMAND: &str = "INVALID_COMMAND";
const UNKNOWN_COMMAND: &str = "UNKNOWN_COMMAND";
const NOT_FOUND: &str = "NOT_FOUND";
const NO_PEERS: &str = "NO_PEERS";

/// A parsed registry request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Add an address to the registry.
    Register(PeerAddress),
    /// Remove an address from the registry.
    Unregister(PeerAddress),
    /// List all addresses, empty payload when there are none.
    GetPeers,
    /// List all addresses, `NO_PEERS` when there are none.
    ListPeers,
    /// Look up one exact address.
    ConnectTo(PeerAddress),
}

impl Request {
    /// Parse one request from its text form.
    pub fn parse(text: &str) -> std::result::Result<Self, ProtocolError> {
        let mut tokens = text.split_whitespace();
        let command = tokens.next().ok_or(ProtocolError::Empty)?;
        let args: Vec<&str> = tokens.collect();

        match command {
            REGISTER => address_args(REGISTER, &args).map(Self::Register),
            UNREGISTER => address_args(UNREGISTER, &args).map(Self::Unregister),
            GET_PEERS => Ok(Self::GetPeers),
            LIST_PEERS => Ok(Self::ListPeers),
            CONNECT_TO => address_args(CONNECT_TO, &args).map(Self::ConnectTo),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// The address argument carried by the request, if any.
    pub fn address(&self) -> Option<&PeerAddress> {
        match self {
            Self::Register(addr) | Self::Unregister(addr) | Self::ConnectTo(addr) => Some(addr),
            Self::GetPeers | Self::ListPeers => None,
        }
    }

    /// Encode the request for the wire, newline terminated.
    pub fn encode(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register(a) => write!(f, "{REGISTER} {} {}", a.host(), a.port()),
            Self::Unregister(a) => write!(f, "{UNREGISTER} {} {}", a.host(), a.port()),
            Self::GetPeers => f.write_str(GET_PEERS),
            Self::ListPeers => f.write_str(LIST_PEERS),
            Self::ConnectTo(a) => write!(f, "{CONNECT_TO} {} {}", a.host(), a.port()),
        }
    }
}

impl FromStr for Request {
    type Err = ProtocolError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn address_args(
    command: &'static str,
    args: &[&str],
) -> std::result::Result<PeerAddress, ProtocolError> {
    let [host, port] = args else {
        return Err(ProtocolError::InvalidArity {
            command,
            expected: 2,
            got: args.len(),
        });
    };
    let port = port.parse::<u16>().map_err(|_| ProtocolError::InvalidPort {
        command,
        port: port.to_string(),
    })?;
    Ok(PeerAddress::new(*host, port))
}

/// A registry response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Mutation accepted.
    Ok,
    /// Known command with bad arguments.
    InvalidCommand,
    /// Unrecognized command name.
    UnknownCommand,
    /// `CONNECT_TO` found no exact match.
    NotFound,
    /// `LIST_PEERS` on an empty registry.
    NoPeers,
    /// `CONNECT_TO` hit.
    Peer(PeerAddress),
    /// `GET_PEERS` / `LIST_PEERS` listing.
    Peers(Vec<PeerAddress>),
}

impl Response {
    /// Encode the response for the wire.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Interpret a raw payload as one of the fixed response codes.
    pub fn code(text: &str) -> Option<Self> {
        match text.trim() {
            OK => Some(Self::Ok),
            INVALID_COMMAND => Some(Self::InvalidCommand),
            UNKNOWN_COMMAND => Some(Self::UnknownCommand),
            NOT_FOUND => Some(Self::NotFound),
            NO_PEERS => Some(Self::NoPeers),
            _ => None,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str(OK),
            Self::InvalidCommand => f.write_str(INVALID_COMMAND),
            Self::UnknownCommand => f.write_str(UNKNOWN_COMMAND),
            Self::NotFound => f.write_str(NOT_FOUND),
            Self::NoPeers => f.write_str(NO_PEERS),
            Self::Peer(addr) => write!(f, "{addr}"),
            Self::Peers(peers) => {
                for (i, addr) in peers.iter().enumerate() {
                    if i > 0 {
                        f.write_str("\n")?;
                    }
                    write!(f, "{addr}")?;
                }
                Ok(())
            }
        }
    }
}

/// Parse a newline-joined `host:port` listing. Blank lines are skipped.
pub fn parse_peer_list(payload: &str) -> Result<Vec<PeerAddress>> {
    payload
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::parse)
        .collect()
}
