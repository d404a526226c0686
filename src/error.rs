//! Error types for rendezvous-mesh.

use crate::addr::PeerAddress;
use crate::protocol::Response;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error on a registry or peer socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A socket operation exceeded its configured timeout.
    #[error("timed out while {0}")]
    Timeout(&'static str),

    /// A `host:port` string could not be parsed.
    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    /// The registry answered with an error code.
    #[error("registry rejected request: {0}")]
    Rejected(Response),

    /// The registry answered with something the request does not expect.
    #[error("unexpected registry response: {0:?}")]
    UnexpectedResponse(String),

    /// No connection is tracked for the address.
    #[error("not connected to {0}")]
    NotConnected(PeerAddress),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),
}

impl Error {
    /// Create a connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Whether this error means the remote end went away abruptly.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io(e) => is_disconnect(e),
            _ => false,
        }
    }
}

/// A malformed or unsupported registry request.
///
/// Always answered on the wire; never propagated past the request handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The request contained no command token.
    #[error("empty request")]
    Empty,

    /// The command name is not part of the protocol.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    /// The command was given the wrong number of arguments.
    #[error("{command} expects {expected} arguments, got {got}")]
    InvalidArity {
        /// Command name.
        command: &'static str,
        /// Required argument count.
        expected: usize,
        /// Supplied argument count.
        got: usize,
    },

    /// The port argument is not a valid `u16`.
    #[error("{command}: invalid port {port:?}")]
    InvalidPort {
        /// Command name.
        command: &'static str,
        /// The offending token.
        port: String,
    },
}

impl ProtocolError {
    /// The response code sent back for this error.
    pub fn response(&self) -> Response {
        match self {
            Self::Empty | Self::UnknownCommand(_) => Response::UnknownCommand,
            Self::InvalidArity { .. } | Self::InvalidPort { .. } => Response::InvalidCommand,
        }
    }
}

/// Transport failures that count as an abrupt disconnect.
pub(crate) fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionAborted
    )
}
