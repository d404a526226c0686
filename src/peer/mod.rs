//! Direct peer-to-peer connections.
//!
//! A [`PeerNode`] listens for inbound peers, dials outbound ones, and fans
//! messages out over every live connection tracked in its [`ConnectionTable`].
//! Inbound frames arrive on the [`PeerIncoming`] stream returned at startup.

pub mod node;
pub mod table;

pub use node::{BroadcastReport, ConnectOutcome, ConnectReport, PeerNode};
pub use table::{ConnectionTable, PeerLink};

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::addr::PeerAddress;

/// One frame read from a peer connection.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// The address the connection is tracked under.
    pub from: PeerAddress,
    /// Frame contents, decoded lossily as UTF-8.
    pub payload: String,
    /// When the frame was read.
    pub received_at: Instant,
}

/// Stream of frames received on any of a node's connections.
///
/// Ends once the node has shut down and every receive loop has exited.
pub struct PeerIncoming {
    receiver: UnboundedReceiverStream<InboundMessage>,
}

impl PeerIncoming {
    pub(crate) fn new() -> (Self, mpsc::UnboundedSender<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let incoming = Self {
            receiver: UnboundedReceiverStream::new(rx),
        };
        (incoming, tx)
    }

    /// Wait for the next inbound frame.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.receiver.next().await
    }
}

impl Stream for PeerIncoming {
    type Item = InboundMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}
