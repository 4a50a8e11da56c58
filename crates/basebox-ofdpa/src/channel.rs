//! Outbound message seam towards an attached datapath.

use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::codec::OfFrame;
use crate::message::OfMessage;

/// Reasons a message could not be queued for the datapath.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The outbound queue is full; the caller may retry later.
    #[error("datapath channel congested")]
    Congested,

    /// The connection is gone.
    #[error("datapath channel down")]
    Down,
}

/// Fire-and-forget sender of OpenFlow messages.
///
/// Implementations never block; a successful return only means the message
/// was queued.
pub trait DatapathChannel: Send + Sync {
    /// Sends `message` with a fresh transaction id.
    fn send(&self, message: OfMessage) -> Result<(), ChannelError>;

    /// Sends `message` reusing the transaction id of a request.
    fn reply(&self, xid: u32, message: OfMessage) -> Result<(), ChannelError>;
}

/// [`DatapathChannel`] backed by a bounded queue that a connection writer
/// task drains into the socket.
#[derive(Debug)]
pub struct QueuedChannel {
    tx: mpsc::Sender<OfFrame>,
    next_xid: AtomicU32,
}

impl QueuedChannel {
    pub fn new(tx: mpsc::Sender<OfFrame>) -> Self {
        Self {
            tx,
            next_xid: AtomicU32::new(1),
        }
    }

    /// Creates a channel together with the receiving end of its queue.
    pub fn bounded(depth: usize) -> (Self, mpsc::Receiver<OfFrame>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self::new(tx), rx)
    }

    fn next_xid(&self) -> u32 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    fn push(&self, frame: OfFrame) -> Result<(), ChannelError> {
        self.tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ChannelError::Congested,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Down,
        })
    }
}

impl DatapathChannel for QueuedChannel {
    fn send(&self, message: OfMessage) -> Result<(), ChannelError> {
        let xid = self.next_xid();
        self.push(OfFrame::new(xid, message))
    }

    fn reply(&self, xid: u32, message: OfMessage) -> Result<(), ChannelError> {
        self.push(OfFrame::new(xid, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_send_assigns_increasing_xids() {
        let (channel, mut rx) = QueuedChannel::bounded(4);
        channel.send(OfMessage::BarrierRequest).unwrap();
        channel.send(OfMessage::FeaturesRequest).unwrap();
        channel.reply(77, OfMessage::EchoReply(vec![])).unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!(first.xid + 1, second.xid);
        assert_eq!(second.message, OfMessage::FeaturesRequest);
        assert_eq!(third.xid, 77);
    }

    #[test]
    fn test_full_queue_reports_congestion() {
        let (channel, _rx) = QueuedChannel::bounded(1);
        channel.send(OfMessage::Hello).unwrap();
        assert_eq!(channel.send(OfMessage::Hello), Err(ChannelError::Congested));
    }

    #[test]
    fn test_closed_queue_reports_down() {
        let (channel, rx) = QueuedChannel::bounded(1);
        drop(rx);
        assert_eq!(channel.send(OfMessage::Hello), Err(ChannelError::Down));
    }
}
