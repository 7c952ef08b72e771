/* The wire seam.

A [`Transport`] dials one physical link to the hub and yields a send half
and a receive half. The session manager owns the only copy of each half and
drops both whenever it considers the link dead, so implementations can tie
resource cleanup to drop.

The in-memory implementation used by tests and the simulator lives in
[`memory`]. */

use std::future::Future;

use bytes::Bytes;

use crate::connection::ConnectionError;
use crate::message::{Disposition, Message, MessageId};

mod memory;

pub use memory::{MemoryBroker, MemoryTransport};

/// A frame written by the device to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A telemetry message.
    Telemetry {
        id: Option<MessageId>,
        payload: Bytes,
    },
    /// Settlement of a previously received hub-to-device message.
    Ack {
        id: MessageId,
        disposition: Disposition,
    },
}

impl From<&Message> for Frame {
    fn from(message: &Message) -> Self {
        Frame::Telemetry {
            id: message.id().cloned(),
            payload: message.payload().clone(),
        }
    }
}

/// A frame read by the device from the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub id: MessageId,
    pub payload: Bytes,
}

/// One way of reaching the hub. Each [`dial`](Transport::dial) establishes a
/// fresh link; earlier links are considered dead once a new one is up.
pub trait Transport: Send + Sync + 'static {
    type Sender: FrameSender;
    type Receiver: FrameReceiver;

    fn dial(
        &self,
    ) -> impl Future<Output = Result<(Self::Sender, Self::Receiver), ConnectionError>> + Send;
}

/// Write half of an established link.
pub trait FrameSender: Send + 'static {
    fn send(&mut self, frame: Frame) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

/// Read half of an established link.
///
/// `recv` must be cancel safe: a dropped `recv` future may not discard a
/// frame, since the session manager races it against other work.
pub trait FrameReceiver: Send + 'static {
    fn recv(&mut self) -> impl Future<Output = Result<InboundFrame, ConnectionError>> + Send;
}
