use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};

use crate::connection::ConnectionError;
use crate::message::MessageId;
use crate::transport::{Frame, FrameReceiver, FrameSender, InboundFrame, Transport};

#[derive(Default)]
struct LinkState {
    /// Bumped on every successful dial. Senders from older epochs fail.
    epoch: u64,
    to_device: Option<mpsc::UnboundedSender<InboundFrame>>,
}

struct Shared {
    dials: AtomicUsize,
    refuse: AtomicUsize,
    stall: AtomicUsize,
    fail_sends: AtomicUsize,
    stall_sends: AtomicUsize,
    state: Mutex<LinkState>,
}

/// In-process transport connected to a [`MemoryBroker`] acting as the hub.
///
/// Used by the test suite and the device simulator. The broker side can
/// observe every frame the device sends, deliver hub-to-device messages,
/// and inject dial failures or link drops.
pub struct MemoryTransport {
    shared: Arc<Shared>,
    sent_tx: mpsc::UnboundedSender<Frame>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryBroker) {
        let shared = Arc::new(Shared {
            dials: AtomicUsize::new(0),
            refuse: AtomicUsize::new(0),
            stall: AtomicUsize::new(0),
            fail_sends: AtomicUsize::new(0),
            stall_sends: AtomicUsize::new(0),
            state: Mutex::new(LinkState::default()),
        });
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                shared: shared.clone(),
                sent_tx,
            },
            MemoryBroker { shared, sent_rx },
        )
    }
}

impl Transport for MemoryTransport {
    type Sender = MemorySender;
    type Receiver = MemoryReceiver;

    async fn dial(&self) -> Result<(Self::Sender, Self::Receiver), ConnectionError> {
        self.shared.dials.fetch_add(1, Ordering::SeqCst);

        if take_token(&self.shared.refuse) {
            return Err(ConnectionError::new("connection refused"));
        }
        if take_token(&self.shared.stall) {
            // Simulates a dial that never completes, for timeout tests
            std::future::pending::<()>().await;
        }

        let (to_device, rx) = mpsc::unbounded_channel();
        let epoch = {
            let mut state = self.shared.state.lock().await;
            state.epoch += 1;
            state.to_device = Some(to_device);
            state.epoch
        };

        Ok((
            MemorySender {
                shared: self.shared.clone(),
                epoch,
                sent_tx: self.sent_tx.clone(),
            },
            MemoryReceiver { rx },
        ))
    }
}

fn take_token(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct MemorySender {
    shared: Arc<Shared>,
    epoch: u64,
    sent_tx: mpsc::UnboundedSender<Frame>,
}

impl FrameSender for MemorySender {
    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        if take_token(&self.shared.fail_sends) {
            return Err(ConnectionError::new("write failed"));
        }
        if take_token(&self.shared.stall_sends) {
            // Simulates a write that never completes, for timeout tests
            std::future::pending::<()>().await;
        }
        {
            let state = self.shared.state.lock().await;
            if state.epoch != self.epoch || state.to_device.is_none() {
                return Err(ConnectionError::new("link lost"));
            }
        }
        self.sent_tx
            .send(frame)
            .map_err(|_| ConnectionError::new("link lost"))
    }
}

pub struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<InboundFrame>,
}

impl FrameReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Result<InboundFrame, ConnectionError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| ConnectionError::new("link lost"))
    }
}

/// Hub side of a [`MemoryTransport`] pair.
pub struct MemoryBroker {
    shared: Arc<Shared>,
    sent_rx: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryBroker {
    /// Number of dial attempts seen so far, successful or not.
    pub fn dial_count(&self) -> usize {
        self.shared.dials.load(Ordering::SeqCst)
    }

    /// Makes the next `n` dials fail immediately.
    pub fn refuse_next_dials(&self, n: usize) {
        self.shared.refuse.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` dials hang until the caller times out.
    pub fn stall_next_dials(&self, n: usize) {
        self.shared.stall.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` frame writes fail without dropping the link.
    pub fn fail_next_sends(&self, n: usize) {
        self.shared.fail_sends.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` frame writes hang until the caller times out.
    pub fn stall_next_sends(&self, n: usize) {
        self.shared.stall_sends.store(n, Ordering::SeqCst);
    }

    /// Delivers a hub-to-device message over the current link, if any.
    /// Without a link the message is silently dropped, as a real hub would.
    pub async fn deliver(&self, id: impl Into<MessageId>, payload: impl Into<Bytes>) {
        let state = self.shared.state.lock().await;
        if let Some(to_device) = &state.to_device {
            let _ = to_device.send(InboundFrame {
                id: id.into(),
                payload: payload.into(),
            });
        }
    }

    /// Severs the current link. Device-side sends and receives start failing.
    pub async fn drop_link(&self) {
        let mut state = self.shared.state.lock().await;
        state.epoch += 1;
        state.to_device = None;
    }

    /// Next frame the device sent, waiting for one if necessary.
    pub async fn next_sent(&mut self) -> Option<Frame> {
        self.sent_rx.recv().await
    }

    /// Next frame the device sent, if one is already buffered.
    pub fn try_next_sent(&mut self) -> Option<Frame> {
        self.sent_rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_dial_and_exchange_frames() {
        let (transport, mut broker) = MemoryTransport::pair();
        let (mut tx, mut rx) = transport.dial().await.unwrap();
        assert_eq!(broker.dial_count(), 1);

        tx.send(Frame::Telemetry {
            id: None,
            payload: Bytes::from_static(b"{}"),
        })
        .await
        .unwrap();
        assert!(matches!(
            broker.next_sent().await,
            Some(Frame::Telemetry { .. })
        ));

        broker.deliver("m-1", "hello").await;
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.id, "m-1".into());
    }

    #[tokio::test]
    async fn test_refused_dial() {
        let (transport, broker) = MemoryTransport::pair();
        broker.refuse_next_dials(1);

        assert!(transport.dial().await.is_err());
        assert!(transport.dial().await.is_ok());
        assert_eq!(broker.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_dropped_link_fails_sender() {
        let (transport, broker) = MemoryTransport::pair();
        let (mut tx, _rx) = transport.dial().await.unwrap();
        broker.drop_link().await;

        let result = tx
            .send(Frame::Telemetry {
                id: None,
                payload: Bytes::new(),
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_redial_invalidates_old_sender() {
        let (transport, _broker) = MemoryTransport::pair();
        let (mut old_tx, _old_rx) = transport.dial().await.unwrap();
        let (_new_tx, _new_rx) = transport.dial().await.unwrap();

        let result = old_tx
            .send(Frame::Telemetry {
                id: None,
                payload: Bytes::new(),
            })
            .await;
        assert!(result.is_err());
    }
}
