//! One physical link to the hub.
//!
//! A [`Connection`] owns at most one established link at a time and offers
//! raw frame send and receive over it. It never retries and never changes
//! state on its own; the session manager decides when to dial again.

use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;

use crate::transport::{Frame, FrameReceiver, FrameSender, InboundFrame, Transport};

/// Any failure of the link. The cause travels as context in the message
/// rather than as a distinct variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ConnectionError(String);

impl ConnectionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    pub fn reason(&self) -> &str {
        &self.0
    }
}

pub struct Connection<T: Transport> {
    transport: T,
    connect_timeout: Duration,
    send_timeout: Duration,
    link: Option<(T::Sender, T::Receiver)>,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T, connect_timeout: Duration, send_timeout: Duration) -> Self {
        Self {
            transport,
            connect_timeout,
            send_timeout,
            link: None,
        }
    }

    /// Dials a fresh link, discarding any previous one first. On failure the
    /// connection is left without a link.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        self.link = None;
        let link = timeout(self.connect_timeout, self.transport.dial())
            .await
            .map_err(|_| {
                ConnectionError::new(format!(
                    "connect timed out after {:?}",
                    self.connect_timeout
                ))
            })??;
        self.link = Some(link);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Writes one frame to the link, bounded by the send timeout.
    pub async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        let (tx, _) = self
            .link
            .as_mut()
            .ok_or_else(|| ConnectionError::new("not connected"))?;
        timeout(self.send_timeout, tx.send(frame))
            .await
            .map_err(|_| {
                ConnectionError::new(format!("send timed out after {:?}", self.send_timeout))
            })?
    }

    /// Waits for the next frame from the hub. Cancel safe whenever the
    /// underlying receiver is.
    pub async fn recv(&mut self) -> Result<InboundFrame, ConnectionError> {
        let (_, rx) = self
            .link
            .as_mut()
            .ok_or_else(|| ConnectionError::new("not connected"))?;
        rx.recv().await
    }

    /// Drops the current link, if any. Always succeeds.
    pub fn close(&mut self) {
        self.link = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    fn connection(transport: MemoryTransport) -> Connection<MemoryTransport> {
        Connection::new(
            transport,
            Duration::from_millis(100),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_connect_establishes_link() {
        let (transport, broker) = MemoryTransport::pair();
        let mut conn = connection(transport);

        assert!(!conn.is_connected());
        conn.connect().await.unwrap();
        assert!(conn.is_connected());
        assert_eq!(broker.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_surfaces_refusal() {
        let (transport, broker) = MemoryTransport::pair();
        broker.refuse_next_dials(1);
        let mut conn = connection(transport);

        let err = conn.connect().await.unwrap_err();
        assert_eq!(err.reason(), "connection refused");
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_connect_times_out_on_stalled_dial() {
        let (transport, broker) = MemoryTransport::pair();
        broker.stall_next_dials(1);
        let mut conn = connection(transport);

        let err = conn.connect().await.unwrap_err();
        assert!(err.reason().contains("timed out"));
    }

    #[tokio::test]
    async fn test_send_requires_link() {
        let (transport, _broker) = MemoryTransport::pair();
        let mut conn = connection(transport);

        let result = conn
            .send(Frame::Telemetry {
                id: None,
                payload: Bytes::new(),
            })
            .await;
        assert_eq!(result.unwrap_err().reason(), "not connected");
    }

    #[tokio::test]
    async fn test_send_times_out_on_stalled_write() {
        let (transport, broker) = MemoryTransport::pair();
        let mut conn = connection(transport);
        conn.connect().await.unwrap();
        broker.stall_next_sends(1);

        let result = conn
            .send(Frame::Telemetry {
                id: None,
                payload: Bytes::new(),
            })
            .await;
        assert!(result.unwrap_err().reason().contains("timed out"));
    }

    #[tokio::test]
    async fn test_send_fails_after_link_drop() {
        let (transport, broker) = MemoryTransport::pair();
        let mut conn = connection(transport);
        conn.connect().await.unwrap();
        broker.drop_link().await;

        let result = conn
            .send(Frame::Telemetry {
                id: None,
                payload: Bytes::new(),
            })
            .await;
        assert_eq!(result.unwrap_err().reason(), "link lost");
    }

    #[tokio::test]
    async fn test_recv_delivers_inbound() {
        let (transport, broker) = MemoryTransport::pair();
        let mut conn = connection(transport);
        conn.connect().await.unwrap();

        broker.deliver("m-1", "hello").await;
        let frame = conn.recv().await.unwrap();
        assert_eq!(frame.id, "m-1".into());
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_close_discards_link() {
        let (transport, _broker) = MemoryTransport::pair();
        let mut conn = connection(transport);
        conn.connect().await.unwrap();

        conn.close();
        assert!(!conn.is_connected());
    }
}
