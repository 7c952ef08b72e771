//! Delivery of hub-to-device messages to the registered handler.
//!
//! The dispatcher suppresses redeliveries within a bounded window of recent
//! message ids, so the handler observes each message at most once, and keeps
//! a ledger of acknowledgements that still need to reach the hub.

use std::collections::{HashSet, VecDeque};

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{BackoffConfig, SessionConfig};
use crate::message::{Disposition, InboundMessage, MessageId};
use crate::session::Backoff;
use crate::transport::InboundFrame;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Application callback for hub-to-device messages.
///
/// The returned [`Disposition`] is relayed to the hub as the settlement of
/// the message. An error abandons the message, leaving the hub free to
/// redeliver it later.
pub trait MessageHandler: Send + 'static {
    fn handle(&mut self, message: &InboundMessage) -> Result<Disposition, HandlerError>;
}

impl<F> MessageHandler for F
where
    F: FnMut(&InboundMessage) -> Result<Disposition, HandlerError> + Send + 'static,
{
    fn handle(&mut self, message: &InboundMessage) -> Result<Disposition, HandlerError> {
        self(message)
    }
}

/// An acknowledgement that has not reached the hub yet.
#[derive(Debug)]
pub(crate) struct PendingAck {
    message: InboundMessage,
    disposition: Disposition,
    attempts: u32,
    next_attempt_at: Instant,
}

impl PendingAck {
    fn new(message: InboundMessage, disposition: Disposition) -> Self {
        Self {
            message,
            disposition,
            attempts: 0,
            next_attempt_at: Instant::now(),
        }
    }

    pub(crate) fn id(&self) -> &MessageId {
        self.message.id()
    }

    pub(crate) fn disposition(&self) -> Disposition {
        self.disposition
    }
}

/// What handling one inbound frame produced.
pub(crate) enum Dispatch {
    /// The handler settled the message; send this acknowledgement.
    Ack(PendingAck),
    /// The handler failed; the message was abandoned on its behalf.
    HandlerFailed { ack: PendingAck, error: String },
    /// Redelivery of a recently seen message, dropped without handling.
    Duplicate,
}

pub(crate) struct InboundDispatcher {
    handler: Box<dyn MessageHandler>,
    seen: HashSet<MessageId>,
    seen_order: VecDeque<MessageId>,
    window: usize,
    backoff: BackoffConfig,
    max_attempts: u32,
    pending: VecDeque<PendingAck>,
}

impl InboundDispatcher {
    pub(crate) fn new(handler: impl MessageHandler, config: &SessionConfig) -> Self {
        Self {
            handler: Box::new(handler),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            window: config.dedup_window,
            backoff: config.backoff,
            max_attempts: config.ack_max_attempts,
            pending: VecDeque::new(),
        }
    }

    /// Runs the handler for one inbound frame, unless its id was seen within
    /// the deduplication window.
    pub(crate) fn dispatch(&mut self, frame: InboundFrame) -> Dispatch {
        if self.seen.contains(&frame.id) {
            debug!(message_id = %frame.id, "suppressing duplicate delivery");
            return Dispatch::Duplicate;
        }
        self.remember(frame.id.clone());

        let mut message = InboundMessage::new(frame.id, frame.payload);
        match self.handler.handle(&message) {
            Ok(disposition) => {
                message.settle(disposition);
                debug!(message_id = %message.id(), %disposition, "message handled");
                Dispatch::Ack(PendingAck::new(message, disposition))
            }
            Err(error) => {
                message.settle(Disposition::Abandon);
                warn!(message_id = %message.id(), error = %error, "message handler failed");
                Dispatch::HandlerFailed {
                    ack: PendingAck::new(message, Disposition::Abandon),
                    error: error.to_string(),
                }
            }
        }
    }

    fn remember(&mut self, id: MessageId) {
        if self.window == 0 {
            return;
        }
        while self.seen_order.len() >= self.window {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.clone());
        self.seen_order.push_back(id);
    }

    /// Records a failed send of an acknowledgement and schedules the retry.
    /// Returns the acknowledgement back once its retry budget is spent, at
    /// which point it will not be tried again.
    pub(crate) fn defer(&mut self, mut ack: PendingAck) -> Option<PendingAck> {
        ack.attempts += 1;
        if ack.attempts >= self.max_attempts {
            warn!(
                message_id = %ack.id(),
                attempts = ack.attempts,
                "giving up on acknowledgement"
            );
            return Some(ack);
        }
        ack.next_attempt_at =
            Instant::now() + Backoff::delay_for_attempt(&self.backoff, ack.attempts);
        self.pending.push_back(ack);
        None
    }

    /// Earliest instant at which a deferred acknowledgement comes due.
    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.pending.iter().map(|ack| ack.next_attempt_at).min()
    }

    /// Removes and returns a deferred acknowledgement that is due at `now`.
    pub(crate) fn take_due(&mut self, now: Instant) -> Option<PendingAck> {
        self.pending
            .iter()
            .position(|ack| ack.next_attempt_at <= now)
            .and_then(|index| self.pending.remove(index))
    }
}
