use std::collections::VecDeque;
use thiserror::Error;

use crate::config::QueueConfig;
use crate::message::Message;

/// What the queue does with a new message when it is at capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Refuse the new message and report the overflow to the caller.
    Reject,
    /// Evict the oldest queued message to make room for the new one.
    DropOldest,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Telemetry queue is full (capacity {capacity})")]
pub struct QueueFullError {
    pub capacity: usize,
}

/// Bounded FIFO buffer for telemetry awaiting delivery.
///
/// Messages wait here while the link is down or busy and leave in arrival
/// order. Overflow behavior is chosen by [`OverflowPolicy`]; either way the
/// caller learns about every message the queue refuses or evicts.
#[derive(Debug)]
pub struct OutboundQueue {
    messages: VecDeque<Message>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl OutboundQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            messages: VecDeque::with_capacity(config.capacity),
            capacity: config.capacity,
            policy: config.policy,
        }
    }

    /// Appends a message at the tail.
    ///
    /// At capacity, [`OverflowPolicy::Reject`] refuses the new message and
    /// [`OverflowPolicy::DropOldest`] evicts the head to make room, returning
    /// the evicted message so it can be surfaced rather than silently lost.
    pub fn enqueue(&mut self, message: Message) -> Result<Option<Message>, QueueFullError> {
        if self.messages.len() < self.capacity {
            self.messages.push_back(message);
            return Ok(None);
        }

        match self.policy {
            OverflowPolicy::Reject => Err(QueueFullError {
                capacity: self.capacity,
            }),
            OverflowPolicy::DropOldest => {
                let evicted = self.messages.pop_front();
                self.messages.push_back(message);
                // With capacity zero the push landed in an empty deque, so
                // take the incoming message straight back out as the eviction.
                if self.messages.len() > self.capacity {
                    return Ok(self.messages.pop_front());
                }
                Ok(evicted)
            }
        }
    }

    /// Puts a message back at the head after a failed send, so delivery order
    /// is preserved. May transiently hold one message above capacity.
    pub fn requeue(&mut self, message: Message) {
        self.messages.push_front(message);
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
