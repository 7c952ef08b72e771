//! Device session lifecycle. Owns the connection, drives reconnection with
//! backoff, drains the outbound telemetry queue and dispatches inbound
//! messages to the registered handler.

mod backoff;

pub(crate) use backoff::Backoff;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, Notify, broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionError};
use crate::dispatch::{Dispatch, InboundDispatcher, MessageHandler, PendingAck};
use crate::message::{Disposition, Message, MessageId};
use crate::queue::{OutboundQueue, QueueFullError};
use crate::transport::{Frame, InboundFrame, Transport};

/// Externally observable lifecycle of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(state)
    }
}

/// Notifications emitted by a running session.
///
/// Loss is always reported: a telemetry message that leaves the session
/// without being delivered appears as [`SessionEvent::TelemetryDropped`].
#[derive(Debug)]
pub enum SessionEvent {
    /// A link is established and telemetry is flowing.
    Connected,
    /// The link was lost; a redial is about to start.
    Reconnecting { attempt: u32, error: ConnectionError },
    /// Reconnection attempts are exhausted. A new `connect` may be issued.
    Disconnected { reason: String },
    /// The session shut down. Terminal.
    Closed,
    /// A queued message was discarded without being delivered.
    TelemetryDropped(Message),
    /// An acknowledgement could not be delivered within its retry budget.
    AckFailed {
        id: MessageId,
        disposition: Disposition,
        error: ConnectionError,
    },
    /// The message handler returned an error; the message was abandoned.
    HandlerFailed { id: MessageId, error: String },
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("session is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Full(#[from] QueueFullError),

    #[error("session is closed")]
    Closed,
}

enum Command {
    Connect(oneshot::Sender<Result<(), ConnectError>>),
}

enum Dial {
    Connected,
    Failed(ConnectionError),
    Shutdown,
}

enum Served {
    Shutdown,
    LinkLost(ConnectionError),
}

enum Recon {
    Connected,
    GaveUp,
    Shutdown,
}

enum Step {
    Done,
    LinkLost(ConnectionError),
    Shutdown,
}

enum Action {
    Shutdown,
    Noop,
    Inbound(Result<InboundFrame, ConnectionError>),
    Drain,
    AckDue,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self {
            Self::Shutdown => "shutdown",
            Self::Noop => "noop",
            Self::Inbound(_) => "inbound",
            Self::Drain => "drain",
            Self::AckDue => "ack-due",
        };
        f.write_str(action)
    }
}

/// Cloneable handle to a running session.
///
/// All handles refer to the same session; dropping the last one shuts the
/// session down, as does [`disconnect`](SessionHandle::disconnect).
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::UnboundedSender<Command>,
    shutdown_tx: broadcast::Sender<()>,
    queue: Arc<Mutex<OutboundQueue>>,
    drain_notify: Arc<Notify>,
    state_rx: watch::Receiver<SessionState>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    /// Asks the session to establish a link and waits for the outcome.
    ///
    /// Idempotent: while a connect or reconnect is already in progress, or a
    /// link is already up, this returns `Ok` without producing another dial.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Connect(reply_tx))
            .map_err(|_| ConnectError::Closed)?;
        reply_rx.await.map_err(|_| ConnectError::Closed)?
    }

    /// Shuts the session down and waits until it reaches [`SessionState::Closed`].
    ///
    /// Idempotent and terminal. Telemetry still queued at this point is
    /// surfaced as [`SessionEvent::TelemetryDropped`] before the session
    /// reports [`SessionEvent::Closed`].
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(());
        let _ = self
            .state_rx
            .clone()
            .wait_for(|state| *state == SessionState::Closed)
            .await;
    }

    /// Queues a telemetry message for delivery.
    ///
    /// Never blocks on the network. With [`OverflowPolicy::Reject`] a full
    /// queue refuses the message; with [`OverflowPolicy::DropOldest`] the
    /// oldest queued message is evicted and surfaced as an event.
    ///
    /// [`OverflowPolicy::Reject`]: crate::queue::OverflowPolicy::Reject
    /// [`OverflowPolicy::DropOldest`]: crate::queue::OverflowPolicy::DropOldest
    pub async fn enqueue(&self, message: Message) -> Result<(), EnqueueError> {
        let mut queue = self.queue.lock().await;
        if *self.state_rx.borrow() == SessionState::Closed {
            return Err(EnqueueError::Closed);
        }
        if let Some(evicted) = queue.enqueue(message)? {
            debug!(message_id = ?evicted.id(), "evicting oldest queued message");
            let _ = self.events_tx.send(SessionEvent::TelemetryDropped(evicted));
        }
        drop(queue);
        self.drain_notify.notify_one();
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch channel following every state transition.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }
}

/// Background task driving one device session over a [`Transport`].
pub struct SessionManager<T: Transport> {
    conn: Connection<T>,
    config: SessionConfig,
    queue: Arc<Mutex<OutboundQueue>>,
    dispatcher: InboundDispatcher,
    backoff: Backoff,
    command_rx: mpsc::UnboundedReceiver<Command>,
    shutdown_rx: broadcast::Receiver<()>,
    drain_notify: Arc<Notify>,
    state_tx: watch::Sender<SessionState>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl<T: Transport> SessionManager<T> {
    /// Spawns a session over `transport` and returns a handle to it together
    /// with the stream of session events. The session starts disconnected;
    /// nothing touches the network until [`SessionHandle::connect`].
    pub fn start(
        transport: T,
        handler: impl MessageHandler,
        config: SessionConfig,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let queue = Arc::new(Mutex::new(OutboundQueue::new(config.queue)));
        let drain_notify = Arc::new(Notify::new());

        let manager = SessionManager {
            conn: Connection::new(transport, config.connect_timeout, config.send_timeout),
            dispatcher: InboundDispatcher::new(handler, &config),
            backoff: Backoff::new(config.backoff),
            config,
            queue: queue.clone(),
            command_rx,
            shutdown_rx,
            drain_notify: drain_notify.clone(),
            state_tx,
            events_tx: events_tx.clone(),
        };
        tokio::spawn(manager.run());

        (
            SessionHandle {
                command_tx,
                shutdown_tx,
                queue,
                drain_notify,
                state_rx,
                events_tx,
            },
            events_rx,
        )
    }

    #[instrument(name = "session", skip_all)]
    async fn run(mut self) {
        'session: loop {
            // Idle until someone asks for a link
            let reply = tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => break 'session,

                cmd = self.command_rx.recv() => match cmd {
                    Some(Command::Connect(reply)) => reply,
                    None => break 'session,
                },
            };

            self.set_state(SessionState::Connecting);
            match self.dial_once().await {
                Dial::Connected => {
                    let _ = reply.send(Ok(()));
                }
                Dial::Failed(e) => {
                    // The initial connect fails fast; retrying is the
                    // caller's decision
                    self.set_state(SessionState::Disconnected);
                    let _ = reply.send(Err(e.into()));
                    continue 'session;
                }
                Dial::Shutdown => {
                    let _ = reply.send(Err(ConnectError::Closed));
                    break 'session;
                }
            }

            'link: loop {
                match self.serve().await {
                    Served::Shutdown => break 'session,
                    Served::LinkLost(cause) => {
                        warn!(error = %cause, "link lost");
                        match self.reconnect(cause).await {
                            Recon::Connected => continue 'link,
                            Recon::Shutdown => break 'session,
                            Recon::GaveUp => {
                                self.set_state(SessionState::Disconnected);
                                self.emit(SessionEvent::Disconnected {
                                    reason: "reconnection attempts exhausted".to_string(),
                                });
                                continue 'session;
                            }
                        }
                    }
                }
            }
        }

        self.teardown().await;
    }

    /// Dials once while still answering shutdown and duplicate connect
    /// requests. Servicing a request does not restart the dial.
    async fn dial_once(&mut self) -> Dial {
        let Self {
            conn,
            command_rx,
            shutdown_rx,
            ..
        } = self;
        let dial = conn.connect();
        tokio::pin!(dial);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => return Dial::Shutdown,

                cmd = command_rx.recv() => match cmd {
                    Some(Command::Connect(reply)) => {
                        // A dial is already in flight
                        let _ = reply.send(Ok(()));
                    }
                    None => return Dial::Shutdown,
                },

                result = &mut dial => {
                    return match result {
                        Ok(()) => Dial::Connected,
                        Err(e) => Dial::Failed(e),
                    };
                }
            }
        }
    }

    /// Serves an established link until it is lost or the session shuts down.
    async fn serve(&mut self) -> Served {
        self.backoff.reset();
        self.set_state(SessionState::Connected);
        self.emit(SessionEvent::Connected);
        // Pick up whatever queued while the link was down
        self.drain_notify.notify_one();

        loop {
            let next_ack = self.dispatcher.next_due();

            let action: Action = tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => Action::Shutdown,

                cmd = self.command_rx.recv() => match cmd {
                    Some(Command::Connect(reply)) => {
                        // Already connected
                        let _ = reply.send(Ok(()));
                        Action::Noop
                    }
                    None => Action::Shutdown,
                },

                frame = self.conn.recv() => Action::Inbound(frame),

                _ = self.drain_notify.notified() => Action::Drain,

                _ = tokio::time::sleep_until(next_ack.unwrap_or_else(tokio::time::Instant::now)),
                    if next_ack.is_some() => Action::AckDue,
            };

            trace!("performing action: {action}");

            let step = match action {
                Action::Shutdown => return Served::Shutdown,

                Action::Noop => Step::Done,

                Action::Inbound(Ok(frame)) => match self.dispatcher.dispatch(frame) {
                    Dispatch::Duplicate => Step::Done,
                    Dispatch::Ack(ack) => self.send_ack(ack).await,
                    Dispatch::HandlerFailed { ack, error } => {
                        self.emit(SessionEvent::HandlerFailed {
                            id: ack.id().clone(),
                            error,
                        });
                        self.send_ack(ack).await
                    }
                },

                Action::Inbound(Err(e)) => Step::LinkLost(e),

                Action::Drain => self.drain_one().await,

                Action::AckDue => match self.dispatcher.take_due(tokio::time::Instant::now()) {
                    Some(ack) => self.send_ack(ack).await,
                    None => Step::Done,
                },
            };

            match step {
                Step::Done => {}
                Step::LinkLost(e) => return Served::LinkLost(e),
                Step::Shutdown => return Served::Shutdown,
            }
        }
    }

    /// Sends one frame, aborting early on shutdown. Returns whether the frame
    /// was handed to the link.
    async fn checked_send(
        conn: &mut Connection<T>,
        shutdown_rx: &mut broadcast::Receiver<()>,
        frame: Frame,
    ) -> Result<bool, ConnectionError> {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => Ok(false),

            result = conn.send(frame) => result.map(|_| true),
        }
    }

    /// Sends the message at the head of the queue, if any. A failed send puts
    /// the message back at the head so delivery order is preserved.
    async fn drain_one(&mut self) -> Step {
        let message = { self.queue.lock().await.pop() };
        let Some(message) = message else {
            return Step::Done;
        };

        let frame = Frame::from(&message);
        match Self::checked_send(&mut self.conn, &mut self.shutdown_rx, frame).await {
            Ok(true) => {
                debug!(message_id = ?message.id(), "telemetry sent");
                // Keep draining while messages remain
                if !self.queue.lock().await.is_empty() {
                    self.drain_notify.notify_one();
                }
                Step::Done
            }
            Ok(false) => {
                self.queue.lock().await.requeue(message);
                Step::Shutdown
            }
            Err(e) => {
                warn!(error = %e, "telemetry send failed, requeueing at head");
                self.queue.lock().await.requeue(message);
                Step::LinkLost(e)
            }
        }
    }

    /// Sends one acknowledgement, deferring it for a later retry on failure.
    async fn send_ack(&mut self, ack: PendingAck) -> Step {
        let frame = Frame::Ack {
            id: ack.id().clone(),
            disposition: ack.disposition(),
        };
        match Self::checked_send(&mut self.conn, &mut self.shutdown_rx, frame).await {
            Ok(true) => {
                debug!(
                    message_id = %ack.id(),
                    disposition = %ack.disposition(),
                    "acknowledgement sent"
                );
                Step::Done
            }
            Ok(false) => Step::Shutdown,
            Err(e) => {
                if let Some(fatal) = self.dispatcher.defer(ack) {
                    self.emit(SessionEvent::AckFailed {
                        id: fatal.id().clone(),
                        disposition: fatal.disposition(),
                        error: e.clone(),
                    });
                }
                Step::LinkLost(e)
            }
        }
    }

    /// Redials with exponential backoff until connected, shut down, or out
    /// of attempts. The first redial happens immediately; with an attempt
    /// ceiling of zero no redial happens at all.
    async fn reconnect(&mut self, cause: ConnectionError) -> Recon {
        self.conn.close();
        self.set_state(SessionState::Reconnecting);

        let mut last_error = cause;
        let mut attempt = 0u32;
        loop {
            if !self.attempts_left(attempt) {
                warn!(attempts = attempt, "reconnection attempts exhausted");
                return Recon::GaveUp;
            }
            attempt += 1;
            self.emit(SessionEvent::Reconnecting {
                attempt,
                error: last_error.clone(),
            });
            info!(attempt, "reconnecting");

            match self.dial_once().await {
                Dial::Connected => return Recon::Connected,
                Dial::Shutdown => return Recon::Shutdown,
                Dial::Failed(e) => {
                    last_error = e;
                    // No wait after the final attempt
                    if self.attempts_left(attempt) {
                        let delay = self.backoff.next_delay();
                        debug!(delay = ?delay, "waiting before next attempt");
                        if !self.backoff_wait(delay).await {
                            return Recon::Shutdown;
                        }
                    }
                }
            }
        }
    }

    fn attempts_left(&self, attempt: u32) -> bool {
        self.config
            .max_reconnect_attempts
            .is_none_or(|max| attempt < max)
    }

    /// Sleeps between reconnection attempts while still answering shutdown
    /// and connect requests. Returns false if the session should shut down.
    async fn backoff_wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => return false,

                cmd = self.command_rx.recv() => match cmd {
                    Some(Command::Connect(reply)) => {
                        // A reconnect is already in progress
                        let _ = reply.send(Ok(()));
                    }
                    None => return false,
                },

                _ = &mut sleep => return true,
            }
        }
    }

    /// Publishes the terminal state and surfaces whatever never went out.
    async fn teardown(mut self) {
        self.conn.close();
        self.set_state(SessionState::Closed);

        {
            let mut queue = self.queue.lock().await;
            while let Some(message) = queue.pop() {
                self.emit(SessionEvent::TelemetryDropped(message));
            }
        }

        // Fail any connect requests that raced the shutdown
        self.command_rx.close();
        while let Ok(Command::Connect(reply)) = self.command_rx.try_recv() {
            let _ = reply.send(Err(ConnectError::Closed));
        }

        self.emit(SessionEvent::Closed);
        info!("session closed");
    }

    fn set_state(&self, state: SessionState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            info!(from = %prev, to = %state, "state changed");
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }
}
