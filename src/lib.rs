/*
Device-side client for a message hub. It owns a single connection, keeps the
session alive across link failures with backed-off reconnection, buffers
outbound telemetry in a bounded queue and dispatches hub-to-device messages
to an application handler exactly once per delivery window.

SessionManager spawns the background task driving all of this and hands back
a cloneable SessionHandle. The wire itself is abstracted behind the Transport
trait; an in-memory implementation is provided for tests and simulation.
RegistryClient provisions device identities ahead of a session, and
TelemetryService samples a TelemetrySource on a fixed cadence.
*/

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod message;
pub mod queue;
pub mod registry;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use config::{BackoffConfig, QueueConfig, SessionConfig};
pub use connection::{Connection, ConnectionError};
pub use dispatch::{HandlerError, MessageHandler};
pub use message::{DeliveryState, Disposition, InboundMessage, Message, MessageId};
pub use queue::{OutboundQueue, OverflowPolicy, QueueFullError};
pub use registry::{DeviceIdentity, RegistryClient, RegistryError};
pub use session::{
    ConnectError, EnqueueError, SessionEvent, SessionHandle, SessionManager, SessionState,
};
pub use telemetry::{SimulatedSensor, TelemetryReading, TelemetryService, TelemetrySource};
pub use transport::{Frame, FrameReceiver, FrameSender, InboundFrame, Transport};
pub use types::{ConnectionString, DeviceId, ParseConnectionStringError, SharedAccessKey};
