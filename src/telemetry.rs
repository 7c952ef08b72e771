//! Periodic telemetry sampling.
//!
//! A [`TelemetryService`] samples a [`TelemetrySource`] on a fixed cadence
//! and queues the readings on a session. It keeps sampling while the link is
//! down; the session buffers according to its queue policy.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::message::Message;
use crate::session::{EnqueueError, SessionHandle};
use crate::types::DeviceId;

/// Anything that can produce the next telemetry message.
pub trait TelemetrySource: Send + 'static {
    fn sample(&mut self) -> Message;
}

impl<F> TelemetrySource for F
where
    F: FnMut() -> Message + Send + 'static,
{
    fn sample(&mut self) -> Message {
        self()
    }
}

/// One temperature reading as sent to the hub.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReading {
    pub device_id: DeviceId,
    pub temp: f64,
}

/// Telemetry source producing random temperatures, for simulated devices.
pub struct SimulatedSensor {
    device_id: DeviceId,
    base: f64,
    spread: f64,
}

impl SimulatedSensor {
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            base: 70.0,
            spread: 20.0,
        }
    }

    pub fn with_range(mut self, base: f64, spread: f64) -> Self {
        self.base = base;
        self.spread = spread;
        self
    }

    pub fn reading(&self) -> TelemetryReading {
        TelemetryReading {
            device_id: self.device_id.clone(),
            temp: self.base + rand::random::<f64>() * self.spread,
        }
    }
}

impl TelemetrySource for SimulatedSensor {
    fn sample(&mut self) -> Message {
        let reading = self.reading();
        // Encoding a plain struct to JSON cannot fail
        let payload = serde_json::to_vec(&reading).unwrap_or_default();
        Message::new(payload)
    }
}

/// Service that samples telemetry on an interval and queues it for delivery.
pub struct TelemetryService {
    shutdown_tx: broadcast::Sender<()>,
}

impl TelemetryService {
    /// Starts sampling. The first reading is taken immediately, then one per
    /// `interval`. Sampling stops when the service is dropped or the session
    /// closes.
    pub fn start(
        source: impl TelemetrySource,
        interval: Duration,
        session: SessionHandle,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(Self::background_task(
            source,
            interval,
            session,
            shutdown_rx,
        ));
        Self { shutdown_tx }
    }

    async fn background_task(
        mut source: impl TelemetrySource,
        interval: Duration,
        session: SessionHandle,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut next_sample_time = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,

                _ = tokio::time::sleep_until(next_sample_time) => {
                    match session.enqueue(source.sample()).await {
                        Ok(()) => {}
                        Err(EnqueueError::Full(e)) => {
                            warn!(error = %e, "failed to queue telemetry");
                        }
                        Err(EnqueueError::Closed) => {
                            debug!("session closed, stopping telemetry");
                            break;
                        }
                    }
                    next_sample_time = tokio::time::Instant::now() + interval;
                }
            }
        }
    }
}

impl Drop for TelemetryService {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
