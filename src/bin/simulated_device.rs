//! Simulated device wired to an in-process loopback hub.
//!
//! Exercises the full client stack end to end without a real hub: telemetry
//! is sampled on an interval and pushed over a memory transport while the
//! loopback hub logs every frame it receives and periodically sends a
//! greeting back to the device.

use std::num::ParseIntError;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use hublink::transport::{MemoryBroker, MemoryTransport};
use hublink::{
    ConnectionString, DeviceId, Disposition, Frame, HandlerError, InboundMessage, RegistryClient,
    SessionConfig, SessionEvent, SessionManager, SimulatedSensor, TelemetryService,
};

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
struct Cli {
    /// Device connection string, HostName=..;DeviceId=..;SharedAccessKey=..
    #[arg(
        env = "HUBLINK_CONNECTION_STRING",
        long = "connection-string",
        value_name = "str"
    )]
    connection_string: Option<ConnectionString>,

    /// Telemetry sampling interval in milliseconds
    #[arg(
        env = "HUBLINK_TELEMETRY_INTERVAL_MS",
        long = "telemetry-interval-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "1000"
    )]
    telemetry_interval: Duration,

    /// Registry endpoint to provision a device identity against
    #[arg(
        env = "HUBLINK_REGISTRY_ENDPOINT",
        long = "registry-endpoint",
        value_name = "uri",
        requires = "registry_api_key"
    )]
    registry_endpoint: Option<String>,

    /// API key for authentication with the registry
    #[arg(
        env = "HUBLINK_REGISTRY_API_KEY",
        long = "registry-api-key",
        value_name = "key",
        requires = "registry_endpoint"
    )]
    registry_api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or(EnvFilter::default().add_directive("info".parse()?)),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();

    let cli = Cli::parse();
    debug!("{:#?}", cli);

    let device_id = resolve_device_id(&cli).await?;
    info!(device_id = %device_id, "starting simulated device");

    let (transport, broker) = MemoryTransport::pair();
    tokio::spawn(run_loopback_hub(broker));

    let handler = |message: &InboundMessage| -> Result<Disposition, HandlerError> {
        info!(
            message_id = %message.id(),
            body = %String::from_utf8_lossy(message.payload()),
            "received hub message"
        );
        Ok(Disposition::Complete)
    };
    let (session, mut events) = SessionManager::start(transport, handler, SessionConfig::default());

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Connected => info!("session connected"),
                SessionEvent::Reconnecting { attempt, error } => {
                    warn!(attempt, error = %error, "session reconnecting")
                }
                SessionEvent::Disconnected { reason } => {
                    warn!(reason = %reason, "session disconnected")
                }
                SessionEvent::Closed => {
                    info!("session closed");
                    break;
                }
                SessionEvent::TelemetryDropped(message) => {
                    warn!(
                        message_id = ?message.id(),
                        age = ?message.age(),
                        "telemetry dropped"
                    )
                }
                SessionEvent::AckFailed {
                    id,
                    disposition,
                    error,
                } => warn!(message_id = %id, %disposition, error = %error, "acknowledgement lost"),
                SessionEvent::HandlerFailed { id, error } => {
                    warn!(message_id = %id, error = %error, "message handler failed")
                }
            }
        }
    });

    session.connect().await?;
    info!("client connected");

    let _telemetry = TelemetryService::start(
        SimulatedSensor::new(device_id),
        cli.telemetry_interval,
        session.clone(),
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    session.disconnect().await;

    Ok(())
}

/// Takes the device id from the connection string if one was given, else
/// provisions one against the registry, else falls back to a fixed id.
async fn resolve_device_id(cli: &Cli) -> Result<DeviceId> {
    if let Some(connection_string) = &cli.connection_string {
        return Ok(connection_string.device_id.clone());
    }
    if let (Some(endpoint), Some(api_key)) = (&cli.registry_endpoint, &cli.registry_api_key) {
        let registry = RegistryClient::new(endpoint.clone(), api_key.clone());
        let identity = registry.create_or_fetch("simulated-device").await?;
        info!(device_id = %identity.device_id, "device provisioned");
        return Ok(identity.device_id);
    }
    Ok("simulated-device".into())
}

/// Stands in for the hub: logs every frame the device sends and greets the
/// device every few seconds.
async fn run_loopback_hub(mut broker: MemoryBroker) {
    let mut greetings = 0u64;
    let mut next_greeting = tokio::time::Instant::now() + Duration::from_secs(5);

    loop {
        tokio::select! {
            frame = broker.next_sent() => {
                match frame {
                    Some(Frame::Telemetry { payload, .. }) => {
                        info!(body = %String::from_utf8_lossy(&payload), "hub received telemetry");
                    }
                    Some(Frame::Ack { id, disposition }) => {
                        info!(message_id = %id, %disposition, "hub received ack");
                    }
                    None => break,
                }
            }

            _ = tokio::time::sleep_until(next_greeting) => {
                greetings += 1;
                broker
                    .deliver(format!("c2d-{greetings}"), format!("greetings #{greetings}"))
                    .await;
                next_greeting = tokio::time::Instant::now() + Duration::from_secs(5);
            }
        }
    }
}
