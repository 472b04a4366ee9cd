pub mod amqp;
pub mod coap;
pub mod mqtt;
pub mod opcua;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::models::telemetry::Reading;

/// Result of ingesting one normalized event, reported back to adapters that
/// need a protocol-native response code (CoAP's 2.01/4.03/4.00/5.00, AMQP's
/// ack/nack) rather than firing and forgetting like MQTT/OPC UA do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Admitted,
    UnknownTenant,
    QuotaExceeded,
    Failed,
}

pub type AckSender = oneshot::Sender<IngestOutcome>;

/// Uniform event every protocol adapter normalizes its wire payload into
/// before handing off to the ingestion pipeline. `tenant_hint`
/// carries a tenant id when the wire payload named one explicitly (CoAP);
/// adapters that only ever see a bare device id leave it `None` and let
/// ingestion resolve tenant from the device binding cache. `ack` is `Some`
/// only for adapters that block on the outcome to pick a response code.
#[derive(Debug)]
pub struct NormalizedTelemetryEvent {
    pub device_id: String,
    pub protocol: &'static str,
    pub readings: Vec<Reading>,
    pub timestamp: DateTime<Utc>,
    pub tenant_hint: Option<String>,
    pub ack: Option<AckSender>,
}

/// Bounded channel every adapter feeds; events never wait unbounded.
/// Capacity is generous enough to absorb a burst between ingestion ticks
/// without adapters blocking their own I/O loop for long.
pub const CHANNEL_CAPACITY: usize = 4096;

pub type EventSender = mpsc::Sender<NormalizedTelemetryEvent>;
pub type EventReceiver = mpsc::Receiver<NormalizedTelemetryEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::channel(CHANNEL_CAPACITY)
}
