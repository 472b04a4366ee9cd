use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use coap_lite::{CoapOption, CoapRequest, Packet, RequestType as Method, ResponseType};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;

use crate::adapters::{EventSender, IngestOutcome, NormalizedTelemetryEvent};
use crate::db::ConfigDb;
use crate::ingestion::reading_from_raw;
use crate::models::telemetry::RawReading;

const WELL_KNOWN_CORE: &str = "</telemetry>;rt=\"iiot.telemetry\";ct=50,</devices>;rt=\"iiot.devices\";ct=50";

/// Binds UDP/5683 and serves the three resources: `/telemetry` (POST, JSON
/// or CBOR), `/devices` (GET with optional `id`/`tenant_id` query),
/// `/.well-known/core` (RFC 6690 discovery). Each datagram is handled
/// independently; there is no connection state to keep across requests,
/// unlike MQTT/AMQP.
pub async fn run(bind: &str, config_db: Arc<ConfigDb>, tx: EventSender) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(bind).await?;
    tracing::info!("coap adapter listening on {bind}");
    let mut buf = [0u8; 2048];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("coap adapter recv error: {e}");
                continue;
            }
        };
        let packet = match Packet::from_bytes(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("coap adapter: malformed packet from {src}: {e}");
                continue;
            }
        };
        let mut request: CoapRequest<std::net::SocketAddr> = CoapRequest::from_packet(packet, src);
        handle(&mut request, &config_db, &tx).await;
        if let Some(response) = request.response.take() {
            if let Ok(bytes) = response.message.to_bytes() {
                let _ = socket.send_to(&bytes, src).await;
            }
        }
    }
}

async fn handle(request: &mut CoapRequest<std::net::SocketAddr>, config_db: &ConfigDb, tx: &EventSender) {
    let path = request.get_path();
    let method = request.get_method().clone();
    let (status, payload) = match (path.as_str(), method) {
        (".well-known/core", Method::Get) => (ResponseType::Content, Some(WELL_KNOWN_CORE.as_bytes().to_vec())),
        ("devices", Method::Get) => handle_devices(request, config_db),
        ("telemetry", Method::Post) => (handle_telemetry(request, tx).await, None),
        _ => (ResponseType::NotFound, None),
    };
    if let Some(response) = request.response.as_mut() {
        response.set_status(status);
        if let Some(payload) = payload {
            response.message.payload = payload;
        }
    }
}

fn query_params(request: &CoapRequest<std::net::SocketAddr>) -> HashMap<String, String> {
    request
        .message
        .get_option(CoapOption::UriQuery)
        .map(|opts| {
            opts.iter()
                .filter_map(|raw| String::from_utf8(raw.clone()).ok())
                .filter_map(|q| q.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Device discovery for constrained clients: a single device by `id` or a
/// tenant's device list by `tenant_id`.
fn handle_devices(
    request: &CoapRequest<std::net::SocketAddr>,
    config_db: &ConfigDb,
) -> (ResponseType, Option<Vec<u8>>) {
    let params = query_params(request);

    let devices = if let Some(id) = params.get("id") {
        match config_db.get_device_any_tenant(id) {
            Ok(Some(d)) => vec![d],
            Ok(None) => return (ResponseType::NotFound, None),
            Err(e) => {
                tracing::warn!("coap /devices lookup failed: {e}");
                return (ResponseType::InternalServerError, None);
            }
        }
    } else if let Some(tenant_id) = params.get("tenant_id") {
        match config_db.list_devices(tenant_id) {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("coap /devices list failed: {e}");
                return (ResponseType::InternalServerError, None);
            }
        }
    } else {
        return (ResponseType::BadRequest, None);
    };

    let listing: Vec<serde_json::Value> = devices
        .iter()
        .map(|d| {
            serde_json::json!({
                "id": d.id,
                "name": d.name,
                "protocol": d.protocol,
                "status": d.status,
            })
        })
        .collect();
    match serde_json::to_vec(&listing) {
        Ok(body) => (ResponseType::Content, Some(body)),
        Err(_) => (ResponseType::InternalServerError, None),
    }
}

async fn handle_telemetry(request: &mut CoapRequest<std::net::SocketAddr>, tx: &EventSender) -> ResponseType {
    #[derive(serde::Deserialize)]
    struct TelemetryPayload {
        device_id: String,
        #[serde(default)]
        tenant_id: Option<String>,
        readings: HashMap<String, RawReading>,
    }

    let payload = &request.message.payload;
    let parsed: Option<TelemetryPayload> = serde_json::from_slice(payload)
        .ok()
        .or_else(|| ciborium::de::from_reader(payload.as_slice()).ok());

    let Some(payload) = parsed else {
        return ResponseType::BadRequest;
    };

    let (ack_tx, ack_rx) = oneshot::channel();
    let event = NormalizedTelemetryEvent {
        device_id: payload.device_id,
        protocol: "coap",
        readings: payload.readings.iter().map(|(k, r)| reading_from_raw(k, r)).collect(),
        timestamp: Utc::now(),
        tenant_hint: payload.tenant_id,
        ack: Some(ack_tx),
    };
    if tx.try_send(event).is_err() {
        tracing::warn!("coap adapter: ingestion channel full, rejecting with 5.03");
        return ResponseType::ServiceUnavailable;
    }

    // A CoAP request must resolve to a concrete result code, so we wait
    // (briefly) for the ingestion pipeline's outcome rather than firing
    // and forgetting the way MQTT/OPC UA do.
    match tokio::time::timeout(std::time::Duration::from_secs(5), ack_rx).await {
        Ok(Ok(IngestOutcome::Admitted)) => ResponseType::Changed,
        Ok(Ok(IngestOutcome::UnknownTenant)) => ResponseType::Forbidden,
        Ok(Ok(IngestOutcome::QuotaExceeded)) => ResponseType::BadRequest,
        Ok(Ok(IngestOutcome::Failed)) | Ok(Err(_)) => ResponseType::InternalServerError,
        Err(_) => ResponseType::InternalServerError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_core_lists_both_resources() {
        assert!(WELL_KNOWN_CORE.contains("/telemetry"));
        assert!(WELL_KNOWN_CORE.contains("/devices"));
    }
}
