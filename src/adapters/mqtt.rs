use std::sync::Arc;

use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};

use crate::adapters::{EventSender, NormalizedTelemetryEvent};
use crate::config::AdapterConfig;
use crate::db::ConfigDb;
use crate::ingestion::reading_from_raw;
use crate::models::device::DeviceStatus;
use crate::models::telemetry::RawReading;

const RECONNECT_DELAYS_SECS: &[u64] = &[1, 2, 4, 8, 16, 30];

/// Subscribes to the four topic patterns: telemetry publishes are
/// normalized into the ingestion channel, status publishes refresh the
/// device row directly, and the command/alert topics are acknowledged at
/// the transport level for the AMQP publisher and management API to use.
pub async fn run(cfg: &AdapterConfig, client_id: &str, config_db: Arc<ConfigDb>, tx: EventSender) {
    let mut attempt = 0usize;
    loop {
        match run_once(cfg, client_id, &config_db, &tx).await {
            Ok(()) => attempt = 0,
            Err(e) => tracing::error!("mqtt adapter connection lost: {e}"),
        }
        let delay = RECONNECT_DELAYS_SECS[attempt.min(RECONNECT_DELAYS_SECS.len() - 1)];
        attempt += 1;
        tracing::info!("mqtt adapter reconnecting in {delay}s");
        tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
    }
}

async fn run_once(cfg: &AdapterConfig, client_id: &str, config_db: &ConfigDb, tx: &EventSender) -> anyhow::Result<()> {
    let mut opts = MqttOptions::new(client_id, &cfg.mqtt_host, cfg.mqtt_port);
    opts.set_keep_alive(std::time::Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(opts, 256);

    let prefix = &cfg.mqtt_topic_prefix;
    client.subscribe(format!("{prefix}/devices/+/telemetry"), QoS::AtLeastOnce).await?;
    client.subscribe(format!("{prefix}/devices/+/status"), QoS::AtLeastOnce).await?;
    client.subscribe(format!("{prefix}/devices/+/commands"), QoS::AtLeastOnce).await?;
    client.subscribe(format!("{prefix}/alerts/#"), QoS::AtLeastOnce).await?;
    tracing::info!("mqtt adapter subscribed under prefix '{prefix}'");

    loop {
        let event = eventloop.poll().await?;
        let Event::Incoming(Packet::Publish(publish)) = event else { continue };
        let Some(device_id) = device_id_from_topic(prefix, &publish.topic) else { continue };

        if publish.topic.ends_with("/status") {
            handle_status(config_db, &device_id, &publish.payload);
            continue;
        }
        if !publish.topic.ends_with("/telemetry") {
            continue;
        }
        let readings: std::collections::HashMap<String, RawReading> = match serde_json::from_slice(&publish.payload) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("mqtt: dropping malformed telemetry payload on {}: {e}", publish.topic);
                continue;
            }
        };
        let event = NormalizedTelemetryEvent {
            device_id,
            protocol: "mqtt",
            readings: readings.iter().map(|(k, r)| reading_from_raw(k, r)).collect(),
            timestamp: Utc::now(),
            tenant_hint: None,
            ack: None,
        };
        if tx.try_send(event).is_err() {
            tracing::warn!("mqtt adapter: ingestion channel full, dropping event (backpressure)");
        }
    }
}

/// A device-published `{"status": "..."}` refreshes the device row the same
/// way accepted telemetry does. Malformed or unknown statuses are dropped.
fn handle_status(config_db: &ConfigDb, device_id: &str, payload: &[u8]) {
    #[derive(serde::Deserialize)]
    struct StatusPayload {
        status: String,
    }
    let Ok(parsed) = serde_json::from_slice::<StatusPayload>(payload) else {
        tracing::warn!("mqtt: dropping malformed status payload for device {device_id}");
        return;
    };
    let Some(status) = DeviceStatus::parse(&parsed.status) else {
        tracing::warn!("mqtt: dropping unknown status {:?} for device {device_id}", parsed.status);
        return;
    };
    match config_db.get_device_any_tenant(device_id) {
        Ok(Some(device)) => {
            if let Err(e) = config_db.touch_device_status(
                &device.tenant_id,
                device_id,
                status.as_str(),
                &Utc::now().to_rfc3339(),
            ) {
                tracing::warn!("mqtt: status update for device {device_id} failed: {e}");
            }
        }
        Ok(None) => tracing::debug!("mqtt: status for unknown device {device_id} ignored"),
        Err(e) => tracing::warn!("mqtt: device lookup for status update failed: {e}"),
    }
}

fn device_id_from_topic(prefix: &str, topic: &str) -> Option<String> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let mut parts = rest.splitn(3, '/');
    if parts.next()? != "devices" {
        return None;
    }
    Some(parts.next()?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_device_id_from_telemetry_topic() {
        assert_eq!(device_id_from_topic("iiot", "iiot/devices/D1/telemetry"), Some("D1".to_string()));
    }

    #[test]
    fn rejects_unrelated_topic() {
        assert_eq!(device_id_from_topic("iiot", "other/devices/D1/telemetry"), None);
        assert_eq!(device_id_from_topic("iiot", "iiot/alerts/foo"), None);
    }
}
