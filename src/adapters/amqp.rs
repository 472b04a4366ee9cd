use chrono::Utc;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};

use crate::adapters::{EventSender, NormalizedTelemetryEvent};
use crate::config::AdapterConfig;
use crate::ingestion::reading_from_raw;
use crate::models::telemetry::RawReading;

const RECONNECT_DELAYS_SECS: &[u64] = &[1, 2, 4, 8, 16, 30];

/// Consumes `telemetry.*` off the durable `telemetry` queue bound to the
/// `iiot` topic exchange. Prefetch 1 with manual ack: a
/// handler failure nacks with requeue rather than dropping the message, the
/// opposite failure mode from MQTT's drop-on-malformed-payload policy,
/// because AMQP delivery is expected to be reliable.
pub async fn run(cfg: &AdapterConfig, tx: EventSender) {
    let mut attempt = 0usize;
    loop {
        match run_once(cfg, &tx).await {
            Ok(()) => attempt = 0,
            Err(e) => tracing::error!("amqp adapter connection lost: {e}"),
        }
        let delay = RECONNECT_DELAYS_SECS[attempt.min(RECONNECT_DELAYS_SECS.len() - 1)];
        attempt += 1;
        tracing::info!("amqp adapter reconnecting in {delay}s");
        tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
    }
}

async fn run_once(cfg: &AdapterConfig, tx: &EventSender) -> anyhow::Result<()> {
    let conn = Connection::connect(&cfg.amqp_url, ConnectionProperties::default()).await?;
    let channel = conn.create_channel().await?;

    channel
        .exchange_declare(
            &cfg.amqp_exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_declare(
            &cfg.amqp_queue,
            QueueDeclareOptions { durable: true, ..Default::default() },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(&cfg.amqp_queue, &cfg.amqp_exchange, "telemetry.*", QueueBindOptions::default(), FieldTable::default())
        .await?;
    channel.basic_qos(1, BasicQosOptions::default()).await?;

    let mut consumer = channel
        .basic_consume(&cfg.amqp_queue, "insa-amqp-adapter", BasicConsumeOptions::default(), FieldTable::default())
        .await?;

    tracing::info!("amqp adapter consuming queue '{}' on exchange '{}'", cfg.amqp_queue, cfg.amqp_exchange);
    while let Some(delivery) = consumer.next().await {
        let delivery = delivery?;
        let readings: std::collections::HashMap<String, RawReading> = match serde_json::from_slice(&delivery.data) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("amqp: malformed telemetry body, nacking without requeue: {e}");
                delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await?;
                continue;
            }
        };
        let Some(device_id) = delivery
            .routing_key
            .as_str()
            .strip_prefix("telemetry.")
            .map(|s| s.to_string())
        else {
            delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await?;
            continue;
        };

        let event = NormalizedTelemetryEvent {
            device_id,
            protocol: "amqp",
            readings: readings.iter().map(|(k, r)| reading_from_raw(k, r)).collect(),
            timestamp: Utc::now(),
            tenant_hint: None,
            ack: None,
        };
        if tx.try_send(event).is_err() {
            tracing::warn!("amqp adapter: ingestion channel full, nacking with requeue");
            delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await?;
            continue;
        }
        delivery.ack(BasicAckOptions::default()).await?;
    }
    Ok(())
}

/// Paired publisher for `alerts.*` / `commands.*`, used by the
/// notification dispatcher and the management API's device-command endpoint
/// respectively. Persistent delivery mode so messages survive a broker
/// restart, matching the durable exchange/queue declared above.
pub struct AmqpPublisher {
    channel: Channel,
    exchange: String,
}

impl AmqpPublisher {
    pub async fn connect(cfg: &AdapterConfig) -> anyhow::Result<Self> {
        let conn = Connection::connect(&cfg.amqp_url, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;
        Ok(Self { channel, exchange: cfg.amqp_exchange.clone() })
    }

    pub async fn publish(&self, routing_key: &str, payload: &[u8]) -> anyhow::Result<()> {
        self.channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;
        Ok(())
    }
}
