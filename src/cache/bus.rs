use futures_util::StreamExt;
use redis::AsyncCommands;

use super::Caches;

const RULES_CHANNEL_PREFIX: &str = "rules:invalidate:";
const ONCALL_CHANNEL: &str = "oncall:invalidate";

/// Publishes a rule-cache invalidation for `tenant_id`: every process
/// running a rule cache must drop its copy the moment a rule changes, not
/// just the process that handled the write.
pub async fn publish_rule_invalidation(redis_url: &str, tenant_id: &str) -> anyhow::Result<()> {
    let client = redis::Client::open(redis_url)?;
    let mut conn = client.get_multiplexed_async_connection().await?;
    let channel = format!("{RULES_CHANNEL_PREFIX}{tenant_id}");
    let _: () = conn.publish(channel, tenant_id).await?;
    Ok(())
}

pub async fn publish_oncall_invalidation(redis_url: &str, schedule_id: &str) -> anyhow::Result<()> {
    let client = redis::Client::open(redis_url)?;
    let mut conn = client.get_multiplexed_async_connection().await?;
    let _: () = conn.publish(ONCALL_CHANNEL, schedule_id).await?;
    Ok(())
}

/// Subscribes to the invalidation channels and drops matching local cache
/// entries as messages arrive. Runs for the lifetime of the process;
/// reconnects with a fixed backoff if the redis connection drops.
pub async fn spawn_subscriber(redis_url: String, caches: Caches) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = run_subscriber(&redis_url, &caches).await {
                tracing::warn!("cache invalidation subscriber disconnected: {e}, retrying in 5s");
            }
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }
    });
}

async fn run_subscriber(redis_url: &str, caches: &Caches) -> anyhow::Result<()> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(format!("{RULES_CHANNEL_PREFIX}*")).await?;
    pubsub.subscribe(ONCALL_CHANNEL).await?;

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel: String = msg.get_channel_name().to_string();
        let payload: String = msg.get_payload().unwrap_or_default();
        if channel.starts_with(RULES_CHANNEL_PREFIX) {
            caches.invalidate_tenant_rules(&payload).await;
        } else if channel == ONCALL_CHANNEL {
            caches.invalidate_oncall(&payload).await;
        }
    }
    Ok(())
}
