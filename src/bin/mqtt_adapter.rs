use tracing_subscriber::EnvFilter;

use insa_core::adapters;
use insa_core::config::PlatformConfig;

/// Standalone MQTT adapter process: subscribes to the broker and drains its
/// own ingestion channel, with the rule/escalation/SLA loops running
/// alongside so reactive evaluation works without the main API server.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("insa_core=debug")
        }))
        .init();

    let config = PlatformConfig::from_env()?;
    let state = insa_core::bootstrap(&config).await?;
    insa_core::spawn_background_tasks(&state);

    let (tx, rx) = adapters::channel();
    let config_db = state.config_db.clone();
    tokio::spawn(insa_core::run_ingestion_consumer(state, rx));

    tracing::info!("insa-mqtt-adapter starting");
    adapters::mqtt::run(&config.adapters, "insa-mqtt-adapter", config_db, tx).await;
    Ok(())
}
