use tracing_subscriber::EnvFilter;

use insa_core::adapters;
use insa_core::config::PlatformConfig;

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

    tracing::info!("insa-coap-adapter starting");
    adapters::coap::run(&config.adapters.coap_bind, config_db, tx).await
}
