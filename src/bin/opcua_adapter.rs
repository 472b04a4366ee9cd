use tracing_subscriber::EnvFilter;

use insa_core::adapters;
use insa_core::config::PlatformConfig;

/// Standalone OPC UA server process. Unlike the other adapter binaries it
/// has no ingestion channel to drain: OPC UA clients read and subscribe,
/// they do not push telemetry in.
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

    tracing::info!("insa-opcua-adapter starting");
    adapters::opcua::run(&config.adapters, state.config_db, state.telemetry_store).await
}
