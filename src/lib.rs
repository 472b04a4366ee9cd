pub mod adapters;
pub mod alerts;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod escalation;
pub mod handlers;
pub mod ingestion;
pub mod models;
pub mod notify;
pub mod retention;
pub mod rules;

use std::sync::Arc;

use auth::token::TokenSigner;
use cache::Caches;
use clock::Clock;
use config::{PlatformConfig, RuleDefaults};
use db::{ConfigDb, TelemetryStore};
use escalation::oncall_resolver::OnCallResolver;
use notify::NotifyDispatcher;

#[derive(Clone)]
pub struct AppState {
    pub config_db: Arc<ConfigDb>,
    pub telemetry_store: Arc<TelemetryStore>,
    pub caches: Arc<Caches>,
    pub clock: Arc<dyn Clock>,
    pub token_signer: TokenSigner,
    pub notifier: Arc<NotifyDispatcher>,
    pub defaults: RuleDefaults,
    pub redis_url: String,
}

/// Everything `main.rs` and the four `src/bin/*_adapter.rs` binaries need to
/// bring up: opens the control-plane database, connects to ClickHouse, and
/// wires the caches/notifier/on-call resolver each process shares. Kept in
/// one place so the adapter binaries don't drift from `main.rs`'s wiring.
pub async fn bootstrap(config: &PlatformConfig) -> anyhow::Result<AppState> {
    db::migrations::run(
        &config.clickhouse_url,
        &config.clickhouse_user,
        &config.clickhouse_password,
    )
    .await?;

    let config_db = Arc::new(ConfigDb::open(&config.database_path)?);
    tracing::info!("config db opened at {}", config.database_path);

    let telemetry_store = Arc::new(TelemetryStore::connect(
        &config.clickhouse_url,
        &config.clickhouse_database,
        &config.clickhouse_user,
        &config.clickhouse_password,
    ));

    let caches = Arc::new(Caches::new(
        config.rules.rule_cache_ttl_secs,
        config.rules.oncall_cache_ttl_secs,
        config.rules.reactive_coalesce_ms,
    ));
    cache::bus::spawn_subscriber(config.redis_url.clone(), (*caches).clone()).await;

    let clock: Arc<dyn Clock> = Arc::new(clock::SystemClock);
    let oncall = Arc::new(OnCallResolver::new(caches.clone(), clock.clone()));
    // Broker fan-out is best-effort: a missing broker degrades to
    // channel-only notification rather than failing startup.
    let amqp = match adapters::amqp::AmqpPublisher::connect(&config.adapters).await {
        Ok(publisher) => Some(publisher),
        Err(e) => {
            tracing::warn!("amqp publisher unavailable, broker fan-out disabled: {e}");
            None
        }
    };
    let notifier = Arc::new(NotifyDispatcher::new(
        config.smtp.clone(),
        config.sms.clone(),
        config.webhook_signing_secret.clone(),
        oncall,
        amqp,
    ));

    let token_signer = TokenSigner::new(config.token_signing_secret.clone());

    Ok(AppState {
        config_db,
        telemetry_store,
        caches,
        clock,
        token_signer,
        notifier,
        defaults: config.rules.clone(),
        redis_url: config.redis_url.clone(),
    })
}

/// Spawns the background loops every long-running process (the main API
/// server and each protocol adapter binary) needs: rule evaluation,
/// escalation, and SLA breach monitoring. Adapters run this too so a
/// telemetry burst ingested directly through an adapter process still
/// triggers reactive rules without waiting on the main server.
pub fn spawn_background_tasks(state: &AppState) {
    rules::engine::spawn(
        state.config_db.clone(),
        state.telemetry_store.clone(),
        state.caches.clone(),
        state.notifier.clone(),
        state.clock.clone(),
        state.defaults.clone(),
    );
    escalation::executor::spawn(
        state.config_db.clone(),
        state.notifier.clone(),
        state.clock.clone(),
        state.defaults.escalation_interval_secs,
    );
    alerts::sla_monitor::spawn(
        state.config_db.clone(),
        state.notifier.clone(),
        state.clock.clone(),
        state.defaults.sla_monitor_interval_secs,
    );
}

/// Drains an adapter's ingestion channel for the lifetime of the process,
/// handing every normalized event to the shared ingestion pipeline.
pub async fn run_ingestion_consumer(state: AppState, mut rx: adapters::EventReceiver) {
    while let Some(event) = rx.recv().await {
        let now = state.clock.now();
        if let Err(e) = ingestion::ingest(
            &state.config_db,
            &state.telemetry_store,
            &state.caches,
            &state.notifier,
            &state.defaults,
            event,
            now,
        )
        .await
        {
            tracing::warn!("ingestion failed: {e}");
        }
    }
}
