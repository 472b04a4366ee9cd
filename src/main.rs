use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::delete, routing::get, routing::patch, routing::post};
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::GovernorLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use insa_core::config::PlatformConfig;
use insa_core::{adapters, handlers, retention};

/// Single-process deployment: the management API plus all four protocol
/// adapters and every background loop in one binary. The
/// `src/bin/*_adapter.rs` binaries run individual adapters standalone for
/// deployments that split them out.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("insa_core=debug,tower_http=debug")
        }))
        .init();

    let config = PlatformConfig::from_env()?;
    let state = insa_core::bootstrap(&config).await?;

    insa_core::spawn_background_tasks(&state);
    retention::spawn(state.config_db.clone(), state.telemetry_store.clone());

    // Adapters feed one shared bounded channel; a single consumer drains it
    // into the ingestion pipeline.
    let (tx, rx) = adapters::channel();
    tokio::spawn(insa_core::run_ingestion_consumer(state.clone(), rx));
    {
        let cfg = config.adapters.clone();
        let config_db = state.config_db.clone();
        let tx = tx.clone();
        tokio::spawn(async move { adapters::mqtt::run(&cfg, "insa-core", config_db, tx).await });
    }
    {
        let cfg = config.adapters.clone();
        let config_db = state.config_db.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = adapters::coap::run(&cfg.coap_bind, config_db, tx).await {
                tracing::error!("coap adapter exited: {e}");
            }
        });
    }
    {
        let cfg = config.adapters.clone();
        tokio::spawn(async move { adapters::amqp::run(&cfg, tx).await });
    }
    {
        let cfg = config.adapters.clone();
        let config_db = state.config_db.clone();
        let store = state.telemetry_store.clone();
        tokio::spawn(async move {
            if let Err(e) = adapters::opcua::run(&cfg, config_db, store).await {
                tracing::error!("opcua adapter exited: {e}");
            }
        });
    }

    let governor = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(20)
            .burst_size(50)
            .finish()
            .expect("static governor config is valid"),
    );

    let app = Router::new()
        // Auth
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh", post(handlers::auth::refresh))
        // Tenants (system-admin surface plus tenant-scoped reads)
        .route(
            "/tenants",
            get(handlers::tenants::list_tenants).post(handlers::tenants::create_tenant),
        )
        .route(
            "/tenants/{id}",
            get(handlers::tenants::get_tenant)
                .patch(handlers::tenants::update_tenant)
                .delete(handlers::tenants::delete_tenant),
        )
        .route("/tenants/{id}/stats", get(handlers::tenants::get_tenant_stats))
        .route("/tenants/{id}/quotas", get(handlers::tenants::get_tenant_quotas))
        .route("/tenants/{id}/users", get(handlers::tenants::list_tenant_users))
        .route("/tenants/{id}/users/invite", post(handlers::tenants::invite_user))
        .route(
            "/tenants/{id}/users/{user_id}",
            delete(handlers::tenants::remove_tenant_user),
        )
        .route(
            "/tenants/{id}/users/{user_id}/role",
            patch(handlers::tenants::update_tenant_user_role),
        )
        // Devices
        .route(
            "/devices",
            get(handlers::devices::list_devices).post(handlers::devices::create_device),
        )
        .route(
            "/devices/{id}",
            get(handlers::devices::get_device)
                .patch(handlers::devices::update_device)
                .delete(handlers::devices::delete_device),
        )
        .route("/devices/{id}/telemetry", get(handlers::devices::get_device_telemetry))
        // Rules
        .route(
            "/rules",
            get(handlers::rules::list_rules).post(handlers::rules::create_rule),
        )
        .route(
            "/rules/{id}",
            get(handlers::rules::get_rule)
                .patch(handlers::rules::update_rule)
                .delete(handlers::rules::delete_rule),
        )
        // Alerts & lifecycle
        .route(
            "/alerts",
            get(handlers::alerts::list_alerts).post(handlers::alerts::create_alert),
        )
        .route("/alert-groups", get(handlers::alerts::list_alert_groups))
        .route("/alerts/{id}", get(handlers::alerts::get_alert))
        .route("/alerts/{id}/acknowledge", post(handlers::alerts::acknowledge_alert))
        .route("/alerts/{id}/investigate", post(handlers::alerts::investigate_alert))
        .route("/alerts/{id}/resolve", post(handlers::alerts::resolve_alert))
        .route("/alerts/{id}/reopen", post(handlers::alerts::reopen_alert))
        .route("/alerts/{id}/notes", post(handlers::alerts::add_alert_note))
        .route("/alerts/{id}/history", get(handlers::alerts::get_alert_history))
        // Escalation & on-call config
        .route(
            "/escalation-policies",
            get(handlers::escalation_policies::list_policies)
                .post(handlers::escalation_policies::create_policy),
        )
        .route(
            "/escalation-policies/{id}",
            get(handlers::escalation_policies::get_policy)
                .delete(handlers::escalation_policies::delete_policy),
        )
        .route(
            "/on-call-schedules",
            get(handlers::oncall::list_schedules).post(handlers::oncall::create_schedule),
        )
        .route(
            "/on-call-schedules/{id}",
            get(handlers::oncall::get_schedule)
                .patch(handlers::oncall::update_schedule)
                .delete(handlers::oncall::delete_schedule),
        )
        .route("/on-call/current", get(handlers::oncall::current_on_call))
        // Notification channels
        .route(
            "/channels",
            get(handlers::channels::list_channels).post(handlers::channels::create_channel),
        )
        .route("/channels/{id}", delete(handlers::channels::delete_channel))
        // Health
        .route("/healthz", get(handlers::health::healthz))
        .layer(GovernorLayer { config: governor })
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let port = std::env::var("INSA_API_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080u16);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("insa-core listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, draining");
        })
        .await?;

    Ok(())
}
