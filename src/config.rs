use std::path::Path;

use serde::Deserialize;

/// Environment-sourced secrets and connection strings. No defaults for
/// secrets in production; `PlatformConfig::from_env` aborts startup if
/// `TOKEN_SIGNING_SECRET` is absent.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub database_path: String,
    pub clickhouse_url: String,
    pub clickhouse_database: String,
    pub clickhouse_user: String,
    pub clickhouse_password: String,
    pub redis_url: String,
    pub token_signing_secret: Vec<u8>,
    pub webhook_signing_secret: Vec<u8>,
    pub smtp: SmtpSettings,
    pub sms: Option<SmsSettings>,
    pub rules: RuleDefaults,
    pub adapters: AdapterConfig,
}

/// Connection settings for the four protocol adapters. Each adapter binary
/// also reads these directly via `PlatformConfig::from_env` so
/// `src/main.rs` and `src/bin/*_adapter.rs` agree on defaults without
/// duplicating them.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_topic_prefix: String,
    pub coap_bind: String,
    pub amqp_url: String,
    pub amqp_exchange: String,
    pub amqp_queue: String,
    pub opcua_bind_port: u16,
}

impl AdapterConfig {
    fn from_env() -> Self {
        Self {
            mqtt_host: std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            mqtt_port: std::env::var("MQTT_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(1883),
            mqtt_topic_prefix: std::env::var("MQTT_TOPIC_PREFIX").unwrap_or_else(|_| "iiot".to_string()),
            coap_bind: std::env::var("COAP_BIND").unwrap_or_else(|_| "0.0.0.0:5683".to_string()),
            amqp_url: std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://127.0.0.1:5672/%2f".to_string()),
            amqp_exchange: std::env::var("AMQP_EXCHANGE").unwrap_or_else(|_| "iiot".to_string()),
            amqp_queue: std::env::var("AMQP_QUEUE").unwrap_or_else(|_| "telemetry".to_string()),
            opcua_bind_port: std::env::var("OPCUA_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(4840),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SmtpSettings {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct SmsSettings {
    pub provider_url: String,
    pub api_key: String,
    pub from_number: String,
}

impl PlatformConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let token_signing_secret = std::env::var("TOKEN_SIGNING_SECRET")
            .map_err(|_| anyhow::anyhow!("TOKEN_SIGNING_SECRET is required and has no default"))?
            .into_bytes();
        if token_signing_secret.is_empty() {
            anyhow::bail!("TOKEN_SIGNING_SECRET must not be empty");
        }

        let sms = match (
            std::env::var("SMS_PROVIDER_URL").ok(),
            std::env::var("SMS_API_KEY").ok(),
        ) {
            (Some(provider_url), Some(api_key)) => Some(SmsSettings {
                provider_url,
                api_key,
                from_number: std::env::var("SMS_FROM_NUMBER").unwrap_or_default(),
            }),
            _ => None,
        };

        // No separate secret configured in most deployments; webhook
        // signing reuses the token secret rather than forcing a second one.
        let webhook_signing_secret = std::env::var("WEBHOOK_SIGNING_SECRET")
            .map(String::into_bytes)
            .unwrap_or_else(|_| token_signing_secret.clone());

        Ok(Self {
            database_path: std::env::var("INSA_CONFIG_DB")
                .unwrap_or_else(|_| "./insa_core.db".to_string()),
            clickhouse_url: std::env::var("CLICKHOUSE_URL")
                .unwrap_or_else(|_| "http://localhost:8123".to_string()),
            clickhouse_database: std::env::var("CLICKHOUSE_DATABASE")
                .unwrap_or_else(|_| "insa_iiot".to_string()),
            clickhouse_user: std::env::var("CLICKHOUSE_USER")
                .unwrap_or_else(|_| "default".to_string()),
            clickhouse_password: std::env::var("CLICKHOUSE_PASSWORD").unwrap_or_default(),
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            token_signing_secret,
            webhook_signing_secret,
            smtp: SmtpSettings {
                host: std::env::var("INSA_SMTP_HOST").ok(),
                port: std::env::var("INSA_SMTP_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(587),
                user: std::env::var("INSA_SMTP_USER").ok(),
                pass: std::env::var("INSA_SMTP_PASS").ok(),
                from: std::env::var("INSA_SMTP_FROM")
                    .unwrap_or_else(|_| "alerts@insa-iiot.local".to_string()),
            },
            sms,
            rules: RuleDefaults::load(
                std::env::var("INSA_CONFIG_FILE").unwrap_or_else(|_| "insa.toml".to_string()),
            )?,
            adapters: AdapterConfig::from_env(),
        })
    }
}

/// Structural defaults loaded from an optional TOML file, falling back to
/// built-in defaults when the file is absent.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleDefaults {
    #[serde(default = "default_eval_interval")]
    pub evaluation_interval_secs: u64,
    #[serde(default = "default_rule_cache_ttl")]
    pub rule_cache_ttl_secs: u64,
    #[serde(default = "default_grouping_window")]
    pub grouping_window_secs: i64,
    #[serde(default = "default_escalation_interval")]
    pub escalation_interval_secs: u64,
    #[serde(default = "default_sla_monitor_interval")]
    pub sla_monitor_interval_secs: u64,
    #[serde(default = "default_oncall_cache_ttl")]
    pub oncall_cache_ttl_secs: u64,
    #[serde(default = "default_reactive_coalesce_ms")]
    pub reactive_coalesce_ms: u64,
}

impl Default for RuleDefaults {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: default_eval_interval(),
            rule_cache_ttl_secs: default_rule_cache_ttl(),
            grouping_window_secs: default_grouping_window(),
            escalation_interval_secs: default_escalation_interval(),
            sla_monitor_interval_secs: default_sla_monitor_interval(),
            oncall_cache_ttl_secs: default_oncall_cache_ttl(),
            reactive_coalesce_ms: default_reactive_coalesce_ms(),
        }
    }
}

fn default_eval_interval() -> u64 {
    30
}
fn default_rule_cache_ttl() -> u64 {
    600
}
fn default_grouping_window() -> i64 {
    300
}
fn default_escalation_interval() -> u64 {
    60
}
fn default_sla_monitor_interval() -> u64 {
    300
}
fn default_oncall_cache_ttl() -> u64 {
    3600
}
fn default_reactive_coalesce_ms() -> u64 {
    500
}

impl RuleDefaults {
    fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(cfg)
    }
}
