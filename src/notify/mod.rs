pub mod email;
pub mod sms;
pub mod webhook;

use std::sync::Arc;

use lettre::{AsyncSmtpTransport, Tokio1Executor};

use crate::adapters::amqp::AmqpPublisher;
use crate::config::{SmsSettings, SmtpSettings};
use crate::db::ConfigDb;
use crate::escalation::oncall_resolver::OnCallResolver;
use crate::models::alert::Alert;
use crate::models::escalation::{Channel, EscalationTier, TargetRef};
use crate::models::rule::NotificationAction;

/// Fans an alert out to its channels: per-channel dispatch that logs and
/// moves on rather than failing the whole alert because one send failed.
pub struct NotifyDispatcher {
    http: reqwest::Client,
    smtp: Option<AsyncSmtpTransport<Tokio1Executor>>,
    smtp_settings: SmtpSettings,
    sms: Option<SmsSettings>,
    webhook_signing_secret: Vec<u8>,
    webhook_limiter: webhook::RateLimiter,
    oncall: Arc<OnCallResolver>,
    amqp: Option<AmqpPublisher>,
}

impl NotifyDispatcher {
    pub fn new(
        smtp_settings: SmtpSettings,
        sms: Option<SmsSettings>,
        webhook_signing_secret: Vec<u8>,
        oncall: Arc<OnCallResolver>,
        amqp: Option<AmqpPublisher>,
    ) -> Self {
        let smtp = email::build_transport(&smtp_settings);
        if smtp.is_some() {
            tracing::info!("notification dispatcher: SMTP configured");
        }
        Self {
            http: reqwest::Client::new(),
            smtp,
            smtp_settings,
            sms,
            webhook_signing_secret,
            webhook_limiter: webhook::RateLimiter::default(),
            oncall,
            amqp,
        }
    }

    /// Dispatches a rule's literal action list: each action already
    /// carries its own destination, no target resolution needed. New alerts
    /// also fan out to the broker under `alerts.<severity>` for downstream
    /// consumers.
    pub async fn notify_new_alert(&self, db: &ConfigDb, alert: &Alert, actions: &[NotificationAction]) {
        if let Some(amqp) = &self.amqp {
            let payload = serde_json::json!({
                "alert_id": alert.id,
                "tenant_id": alert.tenant_id,
                "device_id": alert.device_id,
                "severity": alert.severity,
                "message": alert.message,
                "created_at": alert.created_at,
            });
            let routing_key = format!("alerts.{}", alert.severity);
            if let Err(e) = amqp.publish(&routing_key, payload.to_string().as_bytes()).await {
                tracing::warn!("alert {}: broker publish to {routing_key} failed: {e}", alert.id);
            }
        }
        for action in actions {
            match action {
                NotificationAction::Email { to } => self.send_email(db, alert, to).await,
                NotificationAction::Sms { to } => self.send_sms(alert, to).await,
                NotificationAction::Webhook { name, url } => self.send_webhook(db, alert, name, url).await,
            }
        }
    }

    /// Raises an SLA breach against whatever the alert's own escalation
    /// policy already uses for its first tier, so a breach reaches the same
    /// people who'd otherwise be escalated to.
    pub async fn notify_sla_breach(&self, db: &ConfigDb, alert: &Alert, kind: &str) {
        tracing::warn!("alert {}: {kind} SLA breached", alert.id);
        let Some(policy_id) = &alert.escalation_policy_id else { return };
        let Ok(Some(policy)) = db.get_escalation_policy(&alert.tenant_id, policy_id) else {
            return;
        };
        let Ok(tiers) = serde_json::from_str::<Vec<EscalationTier>>(&policy.tiers_spec) else {
            return;
        };
        if let Some(tier) = tiers.first() {
            self.notify_tier(db, alert, tier).await;
        }
    }

    /// Dispatches one escalation tier: resolves its targets to users (or
    /// the current on-call assignee) and crosses them with the tier's
    /// channel list.
    pub async fn notify_tier(&self, db: &ConfigDb, alert: &Alert, tier: &EscalationTier) {
        let mut user_ids = Vec::new();
        for target in &tier.targets {
            match target.parse() {
                Some(TargetRef::User(id)) => user_ids.push(id),
                Some(TargetRef::OnCall(schedule_id)) => {
                    if let Ok(Some(uid)) = self.oncall.resolve(db, &alert.tenant_id, &schedule_id).await {
                        user_ids.push(uid);
                    }
                }
                None => tracing::warn!("escalation target {:?} has unknown shape", target.0),
            }
        }

        for channel in &tier.channels {
            match channel {
                Channel::Email => {
                    for uid in &user_ids {
                        if let Ok(Some(user)) = db.get_user(uid) {
                            self.send_email(db, alert, &user.email).await;
                        }
                    }
                }
                Channel::Sms => {
                    let Some(sms) = &self.sms else {
                        tracing::warn!("alert {}: sms channel used but no provider configured", alert.id);
                        continue;
                    };
                    for uid in &user_ids {
                        if let Ok(Some((_, channel_type, config))) = db.get_channel_by_name(&alert.tenant_id, &format!("sms:{uid}")) {
                            if channel_type != "sms" {
                                continue;
                            }
                            let number: serde_json::Value = serde_json::from_str(&config).unwrap_or_default();
                            if let Some(to) = number.get("phone").and_then(|p| p.as_str()) {
                                sms::send(&self.http, sms, alert, to).await;
                            }
                        }
                    }
                }
                Channel::Webhook => {
                    if let Ok(channels) = db.list_channels(&alert.tenant_id) {
                        for (_, name, channel_type, config) in channels {
                            if channel_type != "webhook" {
                                continue;
                            }
                            if let Ok(cfg) = serde_json::from_str::<serde_json::Value>(&config) {
                                if let Some(url) = cfg.get("url").and_then(|u| u.as_str()) {
                                    self.send_webhook(db, alert, &name, url).await;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn send_email(&self, db: &ConfigDb, alert: &Alert, to: &str) {
        let Some(transport) = &self.smtp else {
            tracing::warn!("alert {}: email requested but SMTP not configured", alert.id);
            return;
        };
        if let Err(e) = email::send(transport, &self.smtp_settings, alert, to).await {
            tracing::warn!("alert {}: email to {to} failed: {e}", alert.id);
            self.record_failure(db, alert, "email", &e.to_string());
        }
    }

    async fn send_sms(&self, alert: &Alert, to: &str) {
        let Some(sms) = &self.sms else {
            tracing::warn!("alert {}: sms requested but no provider configured", alert.id);
            return;
        };
        sms::send(&self.http, sms, alert, to).await;
    }

    async fn send_webhook(&self, db: &ConfigDb, alert: &Alert, name: &str, url: &str) {
        if let Err(e) = webhook::send(&self.http, &self.webhook_limiter, &self.webhook_signing_secret, alert, url).await {
            tracing::warn!("alert {}: webhook {name} failed: {e}", alert.id);
            self.record_failure(db, alert, "webhook", &e.to_string());
        }
    }

    /// A failed send is recorded against the alert and nothing else: no
    /// state change, no halt to later tiers, no error back to whoever
    /// triggered the notification.
    fn record_failure(&self, db: &ConfigDb, alert: &Alert, channel: &str, error: &str) {
        let at = chrono::Utc::now().to_rfc3339();
        if let Err(e) = db.record_notification_failure(&alert.id, channel, error, &at) {
            tracing::warn!("alert {}: failed to record {channel} delivery failure: {e}", alert.id);
        }
    }
}
