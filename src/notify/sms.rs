use crate::config::SmsSettings;
use crate::models::alert::Alert;

/// Truncates to the provider's 160-character limit, always leading with the
/// `[SEVERITY]` tag.
fn render(alert: &Alert) -> String {
    let prefix = format!("[{}] ", alert.severity.to_uppercase());
    let mut body = format!("{prefix}{}", alert.message);
    body.truncate(160);
    body
}

pub async fn send(http: &reqwest::Client, cfg: &SmsSettings, alert: &Alert, to: &str) {
    let payload = serde_json::json!({
        "to": to,
        "from": cfg.from_number,
        "body": render(alert),
    });
    let request = http
        .post(&cfg.provider_url)
        .bearer_auth(&cfg.api_key)
        .json(&payload)
        .timeout(std::time::Duration::from_secs(10));

    match request.send().await {
        Ok(resp) if resp.status().is_success() => {}
        Ok(resp) => tracing::warn!("alert {}: sms provider returned {}", alert.id, resp.status()),
        Err(e) => tracing::warn!("alert {}: sms send to {to} failed: {e}", alert.id),
    }
}
