use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::SmtpSettings;
use crate::models::alert::Alert;

/// Builds the pooled SMTP transport once at startup; the connection pool
/// is reused across sends.
pub fn build_transport(cfg: &SmtpSettings) -> Option<AsyncSmtpTransport<Tokio1Executor>> {
    let host = cfg.host.as_deref()?;
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(host).ok()?;
    builder = builder.port(cfg.port).timeout(Some(std::time::Duration::from_secs(30)));
    if let (Some(user), Some(pass)) = (&cfg.user, &cfg.pass) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    Some(builder.build())
}

fn subject_for(alert: &Alert) -> String {
    format!("[{}] Alert on device {}", alert.severity.to_uppercase(), alert.device_id)
}

fn body_for(alert: &Alert) -> String {
    format!(
        "Severity: {}\nDevice: {}\nMessage: {}\nCreated: {}\n",
        alert.severity, alert.device_id, alert.message, alert.created_at
    )
}

pub async fn send(
    transport: &AsyncSmtpTransport<Tokio1Executor>,
    cfg: &SmtpSettings,
    alert: &Alert,
    to: &str,
) -> anyhow::Result<()> {
    let email = Message::builder()
        .from(cfg.from.parse()?)
        .to(to.parse()?)
        .subject(subject_for(alert))
        .header(ContentType::TEXT_PLAIN)
        .body(body_for(alert))?;

    const RETRY_DELAYS_SECS: &[u64] = &[1, 2, 4];
    for delay in RETRY_DELAYS_SECS.iter().chain(std::iter::once(&0)) {
        match transport.send(email.clone()).await {
            Ok(_) => return Ok(()),
            Err(e) if *delay == 0 => return Err(e.into()),
            Err(_) => tokio::time::sleep(std::time::Duration::from_secs(*delay)).await,
        }
    }
    unreachable!("loop always returns on the trailing zero delay")
}
