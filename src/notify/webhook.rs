use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::models::alert::Alert;

type HmacSha256 = Hmac<Sha256>;

const MAX_PAYLOAD_BYTES: usize = 1_000_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_INTERVAL: Duration = Duration::from_secs(1);
const RETRY_DELAYS_SECS: &[u64] = &[1, 2, 4];

fn blocked_networks() -> Vec<ipnet::IpNet> {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
    ]
    .iter()
    .map(|c| c.parse().expect("static CIDR always parses"))
    .collect()
}

fn is_blocked(addr: IpAddr) -> bool {
    blocked_networks().iter().any(|net| net.contains(&addr))
}

/// Per-target send spacing so a noisy tenant's webhook cannot starve
/// others: rate is capped at 1 request/second per target and excess sends
/// wait rather than drop.
#[derive(Default)]
pub struct RateLimiter {
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    async fn wait_turn(&self, url: &str) {
        let wait = {
            let mut map = self.last_sent.lock().unwrap();
            let now = Instant::now();
            let wait = map
                .get(url)
                .and_then(|last| MIN_INTERVAL.checked_sub(now.duration_since(*last)));
            map.insert(url.to_string(), now + wait.unwrap_or_default());
            wait
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Validates scheme and that every resolved address avoids private/loopback
/// ranges before any connection is attempted (SSRF guard). Also used by the
/// channel management API to reject a blocked target at configuration time.
pub async fn check_target(url: &str) -> anyhow::Result<()> {
    let parsed = url::Url::parse(url)?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        anyhow::bail!("unsupported scheme {:?}", parsed.scheme());
    }
    let host = parsed.host_str().ok_or_else(|| anyhow::anyhow!("webhook url has no host"))?;
    let port = parsed.port_or_known_default().unwrap_or(443);
    let addrs = tokio::net::lookup_host((host, port)).await?;
    let mut any = false;
    for addr in addrs {
        any = true;
        if is_blocked(addr.ip()) {
            anyhow::bail!("webhook target {host} resolves to a blocked address {}", addr.ip());
        }
    }
    if !any {
        anyhow::bail!("webhook target {host} did not resolve");
    }
    Ok(())
}

fn sign(secret: &[u8], timestamp: i64, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(format!("{timestamp}.{body}").as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

pub async fn send(
    http: &reqwest::Client,
    limiter: &RateLimiter,
    signing_secret: &[u8],
    alert: &Alert,
    url: &str,
) -> anyhow::Result<()> {
    check_target(url).await?;

    let payload = serde_json::json!({
        "alert_id": alert.id,
        "tenant_id": alert.tenant_id,
        "device_id": alert.device_id,
        "severity": alert.severity,
        "message": alert.message,
        "created_at": alert.created_at,
    });
    let body = serde_json::to_string(&payload)?;
    if body.len() > MAX_PAYLOAD_BYTES {
        anyhow::bail!("webhook payload exceeds 1MB");
    }

    for delay in RETRY_DELAYS_SECS.iter().chain(std::iter::once(&0)) {
        limiter.wait_turn(url).await;
        let timestamp = chrono::Utc::now().timestamp();
        let signature = sign(signing_secret, timestamp, &body);

        let result = http
            .post(url)
            .header("X-Signature", format!("sha256={signature}"))
            .header("X-Timestamp", timestamp.to_string())
            .header("Content-Type", "application/json")
            .body(body.clone())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;

        let outcome = match result {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => Err(anyhow::anyhow!("webhook {url} returned {}", resp.status())),
            Err(e) => Err(e.into()),
        };
        if *delay == 0 {
            return outcome;
        }
        tracing::warn!("alert {}: webhook {url} attempt failed, retrying in {delay}s", alert.id);
        tokio::time::sleep(Duration::from_secs(*delay)).await;
    }
    unreachable!("loop always returns on the trailing zero delay")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges_are_blocked() {
        assert!(is_blocked("10.1.2.3".parse().unwrap()));
        assert!(is_blocked("192.168.1.1".parse().unwrap()));
        assert!(is_blocked("127.0.0.1".parse().unwrap()));
        assert!(is_blocked("169.254.1.1".parse().unwrap()));
        assert!(is_blocked("::1".parse().unwrap()));
        assert!(!is_blocked("8.8.8.8".parse().unwrap()));
    }

    #[tokio::test]
    async fn loopback_target_rejected_before_connect() {
        // Port 9 (discard) would hang or refuse if a connection were made;
        // the guard must fail on the resolved address alone.
        assert!(check_target("http://127.0.0.1:9/hook").await.is_err());
    }

    #[tokio::test]
    async fn non_http_scheme_rejected() {
        assert!(check_target("ftp://example.com/hook").await.is_err());
    }

    #[test]
    fn signature_is_deterministic() {
        let a = sign(b"secret", 1000, "body");
        let b = sign(b"secret", 1000, "body");
        assert_eq!(a, b);
        assert_ne!(a, sign(b"other", 1000, "body"));
    }
}
