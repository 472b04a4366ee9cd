use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Claims carried by a bearer token: who the caller is, which tenant (if
/// any) the token is bound to, and what they may do there. Callers treat
/// the encoded token as opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub tenant_slug: Option<String>,
    pub role: Option<String>,
    pub permissions: Vec<String>,
    pub is_tenant_admin: bool,
    pub is_system_admin: bool,
}

#[derive(Serialize, Deserialize)]
struct TokenPayload {
    #[serde(flatten)]
    claims: TokenClaims,
    exp: DateTime<Utc>,
}

/// Access tokens expire in 1 hour; refresh tokens (opaque random strings
/// stored server-side, see `ConfigDb::create_refresh_token`) in 30 days.
pub const ACCESS_TOKEN_TTL_SECS: i64 = 3600;
pub const REFRESH_TOKEN_TTL_SECS: i64 = 30 * 24 * 3600;

/// Signs and verifies bearer tokens with a single secret loaded once at
/// startup and never regenerated.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl TokenSigner {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    pub fn issue(&self, claims: TokenClaims) -> String {
        let payload = TokenPayload {
            claims,
            exp: Utc::now() + chrono::Duration::seconds(ACCESS_TOKEN_TTL_SECS),
        };
        let body = serde_json::to_vec(&payload).expect("TokenPayload always serializes");
        let body_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&body);
        let sig = self.sign(body_b64.as_bytes());
        format!("{body_b64}.{sig}")
    }

    pub fn verify(&self, token: &str) -> Option<TokenClaims> {
        let (body_b64, sig) = token.split_once('.')?;
        let expected = self.sign(body_b64.as_bytes());
        if !constant_time_eq(expected.as_bytes(), sig.as_bytes()) {
            return None;
        }
        let body = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(body_b64).ok()?;
        let payload: TokenPayload = serde_json::from_slice(&body).ok()?;
        if payload.exp < Utc::now() {
            return None;
        }
        Some(payload.claims)
    }

    fn sign(&self, data: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(data);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn generate_opaque_token() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(tenant: Option<&str>) -> TokenClaims {
        TokenClaims {
            user_id: "u1".into(),
            tenant_id: tenant.map(str::to_string),
            tenant_slug: tenant.map(|_| "acme".to_string()),
            role: tenant.map(|_| "admin".to_string()),
            permissions: vec!["tenant:read".into(), "tenant:write".into()],
            is_tenant_admin: tenant.is_some(),
            is_system_admin: false,
        }
    }

    #[test]
    fn issued_token_verifies() {
        let signer = TokenSigner::new(b"test-secret".to_vec());
        let token = signer.issue(claims(Some("t1")));
        let verified = signer.verify(&token).expect("valid token should verify");
        assert_eq!(verified.user_id, "u1");
        assert_eq!(verified.tenant_id.as_deref(), Some("t1"));
        assert_eq!(verified.tenant_slug.as_deref(), Some("acme"));
        assert_eq!(verified.role.as_deref(), Some("admin"));
        assert_eq!(verified.permissions, vec!["tenant:read", "tenant:write"]);
        assert!(verified.is_tenant_admin);
        assert!(!verified.is_system_admin);
    }

    #[test]
    fn tampered_token_rejected() {
        let signer = TokenSigner::new(b"test-secret".to_vec());
        let mut token = signer.issue(claims(None));
        token.push('x');
        assert!(signer.verify(&token).is_none());
    }

    #[test]
    fn wrong_secret_rejected() {
        let signer_a = TokenSigner::new(b"secret-a".to_vec());
        let signer_b = TokenSigner::new(b"secret-b".to_vec());
        let token = signer_a.issue(claims(None));
        assert!(signer_b.verify(&token).is_none());
    }
}
