pub mod context;
pub mod guard;
pub mod token;

use sha2::{Digest, Sha256};

/// bcrypt-equivalent work factor, 12 rounds.
const BCRYPT_COST: u32 = 12;

pub fn hash_password(plain: &str) -> anyhow::Result<String> {
    Ok(bcrypt::hash(plain, BCRYPT_COST)?)
}

/// Permission tags embedded in bearer tokens, derived from the caller's
/// admin flags at issue time.
pub fn permissions_for(is_system_admin: bool, is_tenant_admin: bool) -> Vec<String> {
    let mut permissions = vec!["tenant:read".to_string(), "tenant:write".to_string()];
    if is_tenant_admin || is_system_admin {
        permissions.push("tenant:admin".to_string());
    }
    if is_system_admin {
        permissions.push("platform:admin".to_string());
    }
    permissions
}

/// Legacy verifiers were a bare SHA-256 hex digest with no prefix. Current
/// verifiers always start with the bcrypt `$2` prefix, so the two formats
/// are unambiguous.
fn is_legacy_sha256(verifier: &str) -> bool {
    !verifier.starts_with("$2") && verifier.len() == 64 && verifier.bytes().all(|b| b.is_ascii_hexdigit())
}

fn sha256_hex(plain: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plain.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Verifies `plain` against a stored verifier, supporting both formats.
/// Returns `(matches, upgraded_verifier)`: when a legacy verifier matches,
/// the caller should persist `upgraded_verifier` so the account is migrated
/// to bcrypt transparently on next successful login.
pub fn verify_password(plain: &str, stored_verifier: &str) -> anyhow::Result<(bool, Option<String>)> {
    if is_legacy_sha256(stored_verifier) {
        let matches = sha256_hex(plain) == stored_verifier;
        if matches {
            return Ok((true, Some(hash_password(plain)?)));
        }
        return Ok((false, None));
    }
    let matches = bcrypt::verify(plain, stored_verifier)?;
    Ok((matches, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcrypt_roundtrip() {
        let verifier = hash_password("hunter2").unwrap();
        let (ok, upgrade) = verify_password("hunter2", &verifier).unwrap();
        assert!(ok);
        assert!(upgrade.is_none());
    }

    #[test]
    fn legacy_sha256_verifies_and_upgrades() {
        let legacy = sha256_hex("hunter2");
        let (ok, upgrade) = verify_password("hunter2", &legacy).unwrap();
        assert!(ok);
        let upgraded = upgrade.expect("legacy match should propose an upgrade");
        assert!(upgraded.starts_with("$2"));
        let (ok2, upgrade2) = verify_password("hunter2", &upgraded).unwrap();
        assert!(ok2);
        assert!(upgrade2.is_none());
    }

    #[test]
    fn wrong_password_rejected() {
        let verifier = hash_password("hunter2").unwrap();
        let (ok, _) = verify_password("wrong", &verifier).unwrap();
        assert!(!ok);
    }
}
