use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::AppState;
use crate::auth::context::{CurrentUser, TenantContext};
use crate::error::AppError;

/// Gate 1: Authenticate. Extracts and verifies the `Authorization: Bearer`
/// header against the platform's `TokenSigner`.
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AppError::Unauthenticated)?;
        let token = header.strip_prefix("Bearer ").ok_or(AppError::Unauthenticated)?;
        let claims = state.token_signer.verify(token).ok_or(AppError::Unauthenticated)?;
        Ok(CurrentUser {
            user_id: claims.user_id,
            is_system_admin: claims.is_system_admin,
            tenant_id: claims.tenant_id,
            is_tenant_admin: claims.is_tenant_admin,
        })
    }
}

/// Gate 2: Require tenant context. A system-admin-only token (issued with
/// no tenant slug) fails this gate with `TenantContextRequired`.
impl FromRequestParts<AppState> for TenantContext {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        let tenant_id = user.tenant_id.ok_or(AppError::TenantContextRequired)?;
        Ok(TenantContext {
            tenant_id,
            is_tenant_admin: user.is_tenant_admin,
        })
    }
}

/// Gate 3a: Require tenant-admin (or system-admin, who bypasses tenant role
/// checks entirely).
pub struct RequireTenantAdmin(pub TenantContext);

impl FromRequestParts<AppState> for RequireTenantAdmin {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        let tenant_id = user.tenant_id.clone().ok_or(AppError::TenantContextRequired)?;
        if !user.is_tenant_admin && !user.is_system_admin {
            return Err(AppError::Forbidden);
        }
        Ok(RequireTenantAdmin(TenantContext {
            tenant_id,
            is_tenant_admin: user.is_tenant_admin,
        }))
    }
}

/// Gate 3b: Require system-admin (tenant listing/creation, reopening a
/// resolved alert).
pub struct RequireSystemAdmin(pub CurrentUser);

impl FromRequestParts<AppState> for RequireSystemAdmin {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        if !user.is_system_admin {
            return Err(AppError::Forbidden);
        }
        Ok(RequireSystemAdmin(user))
    }
}

/// Used by `/tenants/{id}/...` handlers, where the path tenant must match
/// the caller's own tenant unless they're a system admin. Isolation
/// applies the same to path-addressed and token-addressed tenants.
pub fn require_matching_tenant(user: &CurrentUser, path_tenant_id: &str) -> Result<(), AppError> {
    if user.is_system_admin {
        return Ok(());
    }
    match &user.tenant_id {
        Some(t) if t == path_tenant_id => Ok(()),
        _ => Err(AppError::not_found_or_forbidden()),
    }
}

/// Same isolation check as `require_matching_tenant`, plus an admin-role
/// check for mutation routes. System admins bypass both.
pub fn require_tenant_admin_for_path(user: &CurrentUser, path_tenant_id: &str) -> Result<(), AppError> {
    require_matching_tenant(user, path_tenant_id)?;
    if user.is_system_admin || user.is_tenant_admin {
        return Ok(());
    }
    Err(AppError::Forbidden)
}
