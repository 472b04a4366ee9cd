use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;

use crate::AppState;
use crate::auth::token::{ACCESS_TOKEN_TTL_SECS, REFRESH_TOKEN_TTL_SECS, TokenClaims, generate_opaque_token};
use crate::auth::{permissions_for, verify_password};
use crate::error::{AppError, AppResult};
use crate::models::user::{LoginRequest, LoginResponse, RefreshRequest, TenantUser, User};

/// Verifies credentials and issues an access/refresh token pair. A match
/// against a legacy sha256 verifier upgrades the stored verifier to bcrypt
/// before the response is sent, so the migration rides the same
/// authenticated request. Every failure collapses to `InvalidCredentials`;
/// the response never says whether the account or the password was wrong.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> AppResult<impl IntoResponse> {
    let user = state
        .config_db
        .get_user_by_email(&req.email)?
        .ok_or(AppError::InvalidCredentials)?;

    let (ok, upgraded) = verify_password(&req.password, &user.password_verifier)
        .map_err(|_| AppError::InvalidCredentials)?;
    if !ok {
        return Err(AppError::InvalidCredentials);
    }
    if let Some(new_verifier) = upgraded {
        state.config_db.update_password_verifier(&user.id, &new_verifier)?;
        tracing::info!("upgraded legacy password verifier for user {}", user.id);
    }

    // Resolve the tenant binding for the token: an explicit slug wins, a
    // sole membership is implied, and a system admin may log in unbound.
    let membership = match &req.tenant_slug {
        Some(slug) => {
            let tenant = state
                .config_db
                .get_tenant_by_slug(slug)?
                .ok_or(AppError::InvalidCredentials)?;
            let tu = match state.config_db.get_tenant_user(&tenant.id, &user.id)? {
                Some(tu) => tu,
                // System admins can bind to any tenant without a membership row.
                None if user.is_system_admin => TenantUser {
                    tenant_id: tenant.id.clone(),
                    user_id: user.id.clone(),
                    role: "system".into(),
                    is_tenant_admin: true,
                    joined_at: String::new(),
                },
                None => return Err(AppError::InvalidCredentials),
            };
            Some(tu)
        }
        None => {
            let memberships = state.config_db.list_user_memberships(&user.id)?;
            match memberships.len() {
                1 => memberships.into_iter().next(),
                0 if user.is_system_admin => None,
                0 => return Err(AppError::InvalidCredentials),
                // Several memberships and no slug to pick one: bind to none
                // and let the caller re-login with an explicit slug.
                _ => None,
            }
        }
    };

    let claims = claims_for(&state, &user, membership.as_ref())?;
    let tenant_id = claims.tenant_id.clone();
    let access_token = state.token_signer.issue(claims);

    let refresh_token = generate_opaque_token();
    let expires_at = (state.clock.now() + chrono::Duration::seconds(REFRESH_TOKEN_TTL_SECS)).to_rfc3339();
    state
        .config_db
        .create_refresh_token(&refresh_token, &user.id, tenant_id.as_deref(), &expires_at)?;

    Ok(Json(LoginResponse {
        access_token,
        refresh_token,
        expires_in: ACCESS_TOKEN_TTL_SECS,
    }))
}

/// Rotates a refresh token: the presented token is consumed and a new pair
/// is issued, so a replayed refresh token fails.
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> AppResult<impl IntoResponse> {
    let (user_id, tenant_id) = state
        .config_db
        .consume_refresh_token(&req.refresh_token)?
        .ok_or(AppError::Unauthenticated)?;
    let user = state
        .config_db
        .get_user(&user_id)?
        .ok_or(AppError::Unauthenticated)?;

    let membership = match &tenant_id {
        Some(t) => state.config_db.get_tenant_user(t, &user.id)?,
        None => None,
    };
    let claims = claims_for(&state, &user, membership.as_ref())?;

    let access_token = state.token_signer.issue(claims);
    let new_refresh = generate_opaque_token();
    let expires_at = (state.clock.now() + chrono::Duration::seconds(REFRESH_TOKEN_TTL_SECS)).to_rfc3339();
    state
        .config_db
        .create_refresh_token(&new_refresh, &user.id, tenant_id.as_deref(), &expires_at)?;

    Ok(Json(LoginResponse {
        access_token,
        refresh_token: new_refresh,
        expires_in: ACCESS_TOKEN_TTL_SECS,
    }))
}

/// Assembles the full claim set for a token: identity, tenant binding with
/// its slug, role, and the derived permission list.
fn claims_for(state: &AppState, user: &User, membership: Option<&TenantUser>) -> AppResult<TokenClaims> {
    let tenant_slug = match membership {
        Some(tu) => state.config_db.get_tenant(&tu.tenant_id)?.map(|t| t.slug),
        None => None,
    };
    let is_tenant_admin = membership.map(|tu| tu.is_tenant_admin).unwrap_or(false);
    Ok(TokenClaims {
        user_id: user.id.clone(),
        tenant_id: membership.map(|tu| tu.tenant_id.clone()),
        tenant_slug,
        role: membership.map(|tu| tu.role.clone()),
        permissions: permissions_for(user.is_system_admin, is_tenant_admin),
        is_tenant_admin,
        is_system_admin: user.is_system_admin,
    })
}
