use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;

use crate::auth::context::CurrentUser;
use crate::auth::guard::{require_matching_tenant, require_tenant_admin_for_path, RequireSystemAdmin};
use crate::auth::hash_password;
use crate::error::{AppError, AppResult};
use crate::models::tenant::{CreateTenantRequest, Tenant, TenantQuotas, TenantStats, Tier, UpdateTenantRequest};
use crate::models::user::{InviteUserRequest, TenantUserView, UpdateRoleRequest};
use crate::models::user::{TenantUser, User};
use crate::AppState;

fn valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= 64
        && slug.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

pub async fn create_tenant(
    State(state): State<AppState>,
    RequireSystemAdmin(_): RequireSystemAdmin,
    Json(req): Json<CreateTenantRequest>,
) -> AppResult<impl IntoResponse> {
    if !valid_slug(&req.slug) {
        return Err(AppError::Validation(format!(
            "slug {:?} must be lowercase alphanumeric with dashes",
            req.slug
        )));
    }
    if Tier::parse(&req.tier).is_none() {
        return Err(AppError::Validation(format!("unknown tier {:?}", req.tier)));
    }
    if state.config_db.get_tenant_by_slug(&req.slug)?.is_some() {
        return Err(AppError::Conflict(format!("slug {:?} already exists", req.slug)));
    }
    let now = Utc::now().to_rfc3339();
    let tenant = Tenant {
        id: uuid::Uuid::new_v4().to_string(),
        slug: req.slug,
        name: req.name,
        tier: req.tier,
        max_devices: req.max_devices,
        max_users: req.max_users,
        max_telemetry_points_per_day: req.max_telemetry_points_per_day,
        max_retention_days: req.max_retention_days,
        created_at: now.clone(),
        updated_at: now,
    };
    state.config_db.create_tenant(&tenant)?;
    Ok((StatusCode::CREATED, Json(tenant)))
}

#[derive(Debug, serde::Deserialize)]
pub struct TenantListQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_per_page")]
    pub per_page: usize,
    pub tier: Option<String>,
    pub slug: Option<String>,
}

fn default_page() -> usize {
    1
}
fn default_per_page() -> usize {
    50
}

pub async fn list_tenants(
    State(state): State<AppState>,
    RequireSystemAdmin(_): RequireSystemAdmin,
    axum::extract::Query(q): axum::extract::Query<TenantListQuery>,
) -> AppResult<impl IntoResponse> {
    let per_page = q.per_page.clamp(1, 500);
    let page = q.page.max(1);
    let tenants: Vec<Tenant> = state
        .config_db
        .list_tenants()?
        .into_iter()
        .filter(|t| q.tier.as_deref().is_none_or(|tier| t.tier == tier))
        .filter(|t| q.slug.as_deref().is_none_or(|slug| t.slug.contains(slug)))
        .collect();
    let total = tenants.len();
    let items: Vec<Tenant> = tenants
        .into_iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .collect();
    Ok(Json(serde_json::json!({
        "tenants": items,
        "total": total,
        "page": page,
        "per_page": per_page,
    })))
}

pub async fn get_tenant(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(tenant_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    require_matching_tenant(&user, &tenant_id)?;
    let tenant = state
        .config_db
        .get_tenant(&tenant_id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;
    Ok(Json(tenant))
}

pub async fn update_tenant(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(tenant_id): Path<String>,
    Json(req): Json<UpdateTenantRequest>,
) -> AppResult<impl IntoResponse> {
    require_tenant_admin_for_path(&user, &tenant_id)?;
    if let Some(tier) = &req.tier {
        if Tier::parse(tier).is_none() {
            return Err(AppError::Validation(format!("unknown tier {tier:?}")));
        }
    }
    let updated = state.config_db.update_tenant(
        &tenant_id,
        req.name.as_deref(),
        req.tier.as_deref(),
        req.max_devices,
        req.max_users,
        req.max_telemetry_points_per_day,
        req.max_retention_days,
    )?;
    if !updated {
        return Err(AppError::not_found_or_forbidden());
    }
    let tenant = state
        .config_db
        .get_tenant(&tenant_id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;
    Ok(Json(tenant))
}

pub async fn delete_tenant(
    State(state): State<AppState>,
    RequireSystemAdmin(_): RequireSystemAdmin,
    Path(tenant_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let deleted = state.config_db.delete_tenant(&tenant_id)?;
    if !deleted {
        return Err(AppError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_tenant_stats(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(tenant_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    require_matching_tenant(&user, &tenant_id)?;
    let device_count = state.config_db.count_devices(&tenant_id)?;
    let user_count = state.config_db.count_tenant_users(&tenant_id)?;
    let open_alert_count = state.config_db.count_open_alerts(&tenant_id)?;
    let day = state.clock.now().format("%Y-%m-%d").to_string();
    let telemetry_points_today = state.telemetry_store.count_today(&tenant_id, &day).await?;
    let stats = TenantStats {
        device_count,
        user_count,
        telemetry_points_today,
        telemetry_points_per_sec: telemetry_points_today as f64 / 86_400.0,
        open_alert_count,
    };
    Ok(Json(stats))
}

pub async fn get_tenant_quotas(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(tenant_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    require_matching_tenant(&user, &tenant_id)?;
    let tenant = state
        .config_db
        .get_tenant(&tenant_id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;
    let day = state.clock.now().format("%Y-%m-%d").to_string();
    let caps = tenant.caps();
    let quotas = TenantQuotas {
        devices_used: state.config_db.count_devices(&tenant_id)?,
        devices_cap: caps.max_devices,
        users_used: state.config_db.count_tenant_users(&tenant_id)?,
        users_cap: caps.max_users,
        telemetry_points_today: state.config_db.telemetry_count_today(&tenant_id, &day)?,
        telemetry_points_cap: caps.max_telemetry_points_per_day,
    };
    Ok(Json(quotas))
}

pub async fn list_tenant_users(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(tenant_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    require_matching_tenant(&user, &tenant_id)?;
    let members: Vec<TenantUserView> = state.config_db.list_tenant_users(&tenant_id)?;
    Ok(Json(members))
}

/// Invites a user into the tenant. If the email doesn't match an existing
/// account one is created with the supplied password; an existing account
/// is simply attached to the tenant with the requested role.
pub async fn invite_user(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(tenant_id): Path<String>,
    Json(req): Json<InviteUserRequest>,
) -> AppResult<impl IntoResponse> {
    require_tenant_admin_for_path(&user, &tenant_id)?;

    let tenant = state
        .config_db
        .get_tenant(&tenant_id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;

    let now = state.clock.now().to_rfc3339();
    let existing = state.config_db.get_user_by_email(&req.email)?;
    let target_user = match existing {
        Some(u) => u,
        None => {
            let verifier = hash_password(&req.password)?;
            let new_user = User {
                id: uuid::Uuid::new_v4().to_string(),
                email: req.email.clone(),
                password_verifier: verifier,
                is_system_admin: false,
                created_at: now.clone(),
            };
            state.config_db.create_user(&new_user)?;
            new_user
        }
    };

    let membership = TenantUser {
        tenant_id: tenant_id.clone(),
        user_id: target_user.id.clone(),
        role: req.role,
        is_tenant_admin: req.is_tenant_admin,
        joined_at: now,
    };
    match state.config_db.create_tenant_user_checked(&membership, tenant.max_users)? {
        Ok(()) => Ok(StatusCode::CREATED),
        Err("exists") => Err(AppError::Conflict("user is already a member of this tenant".to_string())),
        Err("quota") => Err(AppError::QuotaExceeded(format!("tenant {tenant_id} is at its user cap"))),
        Err(_) => Err(AppError::Internal("unexpected invite failure".to_string())),
    }
}

pub async fn update_tenant_user_role(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((tenant_id, user_id)): Path<(String, String)>,
    Json(req): Json<UpdateRoleRequest>,
) -> AppResult<impl IntoResponse> {
    require_tenant_admin_for_path(&user, &tenant_id)?;
    let result = state
        .config_db
        .update_tenant_user_role(&tenant_id, &user_id, req.role.as_deref(), req.is_tenant_admin)?;
    match result {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err("not_found") => Err(AppError::NotFound),
        Err("last_admin") => Err(AppError::Conflict("cannot demote the tenant's last admin".to_string())),
        Err(_) => Err(AppError::Internal("unexpected role update failure".to_string())),
    }
}

pub async fn remove_tenant_user(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((tenant_id, user_id)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    require_tenant_admin_for_path(&user, &tenant_id)?;
    let result = state.config_db.remove_tenant_user(&tenant_id, &user_id)?;
    match result {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err("not_found") => Err(AppError::NotFound),
        Err("last_admin") => Err(AppError::Conflict("cannot remove the tenant's last admin".to_string())),
        Err(_) => Err(AppError::Internal("unexpected membership removal failure".to_string())),
    }
}
