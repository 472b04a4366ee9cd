use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;

use crate::AppState;
use crate::auth::context::TenantContext;
use crate::error::{AppError, AppResult};
use crate::models::device::{
    CreateDeviceRequest, Device, DeviceResponse, DeviceStatus, Protocol, UpdateDeviceRequest,
};

pub async fn list_devices(
    State(state): State<AppState>,
    ctx: TenantContext,
) -> AppResult<impl IntoResponse> {
    let devices = state.config_db.list_devices(&ctx.tenant_id)?;
    let responses: Vec<DeviceResponse> = devices.into_iter().map(DeviceResponse::from).collect();
    Ok(Json(responses))
}

pub async fn create_device(
    State(state): State<AppState>,
    ctx: TenantContext,
    Json(req): Json<CreateDeviceRequest>,
) -> AppResult<impl IntoResponse> {
    if Protocol::parse(&req.protocol).is_none() {
        return Err(AppError::Validation(format!("unknown protocol {:?}", req.protocol)));
    }
    if req.name.trim().is_empty() {
        return Err(AppError::Validation("device name must not be empty".into()));
    }

    let tenant = state
        .config_db
        .get_tenant(&ctx.tenant_id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;

    let device = Device {
        id: uuid::Uuid::new_v4().to_string(),
        tenant_id: ctx.tenant_id.clone(),
        name: req.name,
        device_type: req.device_type,
        protocol: req.protocol,
        status: DeviceStatus::Offline.as_str().to_string(),
        metadata: req.metadata.to_string(),
        last_seen_at: None,
        created_at: state.clock.now().to_rfc3339(),
    };
    match state.config_db.create_device_checked(&device, tenant.max_devices)? {
        Ok(()) => {}
        Err("quota") => {
            return Err(AppError::QuotaExceeded(format!(
                "tenant {} is at its device cap",
                ctx.tenant_id
            )));
        }
        Err(_) => return Err(AppError::Internal("unexpected device create failure".into())),
    }
    Ok((StatusCode::CREATED, Json(DeviceResponse::from(device))))
}

pub async fn get_device(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let device = state
        .config_db
        .get_device(&ctx.tenant_id, &id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;
    Ok(Json(DeviceResponse::from(device)))
}

pub async fn update_device(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(id): Path<String>,
    Json(req): Json<UpdateDeviceRequest>,
) -> AppResult<impl IntoResponse> {
    if let Some(status) = &req.status {
        if DeviceStatus::parse(status).is_none() {
            return Err(AppError::Validation(format!("unknown status {status:?}")));
        }
    }
    let metadata = req.metadata.map(|m| m.to_string());
    let updated = state.config_db.update_device(
        &ctx.tenant_id,
        &id,
        req.name.as_deref(),
        req.device_type.as_deref(),
        req.status.as_deref(),
        metadata.as_deref(),
    )?;
    if !updated {
        return Err(AppError::not_found_or_forbidden());
    }
    let device = state
        .config_db
        .get_device(&ctx.tenant_id, &id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;
    Ok(Json(DeviceResponse::from(device)))
}

pub async fn delete_device(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let deleted = state.config_db.delete_device(&ctx.tenant_id, &id)?;
    if !deleted {
        return Err(AppError::not_found_or_forbidden());
    }
    // The adapters' tenant-resolution cache must not keep routing telemetry
    // for a device that no longer exists.
    state.caches.invalidate_device_binding(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct TelemetryQuery {
    pub key: Option<String>,
    pub from: Option<chrono::DateTime<chrono::Utc>>,
    pub to: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    1000
}

/// Recent telemetry for one device, newest first. Defaults to the trailing
/// hour when no window is given.
pub async fn get_device_telemetry(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(id): Path<String>,
    Query(q): Query<TelemetryQuery>,
) -> AppResult<impl IntoResponse> {
    // Ownership check first so a foreign device id 404s without touching
    // the time-series store.
    state
        .config_db
        .get_device(&ctx.tenant_id, &id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;

    let now = state.clock.now();
    let to = q.to.unwrap_or(now);
    let from = q.from.unwrap_or(to - chrono::Duration::hours(1));
    let rows = state
        .telemetry_store
        .fetch_range(&ctx.tenant_id, &id, q.key.as_deref(), from, to, q.limit.min(10_000))
        .await?;
    Ok(Json(rows))
}
