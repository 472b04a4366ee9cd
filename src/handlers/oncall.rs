use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;

use crate::AppState;
use crate::auth::context::TenantContext;
use crate::auth::guard::RequireTenantAdmin;
use crate::cache::bus;
use crate::error::{AppError, AppResult};
use crate::escalation::oncall_resolver::OnCallResolver;
use crate::models::oncall::{CreateOnCallScheduleRequest, OnCallScheduleRow, RotationSpec};

fn validate(req: &CreateOnCallScheduleRequest) -> AppResult<()> {
    if req.timezone.parse::<chrono_tz::Tz>().is_err() {
        return Err(AppError::Validation(format!("unknown IANA timezone {:?}", req.timezone)));
    }
    match &req.rotation {
        RotationSpec::Weekly { users } | RotationSpec::Daily { users } => {
            if users.is_empty() {
                return Err(AppError::Validation("rotation needs at least one user".into()));
            }
        }
        RotationSpec::Custom { ranges } => {
            if ranges.is_empty() {
                return Err(AppError::Validation("custom rotation needs at least one range".into()));
            }
            for range in ranges {
                if range.start_date > range.end_date {
                    return Err(AppError::Validation(format!(
                        "range {} .. {} is inverted",
                        range.start_date, range.end_date
                    )));
                }
            }
        }
    }
    Ok(())
}

async fn invalidate(state: &AppState, schedule_id: &str) {
    state.caches.invalidate_oncall(schedule_id).await;
    if let Err(e) = bus::publish_oncall_invalidation(&state.redis_url, schedule_id).await {
        tracing::warn!("oncall cache invalidation publish failed for schedule {schedule_id}: {e}");
    }
}

pub async fn list_schedules(
    State(state): State<AppState>,
    RequireTenantAdmin(ctx): RequireTenantAdmin,
) -> AppResult<impl IntoResponse> {
    let schedules = state.config_db.list_on_call_schedules(&ctx.tenant_id)?;
    Ok(Json(schedules))
}

pub async fn create_schedule(
    State(state): State<AppState>,
    RequireTenantAdmin(ctx): RequireTenantAdmin,
    Json(req): Json<CreateOnCallScheduleRequest>,
) -> AppResult<impl IntoResponse> {
    validate(&req)?;
    let row = OnCallScheduleRow {
        id: uuid::Uuid::new_v4().to_string(),
        tenant_id: ctx.tenant_id.clone(),
        name: req.name,
        rotation_spec: serde_json::to_string(&req.rotation).map_err(|e| AppError::Validation(e.to_string()))?,
        overrides_spec: serde_json::to_string(&req.overrides).map_err(|e| AppError::Validation(e.to_string()))?,
        timezone: req.timezone,
        created_at: state.clock.now().to_rfc3339(),
    };
    state.config_db.create_on_call_schedule(&row)?;
    Ok((StatusCode::CREATED, Json(row)))
}

pub async fn get_schedule(
    State(state): State<AppState>,
    RequireTenantAdmin(ctx): RequireTenantAdmin,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let schedule = state
        .config_db
        .get_on_call_schedule(&ctx.tenant_id, &id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;
    Ok(Json(schedule))
}

pub async fn update_schedule(
    State(state): State<AppState>,
    RequireTenantAdmin(ctx): RequireTenantAdmin,
    Path(id): Path<String>,
    Json(req): Json<CreateOnCallScheduleRequest>,
) -> AppResult<impl IntoResponse> {
    validate(&req)?;
    let existing = state
        .config_db
        .get_on_call_schedule(&ctx.tenant_id, &id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;
    let row = OnCallScheduleRow {
        name: req.name,
        rotation_spec: serde_json::to_string(&req.rotation).map_err(|e| AppError::Validation(e.to_string()))?,
        overrides_spec: serde_json::to_string(&req.overrides).map_err(|e| AppError::Validation(e.to_string()))?,
        timezone: req.timezone,
        ..existing
    };
    state.config_db.update_on_call_schedule(&ctx.tenant_id, &id, &row)?;
    invalidate(&state, &id).await;
    Ok(Json(row))
}

pub async fn delete_schedule(
    State(state): State<AppState>,
    RequireTenantAdmin(ctx): RequireTenantAdmin,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    if !state.config_db.delete_on_call_schedule(&ctx.tenant_id, &id)? {
        return Err(AppError::not_found_or_forbidden());
    }
    invalidate(&state, &id).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CurrentQuery {
    pub schedule_id: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct CurrentOnCall {
    pub schedule_id: String,
    pub schedule_name: String,
    pub user_id: Option<String>,
    pub email: Option<String>,
}

/// Resolves who is on call right now, for one schedule or all of the
/// tenant's schedules.
pub async fn current_on_call(
    State(state): State<AppState>,
    ctx: TenantContext,
    Query(q): Query<CurrentQuery>,
) -> AppResult<impl IntoResponse> {
    let resolver = OnCallResolver::new(state.caches.clone(), state.clock.clone());
    let schedules = match q.schedule_id {
        Some(id) => vec![
            state
                .config_db
                .get_on_call_schedule(&ctx.tenant_id, &id)?
                .ok_or_else(AppError::not_found_or_forbidden)?,
        ],
        None => state.config_db.list_on_call_schedules(&ctx.tenant_id)?,
    };

    let mut results = Vec::with_capacity(schedules.len());
    for schedule in schedules {
        let user_id = resolver.resolve(&state.config_db, &ctx.tenant_id, &schedule.id).await?;
        let email = match &user_id {
            Some(uid) => state.config_db.get_user(uid)?.map(|u| u.email),
            None => None,
        };
        results.push(CurrentOnCall {
            schedule_id: schedule.id,
            schedule_name: schedule.name,
            user_id,
            email,
        });
    }
    Ok(Json(results))
}
