use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::AppState;
use crate::alerts;
use crate::alerts::state_machine;
use crate::auth::context::{CurrentUser, TenantContext};
use crate::error::{AppError, AppResult};
use crate::models::alert::{
    AddNoteRequest, AlertHistoryResponse, AlertState, CreateAlertRequest, TransitionRequest,
};
use crate::models::rule::Severity;

pub async fn list_alerts(
    State(state): State<AppState>,
    ctx: TenantContext,
) -> AppResult<impl IntoResponse> {
    let alerts = state.config_db.list_alerts(&ctx.tenant_id)?;
    Ok(Json(alerts))
}

pub async fn get_alert(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let alert = state
        .config_db
        .get_alert(&ctx.tenant_id, &id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;
    Ok(Json(alert))
}

pub async fn list_alert_groups(
    State(state): State<AppState>,
    ctx: TenantContext,
) -> AppResult<impl IntoResponse> {
    let groups = state.config_db.list_alert_groups(&ctx.tenant_id)?;
    Ok(Json(groups))
}

/// Creates an alert from an external source (no rule). It flows through the
/// same grouping/SLA emission path as rule-emitted alerts; with an
/// `external_source_key` it participates in grouping, without one it stands
/// alone.
pub async fn create_alert(
    State(state): State<AppState>,
    ctx: TenantContext,
    Json(req): Json<CreateAlertRequest>,
) -> AppResult<impl IntoResponse> {
    let severity = Severity::parse(&req.severity)
        .ok_or_else(|| AppError::Validation(format!("unknown severity {:?}", req.severity)))?;
    state
        .config_db
        .get_device(&ctx.tenant_id, &req.device_id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;
    if let Some(policy_id) = &req.escalation_policy_id {
        state
            .config_db
            .get_escalation_policy(&ctx.tenant_id, policy_id)?
            .ok_or_else(AppError::not_found_or_forbidden)?;
    }

    let candidate = crate::models::alert::AlertCandidate {
        tenant_id: ctx.tenant_id.clone(),
        device_id: req.device_id,
        rule_id: None,
        external_source_key: req.external_source_key,
        severity: severity.as_str().to_string(),
        message: req.message,
        metadata: req.metadata,
        actions: vec![],
    };
    let now = state.clock.now();
    let (mut alert, is_representative) =
        alerts::emit(&state.config_db, candidate, state.defaults.grouping_window_secs, now)?;

    // An explicitly supplied policy overrides the severity-filter match
    // `emit` picked, but only on the representative.
    if is_representative {
        if let Some(policy_id) = req.escalation_policy_id {
            alert.escalation_policy_id = Some(policy_id);
            state.config_db.set_alert_escalation_policy(&alert.id, alert.escalation_policy_id.as_deref())?;
        }
    }

    Ok((StatusCode::CREATED, Json(alert)))
}

async fn apply_transition(
    state: &AppState,
    ctx: &TenantContext,
    user: &CurrentUser,
    alert_id: &str,
    next: AlertState,
    note: Option<&str>,
) -> AppResult<()> {
    // Tenant scoping first: a foreign alert id must 404 before the state
    // machine ever sees it.
    state
        .config_db
        .get_alert(&ctx.tenant_id, alert_id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;
    state_machine::transition(
        &state.config_db,
        alert_id,
        next,
        &user.user_id,
        user.is_system_admin,
        note,
        state.clock.now(),
    )
}

pub async fn acknowledge_alert(
    State(state): State<AppState>,
    ctx: TenantContext,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<TransitionRequest>,
) -> AppResult<impl IntoResponse> {
    apply_transition(&state, &ctx, &user, &id, AlertState::Acknowledged, req.note.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn investigate_alert(
    State(state): State<AppState>,
    ctx: TenantContext,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<TransitionRequest>,
) -> AppResult<impl IntoResponse> {
    apply_transition(&state, &ctx, &user, &id, AlertState::Investigating, req.note.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn resolve_alert(
    State(state): State<AppState>,
    ctx: TenantContext,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<TransitionRequest>,
) -> AppResult<impl IntoResponse> {
    apply_transition(&state, &ctx, &user, &id, AlertState::Resolved, req.note.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Re-open is deliberately restricted: only a system admin may take a
/// resolved alert back to `new`.
pub async fn reopen_alert(
    State(state): State<AppState>,
    ctx: TenantContext,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<TransitionRequest>,
) -> AppResult<impl IntoResponse> {
    apply_transition(&state, &ctx, &user, &id, AlertState::New, req.note.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Appends a note to the alert's history without changing its state: the
/// note rides a state row re-asserting the current state.
pub async fn add_alert_note(
    State(state): State<AppState>,
    ctx: TenantContext,
    user: CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<AddNoteRequest>,
) -> AppResult<impl IntoResponse> {
    state
        .config_db
        .get_alert(&ctx.tenant_id, &id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;
    let current = state
        .config_db
        .latest_alert_state(&id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;
    state.config_db.append_alert_state(
        &id,
        &current,
        &user.user_id,
        &state.clock.now().to_rfc3339(),
        Some(&req.note),
    )?;
    Ok(StatusCode::CREATED)
}

pub async fn get_alert_history(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let alert = state
        .config_db
        .get_alert(&ctx.tenant_id, &id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;
    let states = state.config_db.list_alert_states(&id)?;
    let sla = state.config_db.get_alert_sla(&id)?;
    Ok(Json(AlertHistoryResponse { alert, states, sla }))
}
