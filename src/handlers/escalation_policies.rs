use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::AppState;
use crate::auth::guard::RequireTenantAdmin;
use crate::error::{AppError, AppResult};
use crate::models::escalation::{CreateEscalationPolicyRequest, EscalationPolicyRow};
use crate::models::rule::Severity;

fn validate(req: &CreateEscalationPolicyRequest) -> AppResult<()> {
    if req.tiers.is_empty() {
        return Err(AppError::Validation("policy needs at least one tier".into()));
    }
    let mut prev_delay = -1i64;
    for tier in &req.tiers {
        if tier.delay_minutes < 0 {
            return Err(AppError::Validation("tier delay must not be negative".into()));
        }
        if tier.delay_minutes < prev_delay {
            return Err(AppError::Validation("tier delays must be non-decreasing".into()));
        }
        prev_delay = tier.delay_minutes;
        for target in &tier.targets {
            if target.parse().is_none() {
                return Err(AppError::Validation(format!(
                    "target {:?} must be user:<id> or oncall:<schedule_id>",
                    target.0
                )));
            }
        }
    }
    for severity in &req.severity_filter {
        if Severity::parse(severity).is_none() {
            return Err(AppError::Validation(format!("unknown severity {severity:?}")));
        }
    }
    Ok(())
}

pub async fn list_policies(
    State(state): State<AppState>,
    RequireTenantAdmin(ctx): RequireTenantAdmin,
) -> AppResult<impl IntoResponse> {
    let policies = state.config_db.list_escalation_policies(&ctx.tenant_id)?;
    Ok(Json(policies))
}

pub async fn create_policy(
    State(state): State<AppState>,
    RequireTenantAdmin(ctx): RequireTenantAdmin,
    Json(req): Json<CreateEscalationPolicyRequest>,
) -> AppResult<impl IntoResponse> {
    validate(&req)?;
    let row = EscalationPolicyRow {
        id: uuid::Uuid::new_v4().to_string(),
        tenant_id: ctx.tenant_id.clone(),
        name: req.name,
        tiers_spec: serde_json::to_string(&req.tiers).map_err(|e| AppError::Validation(e.to_string()))?,
        severity_filter: serde_json::to_string(&req.severity_filter)
            .map_err(|e| AppError::Validation(e.to_string()))?,
        created_at: state.clock.now().to_rfc3339(),
    };
    state.config_db.create_escalation_policy(&row)?;
    Ok((StatusCode::CREATED, Json(row)))
}

pub async fn get_policy(
    State(state): State<AppState>,
    RequireTenantAdmin(ctx): RequireTenantAdmin,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let policy = state
        .config_db
        .get_escalation_policy(&ctx.tenant_id, &id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;
    Ok(Json(policy))
}

pub async fn delete_policy(
    State(state): State<AppState>,
    RequireTenantAdmin(ctx): RequireTenantAdmin,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    if !state.config_db.delete_escalation_policy(&ctx.tenant_id, &id)? {
        return Err(AppError::not_found_or_forbidden());
    }
    Ok(StatusCode::NO_CONTENT)
}
