use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::AppState;
use crate::auth::context::TenantContext;
use crate::cache::bus;
use crate::error::{AppError, AppResult};
use crate::models::rule::{Condition, CreateRuleRequest, RuleRow, RuleScope, UpdateRuleRequest};

/// Parses and validates the condition/scope JSON once at write time so the
/// rule cache never sees a spec that doesn't compile.
fn validate_specs(condition: &serde_json::Value, scope: &serde_json::Value) -> AppResult<(String, String)> {
    let parsed: Condition = serde_json::from_value(condition.clone())
        .map_err(|e| AppError::Validation(format!("invalid condition spec: {e}")))?;
    if let Condition::Statistical { window_seconds, .. } = &parsed {
        if *window_seconds <= 0 {
            return Err(AppError::Validation("window_seconds must be positive".into()));
        }
    }
    let _: RuleScope = serde_json::from_value(scope.clone())
        .map_err(|e| AppError::Validation(format!("invalid scope spec: {e}")))?;
    Ok((condition.to_string(), scope.to_string()))
}

/// Local drop plus a bus publish so every other process drops its copy too.
async fn invalidate(state: &AppState, tenant_id: &str) {
    state.caches.invalidate_tenant_rules(tenant_id).await;
    if let Err(e) = bus::publish_rule_invalidation(&state.redis_url, tenant_id).await {
        tracing::warn!("rule cache invalidation publish failed for tenant {tenant_id}: {e}");
    }
}

pub async fn list_rules(
    State(state): State<AppState>,
    ctx: TenantContext,
) -> AppResult<impl IntoResponse> {
    let rules = state.config_db.list_rules(&ctx.tenant_id)?;
    Ok(Json(rules))
}

pub async fn create_rule(
    State(state): State<AppState>,
    ctx: TenantContext,
    Json(req): Json<CreateRuleRequest>,
) -> AppResult<impl IntoResponse> {
    if req.cooldown < 0 {
        return Err(AppError::Validation("cooldown must not be negative".into()));
    }
    if req.eval_interval <= 0 {
        return Err(AppError::Validation("eval_interval must be positive".into()));
    }
    let (condition_spec, scope_spec) = validate_specs(&req.condition, &req.scope)?;
    let now = state.clock.now().to_rfc3339();
    let rule = RuleRow {
        id: uuid::Uuid::new_v4().to_string(),
        tenant_id: ctx.tenant_id.clone(),
        name: req.name,
        condition_spec,
        action_spec: serde_json::to_string(&req.action).map_err(|e| AppError::Validation(e.to_string()))?,
        priority: req.priority,
        enabled: req.enabled,
        cooldown_seconds: req.cooldown,
        eval_interval_secs: req.eval_interval,
        scope_spec,
        last_evaluated_at: None,
        created_at: now.clone(),
        updated_at: now,
    };
    state.config_db.create_rule(&rule)?;
    invalidate(&state, &ctx.tenant_id).await;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn get_rule(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let rule = state
        .config_db
        .get_rule(&ctx.tenant_id, &id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;
    Ok(Json(rule))
}

pub async fn update_rule(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(id): Path<String>,
    Json(req): Json<UpdateRuleRequest>,
) -> AppResult<impl IntoResponse> {
    if req.cooldown < 0 {
        return Err(AppError::Validation("cooldown must not be negative".into()));
    }
    if req.eval_interval <= 0 {
        return Err(AppError::Validation("eval_interval must be positive".into()));
    }
    let (condition_spec, scope_spec) = validate_specs(&req.condition, &req.scope)?;
    let existing = state
        .config_db
        .get_rule(&ctx.tenant_id, &id)?
        .ok_or_else(AppError::not_found_or_forbidden)?;
    let updated = RuleRow {
        name: req.name,
        condition_spec,
        action_spec: serde_json::to_string(&req.action).map_err(|e| AppError::Validation(e.to_string()))?,
        priority: req.priority,
        enabled: req.enabled,
        cooldown_seconds: req.cooldown,
        eval_interval_secs: req.eval_interval,
        scope_spec,
        updated_at: state.clock.now().to_rfc3339(),
        ..existing
    };
    if !state.config_db.update_rule(&ctx.tenant_id, &id, &updated)? {
        return Err(AppError::not_found_or_forbidden());
    }
    invalidate(&state, &ctx.tenant_id).await;
    Ok(Json(updated))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    ctx: TenantContext,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    if !state.config_db.delete_rule(&ctx.tenant_id, &id)? {
        return Err(AppError::not_found_or_forbidden());
    }
    invalidate(&state, &ctx.tenant_id).await;
    Ok(StatusCode::NO_CONTENT)
}
