use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::auth::context::TenantContext;
use crate::auth::guard::RequireTenantAdmin;
use crate::error::{AppError, AppResult};

const CHANNEL_TYPES: &[&str] = &["email", "sms", "webhook"];

#[derive(Debug, Deserialize)]
pub struct CreateChannelRequest {
    pub name: String,
    pub channel_type: String,
    pub config: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ChannelResponse {
    pub id: String,
    pub name: String,
    pub channel_type: String,
    pub config: serde_json::Value,
}

pub async fn list_channels(
    State(state): State<AppState>,
    ctx: TenantContext,
) -> AppResult<impl IntoResponse> {
    let channels = state.config_db.list_channels(&ctx.tenant_id)?;
    let responses: Vec<ChannelResponse> = channels
        .into_iter()
        .map(|(id, name, channel_type, config)| ChannelResponse {
            id,
            name,
            channel_type,
            config: serde_json::from_str(&config).unwrap_or(serde_json::json!({})),
        })
        .collect();
    Ok(Json(responses))
}

pub async fn create_channel(
    State(state): State<AppState>,
    RequireTenantAdmin(ctx): RequireTenantAdmin,
    Json(req): Json<CreateChannelRequest>,
) -> AppResult<impl IntoResponse> {
    if !CHANNEL_TYPES.contains(&req.channel_type.as_str()) {
        return Err(AppError::Validation(format!("unknown channel type {:?}", req.channel_type)));
    }
    // Webhook URLs are screened at delivery time too, but rejecting a
    // blocked target here gives the operator the error while they can
    // still see it.
    if req.channel_type == "webhook" {
        let url = req
            .config
            .get("url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| AppError::Validation("webhook channel config needs a url".into()))?;
        crate::notify::webhook::check_target(url)
            .await
            .map_err(|e| AppError::Validation(format!("webhook target rejected: {e}")))?;
    }

    let id = uuid::Uuid::new_v4().to_string();
    state.config_db.create_channel(
        &id,
        &ctx.tenant_id,
        &req.name,
        &req.channel_type,
        &req.config.to_string(),
    )?;
    Ok((
        StatusCode::CREATED,
        Json(ChannelResponse {
            id,
            name: req.name,
            channel_type: req.channel_type,
            config: req.config,
        }),
    ))
}

pub async fn delete_channel(
    State(state): State<AppState>,
    RequireTenantAdmin(ctx): RequireTenantAdmin,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    if !state.config_db.delete_channel(&ctx.tenant_id, &id)? {
        return Err(AppError::not_found_or_forbidden());
    }
    Ok(StatusCode::NO_CONTENT)
}
