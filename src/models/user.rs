use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub password_verifier: String,
    pub is_system_admin: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantUser {
    pub tenant_id: String,
    pub user_id: String,
    pub role: String,
    pub is_tenant_admin: bool,
    pub joined_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantUserView {
    pub user_id: String,
    pub email: String,
    pub role: String,
    pub is_tenant_admin: bool,
    pub joined_at: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    /// Optional; a login without a tenant slug issues a system-admin-only
    /// token when the user is a system admin, otherwise the token is bound
    /// to the user's sole tenant membership if exactly one exists.
    #[serde(default)]
    pub tenant_slug: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct InviteUserRequest {
    pub email: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub is_tenant_admin: bool,
    /// Invitation acceptance is modeled inline: if the user doesn't exist
    /// yet, one is created with this password.
    pub password: String,
}

fn default_role() -> String {
    "member".to_string()
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    pub role: Option<String>,
    pub is_tenant_admin: Option<bool>,
}
