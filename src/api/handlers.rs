use axum::{
    extract::{Path, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::auth::Principal;
use crate::credentials::Revocation;
use crate::error::Error;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ShareLink {
    pub name: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct RevokeResult {
    pub name: String,
    pub revoked: bool,
}

#[derive(Debug, Serialize)]
pub struct UserList {
    pub users: Vec<String>,
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Client profile for the calling principal. The first call for a user
/// provisions their credential and restarts the proxy.
pub async fn connect_config(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Value>, Error> {
    let config = state
        .credentials
        .connect_config(&principal.subject, &state.server.external_ip)
        .await?;
    Ok(Json(config))
}

/// Issue a 24h grant for `name`. The credential itself is provisioned when
/// the grant is first used.
pub async fn share_link(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ShareLink>, Error> {
    if name.trim().is_empty() {
        return Err(Error::InvalidRequest("name must not be empty".into()));
    }

    let (token, expires_at) = state.tokens.issue_share_grant(&name)?;
    log::info!("AUDIT action=share user={} expires_at={}", name, expires_at);

    Ok(Json(ShareLink {
        name,
        token,
        expires_at,
    }))
}

pub async fn revoke(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RevokeResult>, Error> {
    let revoked = state.credentials.revoke(&name).await? == Revocation::Removed;
    Ok(Json(RevokeResult { name, revoked }))
}

pub async fn list_users(State(state): State<AppState>) -> Result<Json<UserList>, Error> {
    Ok(Json(UserList {
        users: state.credentials.list().await?,
    }))
}
