//! Login, current user and logout
//!
//! Credentials are checked against the annotation platform. A successful
//! login opens a server-side session whose token the client sends back as
//! `Authorization: Bearer <session_token>`. Sessions idle for more than
//! `SESSION_IDLE_HOURS` hours are dropped.

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::{prune_expired_sessions, AppState, UserSession};
use segloop_common::db::User;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    /// Platform token
    pub token: String,
    pub session_token: String,
    pub username: String,
    pub is_new_user: bool,
    pub user: User,
}

fn bearer_token(headers: &HeaderMap) -> ApiResult<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))
}

/// POST /auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let username = request.username.trim();
    if username.is_empty() || request.password.is_empty() {
        return Err(ApiError::BadRequest("Username and password are required".to_string()));
    }

    let platform_session = state.platform.login(username, &request.password).await?;
    let (user, is_new_user) = db::users::record_login(&state.db, username).await?;

    let session_token = Uuid::new_v4().to_string();
    {
        let now = Utc::now();
        let mut sessions = state.sessions.write().await;
        let expired = prune_expired_sessions(&mut sessions, now);
        if expired > 0 {
            tracing::debug!(expired, "Dropped idle sessions");
        }
        sessions.insert(
            session_token.clone(),
            UserSession::new(user.username.clone(), platform_session.clone(), now),
        );
    }

    tracing::info!(username = %user.username, is_new_user, "User logged in");

    Ok(Json(LoginResponse {
        success: true,
        token: platform_session.token,
        session_token,
        username: user.username.clone(),
        is_new_user,
        user,
    }))
}

/// GET /auth/user
pub async fn current_user(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let token = bearer_token(&headers)?;
    let username = {
        let now = Utc::now();
        let mut sessions = state.sessions.write().await;
        match sessions.get_mut(token) {
            Some(session) if !session.is_expired(now) => {
                session.last_seen = now;
                session.username.clone()
            }
            Some(_) => {
                sessions.remove(token);
                return Err(ApiError::Unauthorized("Session expired".to_string()));
            }
            None => return Err(ApiError::Unauthorized("Unknown or expired session".to_string())),
        }
    };

    let user = db::users::find_user(&state.db, &username)
        .await?
        .ok_or_else(|| ApiError::Unauthorized(format!("User {} no longer exists", username)))?;

    Ok(Json(json!({ "authenticated": true, "user": user })))
}

/// POST /auth/logout
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let token = bearer_token(&headers)?;
    let removed = state.sessions.write().await.remove(token);

    match removed {
        Some(session) => {
            tracing::info!(username = %session.username, "User logged out");
            Ok(Json(json!({ "success": true })))
        }
        None => Err(ApiError::Unauthorized("Unknown or expired session".to_string())),
    }
}

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/user", get(current_user))
        .route("/auth/logout", post(logout))
}
