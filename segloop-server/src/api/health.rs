//! Liveness and diagnostics

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when the database does not answer
    pub status: &'static str,
    pub module: &'static str,
    pub version: &'static str,
    pub git_hash: &'static str,
    pub uptime_seconds: u64,
    pub database: &'static str,
    pub open_sessions: usize,
    /// Whether the nnU-Net raw dataset root exists
    pub nnunet_raw_present: bool,
    /// Most recent workflow failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database_ok = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();
    if !database_ok {
        tracing::warn!("Health check: database did not answer");
    }

    Json(HealthResponse {
        status: if database_ok { "ok" } else { "degraded" },
        module: "segloop-server",
        version: env!("CARGO_PKG_VERSION"),
        git_hash: env!("GIT_HASH"),
        uptime_seconds: (Utc::now() - state.startup_time).num_seconds().max(0) as u64,
        database: if database_ok { "ok" } else { "unavailable" },
        open_sessions: state.sessions.read().await.len(),
        nnunet_raw_present: state.nnunet.raw_dir().is_dir(),
        last_error: state.last_error.read().await.clone(),
    })
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
