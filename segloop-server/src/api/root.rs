//! Liveness banner

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};

use crate::AppState;

/// GET /
pub async fn index() -> Json<Value> {
    Json(json!({ "status": "segloop backend is running" }))
}

pub fn root_routes() -> Router<AppState> {
    Router::new().route("/", get(index))
}
