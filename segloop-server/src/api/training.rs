//! nnU-Net training trigger

use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::services::nnunet::{Fold, TrainResolution, DEFAULT_TRAINER};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TrainRequest {
    #[serde(default)]
    pub dataset_id: Value,
    pub resolution: Option<String>,
    pub folds: Option<Value>,
    pub trainer_class: Option<String>,
}

/// POST /train-nnunet
///
/// Runs plan/preprocess, then trains one fold. Blocks until both finish.
pub async fn train(State(state): State<AppState>, Json(request): Json<TrainRequest>) -> ApiResult<Json<Value>> {
    let dataset_number = request
        .dataset_id
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| ApiError::BadRequest("dataset_id (integer) is required".to_string()))?;

    let resolution: TrainResolution = request.resolution.as_deref().unwrap_or("3d_fullres").parse()?;
    let fold = match &request.folds {
        Some(v) => Fold::from_json(v)?,
        None => Fold::All,
    };
    let trainer = request
        .trainer_class
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(DEFAULT_TRAINER);

    tracing::info!(
        dataset = dataset_number,
        resolution = resolution.as_str(),
        fold = %fold,
        trainer,
        "Training requested"
    );

    if let Err(e) = state
        .nnunet
        .train(state.runner.as_ref(), dataset_number, resolution, fold, trainer)
        .await
    {
        state
            .record_error(format!("Training dataset {} failed: {}", dataset_number, e))
            .await;
        return Err(e.into());
    }

    Ok(Json(json!({
        "success": true,
        "message": format!(
            "nnU-Net V2 run for dataset {} ({}, fold {}, trainer {}) completed.",
            dataset_number,
            resolution.as_str(),
            fold,
            trainer
        ),
    })))
}

pub fn training_routes() -> Router<AppState> {
    Router::new().route("/train-nnunet", post(train))
}
