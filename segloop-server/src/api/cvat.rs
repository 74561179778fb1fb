//! Annotation platform endpoints: export, import, listing, discard

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::services::dataset_insert::display_name;
use crate::services::discard::discard_files;
use crate::services::export_workflow::upload_tasks;
use crate::services::import_workflow::{send_to_dataset, ImportTarget};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct UploadTasksRequest {
    #[serde(default)]
    pub nifti_ids: Vec<String>,
    #[serde(default)]
    pub cvat_username: String,
    #[serde(default)]
    pub cvat_password: String,
}

/// POST /cvat/upload_tasks
pub async fn upload_tasks_handler(
    State(state): State<AppState>,
    Json(request): Json<UploadTasksRequest>,
) -> ApiResult<Json<Value>> {
    if request.nifti_ids.is_empty() {
        return Err(ApiError::BadRequest("No NIfTI files selected.".to_string()));
    }
    if request.cvat_username.is_empty() || request.cvat_password.is_empty() {
        return Err(ApiError::BadRequest("CVAT credentials are required.".to_string()));
    }

    let results = upload_tasks(
        &state.db,
        &state.workspace,
        &state.registry,
        state.platform.as_ref(),
        &request.cvat_username,
        &request.cvat_password,
        &request.nifti_ids,
    )
    .await?;

    Ok(Json(json!({ "success": true, "results": results })))
}

#[derive(Debug, Deserialize)]
pub struct SendToDatasetRequest {
    #[serde(default)]
    pub task_ids: Vec<Value>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub dataset: Option<String>,
}

/// Task ids arrive as numbers or numeric strings
fn parse_task_ids(raw: &[Value]) -> ApiResult<Vec<i64>> {
    raw.iter()
        .map(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid task id: {}", v))))
        .collect()
}

/// POST /cvat/send-to-dataset
pub async fn send_to_dataset_handler(
    State(state): State<AppState>,
    Json(request): Json<SendToDatasetRequest>,
) -> ApiResult<Json<Value>> {
    let task_ids = parse_task_ids(&request.task_ids)?;
    let raw_dir = state.nnunet.raw_dir();

    let results = send_to_dataset(
        &state.db,
        &state.workspace,
        &state.registry,
        state.platform.as_ref(),
        ImportTarget {
            raw_dir: &raw_dir,
            poll: state.poll_policy(),
            dataset: request.dataset.as_deref(),
        },
        &task_ids,
        &request.username,
        &request.password,
    )
    .await?;

    Ok(Json(json!({ "success": true, "results": results })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectedTask {
    pub task_id: i64,
    pub task_name: String,
    pub nifti_id: String,
    pub job_id: String,
    pub case_name: String,
    pub dataset_id: String,
    pub display_name: String,
    pub created_at: i64,
    pub inserted_case_id: Option<String>,
}

/// GET /cvat/corrected-tasks
pub async fn corrected_tasks(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let tasks: Vec<CorrectedTask> = db::tasks::list_tasks(&state.db)
        .await?
        .into_iter()
        .map(|t| {
            let display = match state.registry.get(&t.dataset_id) {
                Ok(descriptor) => display_name(descriptor, &t.case_name),
                Err(_) => t.case_name.clone(),
            };
            CorrectedTask {
                task_id: t.task_id,
                task_name: t.task_name,
                nifti_id: t.nifti_id,
                job_id: t.job_id,
                case_name: t.case_name,
                dataset_id: t.dataset_id,
                display_name: display,
                created_at: t.created_at,
                inserted_case_id: t.inserted_case_id,
            }
        })
        .collect();

    Ok(Json(json!({ "success": true, "tasks": tasks })))
}

#[derive(Debug, Deserialize)]
pub struct DiscardRequest {
    #[serde(default)]
    pub nifti_ids: Vec<String>,
}

/// POST /cvat/discard_files
pub async fn discard_files_handler(
    State(state): State<AppState>,
    Json(request): Json<DiscardRequest>,
) -> ApiResult<Json<Value>> {
    let report = discard_files(&state.db, &state.workspace, &request.nifti_ids).await?;
    Ok(Json(json!({
        "success": true,
        "deleted_files": report.deleted_files,
        "errors": report.errors,
    })))
}

pub fn cvat_routes() -> Router<AppState> {
    Router::new()
        .route("/cvat/upload_tasks", post(upload_tasks_handler))
        .route("/cvat/send-to-dataset", post(send_to_dataset_handler))
        .route("/cvat/corrected-tasks", get(corrected_tasks))
        .route("/cvat/discard_files", post(discard_files_handler))
}
