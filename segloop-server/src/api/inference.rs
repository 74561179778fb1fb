//! Upload, inference and result browsing endpoints

use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::convert::slices::list_png_files;
use crate::convert::volume::is_nifti_name;
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::services::export_workflow::original_png_dir;
use crate::services::ingest::{ingest_upload, IngestSummary, UploadRequest};
use crate::services::inference::{self, InferenceOutcome};
use crate::services::nnunet::PredictConfig;
use crate::workspace::{job_id_from_filename, sanitize_case_name, NiftiId};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    #[serde(flatten)]
    pub summary: IngestSummary,
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::BadRequest(format!("Malformed upload: {}", e))
}

/// File part of an upload, already written to disk
struct ReceivedFile {
    original_name: String,
    stored_path: std::path::PathBuf,
}

async fn receive_file(
    state: &AppState,
    mut field: axum::extract::multipart::Field<'_>,
) -> ApiResult<ReceivedFile> {
    let original_name = field
        .file_name()
        .map(str::to_string)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Uploaded file has no name".to_string()))?;

    let stored_path = state
        .workspace
        .archives_dir()
        .join(format!("{}-{}", Uuid::new_v4(), sanitize_case_name(&original_name)));
    let limit = state.config.max_upload_bytes;

    let mut file = tokio::fs::File::create(&stored_path).await?;
    let mut written: u64 = 0;
    let result: ApiResult<()> = async {
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            written += chunk.len() as u64;
            if written > limit {
                return Err(ApiError::BadRequest(format!(
                    "Upload exceeds the {} byte limit",
                    limit
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&stored_path).await;
        return Err(e);
    }
    Ok(ReceivedFile {
        original_name,
        stored_path,
    })
}

/// POST /inference/upload
///
/// Multipart fields: `file` (ZIP or NIfTI), `config`, `username`, `dataset`.
pub async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> ApiResult<Json<UploadResponse>> {
    let mut received: Option<ReceivedFile> = None;
    let mut config: Option<String> = None;
    let mut username: Option<String> = None;
    let mut dataset: Option<String> = None;

    let parsed: ApiResult<()> = async {
        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => received = Some(receive_file(&state, field).await?),
                "config" => config = Some(field.text().await.map_err(multipart_error)?),
                "username" => username = Some(field.text().await.map_err(multipart_error)?),
                "dataset" => dataset = Some(field.text().await.map_err(multipart_error)?),
                _ => {}
            }
        }
        Ok(())
    }
    .await;

    if let Err(e) = parsed {
        if let Some(r) = &received {
            let _ = std::fs::remove_file(&r.stored_path);
        }
        return Err(e);
    }
    let Some(file) = received else {
        return Err(ApiError::BadRequest("No file part".to_string()));
    };

    let prepared = (|| -> ApiResult<(String, PredictConfig)> {
        let job_id = job_id_from_filename(&file.original_name)?;
        let config = match config.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(c) => c.parse::<PredictConfig>()?,
            None => PredictConfig::default(),
        };
        Ok((job_id, config))
    })();
    let (job_id, config) = match prepared {
        Ok(v) => v,
        Err(e) => {
            let _ = std::fs::remove_file(&file.stored_path);
            return Err(e);
        }
    };

    tracing::info!(job_id = %job_id, file = %file.original_name, "Upload received");

    let summary = ingest_upload(
        &state.db,
        &state.workspace,
        &state.registry,
        state.config.max_upload_bytes,
        UploadRequest {
            job_id,
            original_name: file.original_name,
            stored_path: file.stored_path,
            config,
            username: username.filter(|u| !u.is_empty()),
            dataset: dataset.filter(|d| !d.is_empty()),
        },
    )
    .await?;

    Ok(Json(UploadResponse {
        success: true,
        summary,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub job_id: String,
    pub config: Option<String>,
    pub dataset: Option<String>,
    pub username: Option<String>,
    /// Return immediately and run in the background
    #[serde(default)]
    pub background: bool,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub success: bool,
    #[serde(flatten)]
    pub outcome: InferenceOutcome,
}

/// POST /inference/run
pub async fn run(State(state): State<AppState>, Json(request): Json<RunRequest>) -> ApiResult<Response> {
    if request.job_id.trim().is_empty() {
        return Err(ApiError::BadRequest("Missing parameters: job_id".to_string()));
    }
    let config: PredictConfig = match request.config.as_deref() {
        Some(c) => c.parse::<PredictConfig>()?,
        None => PredictConfig::default(),
    };

    let prepared = inference::prepare(
        &state.db,
        &state.workspace,
        &state.registry,
        request.job_id.trim(),
        config,
        request.dataset.as_deref(),
        request.username.as_deref(),
    )
    .await?;

    if request.background {
        let job_id = prepared.job_id.clone();
        let dataset = prepared.dataset_id.clone();
        let task_state = state.clone();
        tokio::spawn(async move {
            tracing::info!(job_id = %prepared.job_id, "Background inference started");
            let result = inference::execute(
                &task_state.db,
                &task_state.workspace,
                &task_state.nnunet,
                task_state.runner.as_ref(),
                &prepared,
            )
            .await;
            if let Err(e) = result {
                task_state
                    .record_error(format!("Inference {} failed: {}", prepared.job_id, e))
                    .await;
            }
        });

        let body = json!({
            "success": true,
            "job_id": job_id,
            "dataset": dataset,
            "status": "pending",
            "status_url": format!("/inference/status/{}", job_id),
        });
        return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
    }

    let outcome = inference::execute(
        &state.db,
        &state.workspace,
        &state.nnunet,
        state.runner.as_ref(),
        &prepared,
    )
    .await;

    match outcome {
        Ok(outcome) => Ok(Json(RunResponse { success: true, outcome }).into_response()),
        Err(e) => {
            state
                .record_error(format!("Inference {} failed: {}", prepared.job_id, e))
                .await;
            Err(e.into())
        }
    }
}

/// GET /inference/status/{job_id}
pub async fn status(State(state): State<AppState>, Path(job_id): Path<String>) -> ApiResult<Json<Value>> {
    let job = db::jobs::get_inference_job(&state.db, &job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Inference job {}", job_id)))?;
    Ok(Json(json!({ "success": true, "job": job })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NiftiFile {
    pub id: String,
    pub filename: String,
    pub job_id: String,
}

/// GET /inference/nifti_files
pub async fn nifti_files(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let dir = state.workspace.result_niftis_dir();
    if !dir.is_dir() {
        return Err(ApiError::NotFound(format!("NIfTI directory not found: {}", dir.display())));
    }

    let mut files: Vec<NiftiFile> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| is_nifti_name(name))
        .map(|name| NiftiFile {
            job_id: name
                .split_once('_')
                .map(|(job, _)| job.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            id: name.clone(),
            filename: name,
        })
        .collect();
    files.sort_by(|a, b| a.filename.cmp(&b.filename));

    Ok(Json(json!({ "success": true, "nifti_files": files })))
}

#[derive(Debug, Deserialize)]
pub struct ComparisonQuery {
    pub nifti_id: Option<String>,
    pub job_id: Option<String>,
}

fn slice_urls(state: &AppState, dir: &std::path::Path) -> ApiResult<Vec<String>> {
    let endpoint = format!("{}/inference/slice_image", state.public_base_url());
    list_png_files(dir)?
        .iter()
        .map(|file| {
            let relative = state.workspace.relative(file).display().to_string();
            reqwest::Url::parse_with_params(&endpoint, &[("path", relative)])
                .map(String::from)
                .map_err(|e| ApiError::Config(format!("Bad public base URL {}: {}", endpoint, e)))
        })
        .collect()
}

/// GET /inference/comparison_slices?nifti_id=..&job_id=..
pub async fn comparison_slices(
    State(state): State<AppState>,
    Query(query): Query<ComparisonQuery>,
) -> ApiResult<Json<Value>> {
    let (Some(nifti_id), Some(job_id)) = (
        query.nifti_id.filter(|s| !s.is_empty()),
        query.job_id.filter(|s| !s.is_empty()),
    ) else {
        return Err(ApiError::BadRequest("Missing parameters: nifti_id and job_id".to_string()));
    };

    let parsed = NiftiId::parse(&nifti_id)?;
    let id = NiftiId {
        job_id,
        case_name: parsed.case_name,
    };

    let original = original_png_dir(&state.db, &state.workspace, &id).await?;
    let result = state.workspace.result_png_dir(&id.job_id, &id.case_name);
    if !result.is_dir() {
        return Err(ApiError::NotFound(format!("Result folder not found: {}", result.display())));
    }

    Ok(Json(json!({
        "success": true,
        "original_slices": slice_urls(&state, &original)?,
        "result_slices": slice_urls(&state, &result)?,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SliceQuery {
    pub path: Option<String>,
}

/// GET /inference/slice_image?path=..
///
/// Only PNG files inside the workspace are served.
pub async fn slice_image(State(state): State<AppState>, Query(query): Query<SliceQuery>) -> ApiResult<Response> {
    let requested = query
        .path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Image path not provided".to_string()))?;

    let path = state.workspace.confine(&requested)?;
    let is_png = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("png"));
    if !is_png || !path.is_file() {
        return Err(ApiError::BadRequest(format!("Not a PNG slice: {}", requested)));
    }

    let bytes = tokio::fs::read(&path).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], Body::from(bytes)).into_response())
}

pub fn inference_routes() -> Router<AppState> {
    Router::new()
        .route("/inference/upload", post(upload))
        .route("/inference/run", post(run))
        .route("/inference/status/:job_id", get(status))
        .route("/inference/nifti_files", get(nifti_files))
        .route("/inference/comparison_slices", get(comparison_slices))
        .route("/inference/slice_image", get(slice_image))
}
