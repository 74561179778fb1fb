//! Inference runs
//!
//! A run feeds a job's staged input directory to `nnUNetv2_predict`, keeps
//! each predicted volume as `results/niftis/<job>_<file>` and renders it as
//! overlay slices under `results/pngs/<job>_<case>`. The job store follows
//! the run: pending, processing, then completed or failed.

use segloop_common::db::JobStatus;
use segloop_common::{DatasetRegistry, Error, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::convert::volume::{is_nifti_name, read_intensity_volume, strip_nifti_ext};
use crate::convert::{volume_to_png_dir, SliceStyle};
use crate::db;
use crate::services::nnunet::{Nnunet, PredictConfig};
use crate::services::tool_runner::ToolRunner;
use crate::workspace::Workspace;

/// A validated run, recorded as pending in the job store
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub job_id: String,
    pub config: PredictConfig,
    pub dataset_id: String,
    pub input_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceOutcome {
    pub job_id: String,
    pub config: String,
    pub dataset: String,
    pub result_files: Vec<String>,
    pub png_dirs: Vec<String>,
    pub niftis_dir: String,
    pub pngs_dir: String,
    /// Tool stdout
    pub log: String,
}

/// Check the job's input exists, settle its dataset and record it as pending
pub async fn prepare(
    pool: &SqlitePool,
    ws: &Workspace,
    registry: &DatasetRegistry,
    job_id: &str,
    config: PredictConfig,
    dataset: Option<&str>,
    username: Option<&str>,
) -> Result<PreparedRun> {
    let input_dir = ws.inference_input_dir(job_id);
    if !input_dir.is_dir() {
        return Err(Error::NotFound(format!(
            "Inference directory not found for job {}: {}",
            job_id,
            input_dir.display()
        )));
    }

    let dataset_id = match dataset.filter(|d| !d.is_empty()) {
        Some(id) => registry.get(id)?.id.clone(),
        None => match db::jobs::get_upload(pool, job_id).await? {
            Some(upload) => registry.get(&upload.dataset_id)?.id.clone(),
            None => {
                let channels = db::cases::channels_for_job(pool, job_id).await?;
                registry
                    .resolve(None, channels.iter().map(|c| c.case_name.as_str()))?
                    .id
                    .clone()
            }
        },
    };

    db::jobs::create_inference_job(pool, job_id, username, config.as_str(), &dataset_id).await?;

    Ok(PreparedRun {
        job_id: job_id.to_string(),
        config,
        dataset_id,
        input_dir,
    })
}

/// Run a prepared job to completion, keeping the job store in step
pub async fn execute(
    pool: &SqlitePool,
    ws: &Workspace,
    nnunet: &Nnunet,
    runner: &dyn ToolRunner,
    run: &PreparedRun,
) -> Result<InferenceOutcome> {
    db::jobs::update_inference_status(pool, &run.job_id, JobStatus::Processing, None).await?;

    let tmp_dir = ws.result_tmp_dir(&run.job_id);
    let result = predict_and_store(ws, nnunet, runner, run, &tmp_dir).await;

    if tmp_dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(&tmp_dir) {
            warn!(job_id = %run.job_id, "Failed to remove {}: {}", tmp_dir.display(), e);
        }
    }

    match &result {
        Ok(outcome) => {
            db::jobs::update_inference_status(pool, &run.job_id, JobStatus::Completed, None).await?;
            info!(
                job_id = %run.job_id,
                results = outcome.result_files.len(),
                "Inference completed"
            );
        }
        Err(e) => {
            error!(job_id = %run.job_id, "Inference failed: {}", e);
            db::jobs::update_inference_status(pool, &run.job_id, JobStatus::Failed, Some(&e.to_string()))
                .await?;
        }
    }
    result
}

async fn predict_and_store(
    ws: &Workspace,
    nnunet: &Nnunet,
    runner: &dyn ToolRunner,
    run: &PreparedRun,
    tmp_dir: &Path,
) -> Result<InferenceOutcome> {
    let output = nnunet
        .predict(runner, &run.input_dir, tmp_dir, &run.dataset_id, run.config)
        .await?;

    let ws_owned = ws.clone();
    let job_id = run.job_id.clone();
    let tmp = tmp_dir.to_path_buf();
    let (result_files, png_dirs) =
        tokio::task::spawn_blocking(move || store_results(&ws_owned, &job_id, &tmp))
        .await
        .map_err(|e| Error::Internal(format!("Result processing task failed: {}", e)))??;

    if result_files.is_empty() {
        return Err(Error::external(
            "nnU-Net",
            format!("prediction produced no volumes for job {}", run.job_id),
        ));
    }

    Ok(InferenceOutcome {
        job_id: run.job_id.clone(),
        config: run.config.as_str().to_string(),
        dataset: run.dataset_id.clone(),
        result_files,
        png_dirs,
        niftis_dir: ws.result_niftis_dir().display().to_string(),
        pngs_dir: ws.result_pngs_dir().display().to_string(),
        log: output.stdout,
    })
}

/// Copy predicted volumes out of the temporary directory and render them
fn store_results(ws: &Workspace, job_id: &str, tmp_dir: &Path) -> Result<(Vec<String>, Vec<String>)> {
    let niftis_dir = ws.result_niftis_dir();
    std::fs::create_dir_all(&niftis_dir)?;

    let mut names: Vec<String> = std::fs::read_dir(tmp_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|n| is_nifti_name(n))
        .collect();
    names.sort();

    let mut result_files = Vec::new();
    let mut png_dirs = Vec::new();
    for name in names {
        let src = tmp_dir.join(&name);
        let dest = niftis_dir.join(format!("{}_{}", job_id, name));
        std::fs::copy(&src, &dest)?;

        let case_name = strip_nifti_ext(&name);
        let png_dir = ws.result_png_dir(job_id, case_name);
        let volume = read_intensity_volume(&src)?;
        volume_to_png_dir(&volume, &png_dir, SliceStyle::overlay())?;

        result_files.push(dest.display().to_string());
        png_dirs.push(png_dir.display().to_string());
    }
    Ok((result_files, png_dirs))
}
