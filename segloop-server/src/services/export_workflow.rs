//! Export of inference results to the annotation platform
//!
//! Each result volume becomes one platform task: the original slices are
//! uploaded as task data and the predicted labels as COCO annotations, so
//! annotators start from the model's segmentation.

use segloop_common::db::ExportedTask;
use segloop_common::{time, DatasetDescriptor, DatasetRegistry, Error, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zip::write::SimpleFileOptions;

use crate::convert::slices::{list_png_files, slice_file_name};
use crate::convert::volume::read_label_volume;
use crate::convert::encode_volume;
use crate::db;
use crate::services::cvat_client::{AnnotationPlatform, NewTask, PlatformSession, TaskLabel};
use crate::workspace::{NiftiId, Workspace};

/// Per-volume outcome; failures sit next to successes
#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub nifti_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExportResult {
    fn failed(nifti_id: &str, err: &Error) -> Self {
        Self {
            nifti_id: nifti_id.to_string(),
            status: "error",
            task_id: None,
            task_name: None,
            redirect_url: None,
            error: Some(err.to_string()),
        }
    }
}

/// Dataset a case was registered under, falling back to its upload's and
/// then to the default
pub async fn dataset_for_case<'r>(
    pool: &SqlitePool,
    registry: &'r DatasetRegistry,
    job_id: &str,
    case_name: &str,
) -> Result<&'r DatasetDescriptor> {
    let channels = db::cases::channels_for_case(pool, job_id, case_name).await?;
    if let Some(first) = channels.first() {
        return registry.get(&first.dataset_id);
    }
    match db::jobs::get_upload(pool, job_id).await? {
        Some(upload) => registry.get(&upload.dataset_id),
        None => Ok(registry.default_dataset()),
    }
}

/// Directory of the original slices shown for a case
pub async fn original_png_dir(pool: &SqlitePool, ws: &Workspace, id: &NiftiId) -> Result<PathBuf> {
    let channels = db::cases::channels_for_case(pool, &id.job_id, &id.case_name).await?;
    let registered = channels
        .iter()
        .filter_map(|c| c.png_dir.as_deref())
        .map(PathBuf::from);

    let plain = ws.upload_png_dir(&id.job_id, &id.case_name);
    let suffixed = ws.upload_png_dir(&id.job_id, &format!("{}_0000", id.case_name));

    registered
        .chain([plain.clone(), suffixed])
        .find(|p| p.is_dir())
        .ok_or_else(|| Error::NotFound(format!("Original slices not found: {}", plain.display())))
}

/// Store PNG slices uncompressed in a ZIP held in memory, named
/// `slice_NNNN.png` in sorted order to match the encoded annotations
pub fn zip_slices(png_dir: &Path) -> Result<Vec<u8>> {
    let files = list_png_files(png_dir)?;
    if files.is_empty() {
        return Err(Error::NotFound(format!("No PNG slices in {}", png_dir.display())));
    }

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (i, file) in files.iter().enumerate() {
        writer.start_file(slice_file_name(i), options).map_err(zip_error)?;
        writer.write_all(&std::fs::read(file)?)?;
    }
    let cursor = writer.finish().map_err(zip_error)?;
    Ok(cursor.into_inner())
}

fn zip_error(e: zip::result::ZipError) -> Error {
    Error::Internal(format!("Failed to build slice archive: {}", e))
}

fn task_labels(descriptor: &DatasetDescriptor) -> Vec<TaskLabel> {
    descriptor
        .labels
        .iter()
        .map(|l| TaskLabel {
            name: l.name.clone(),
            color: l.color.clone(),
            attributes: Vec::new(),
        })
        .collect()
}

/// Authenticate once, then export every volume.
///
/// Rejected credentials abort the whole batch.
pub async fn upload_tasks(
    pool: &SqlitePool,
    ws: &Workspace,
    registry: &DatasetRegistry,
    platform: &dyn AnnotationPlatform,
    username: &str,
    password: &str,
    nifti_ids: &[String],
) -> Result<Vec<ExportResult>> {
    let session = platform.login(username, password).await?;

    let mut results = Vec::with_capacity(nifti_ids.len());
    for nifti_id in nifti_ids {
        match export_one(pool, ws, registry, platform, &session, nifti_id).await {
            Ok(result) => results.push(result),
            Err(e) => {
                warn!(nifti_id = %nifti_id, "Export failed: {}", e);
                results.push(ExportResult::failed(nifti_id, &e));
            }
        }
    }
    Ok(results)
}

async fn export_one(
    pool: &SqlitePool,
    ws: &Workspace,
    registry: &DatasetRegistry,
    platform: &dyn AnnotationPlatform,
    session: &PlatformSession,
    nifti_id: &str,
) -> Result<ExportResult> {
    let id = NiftiId::parse(nifti_id)?;
    let descriptor = dataset_for_case(pool, registry, &id.job_id, &id.case_name).await?;

    let result_path = ws.result_niftis_dir().join(id.file_name());
    if !result_path.is_file() {
        return Err(Error::NotFound(format!("Result volume not found: {}", result_path.display())));
    }
    let png_dir = original_png_dir(pool, ws, &id).await?;

    // Everything local is prepared before a remote task exists
    let (archive, coco_json) = {
        let descriptor = descriptor.clone();
        tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, Vec<u8>)> {
            let archive = zip_slices(&png_dir)?;
            let volume = read_label_volume(&result_path)?;
            let document = encode_volume(volume.view(), &descriptor)?;
            Ok((archive, serde_json::to_vec(&document)?))
        })
        .await
        .map_err(|e| Error::Internal(format!("Export preparation failed: {}", e)))??
    };

    let task_name = format!("Medical Scan - {}", id.case_name);
    let task = platform
        .create_task(
            session,
            &NewTask {
                name: task_name.clone(),
                labels: task_labels(descriptor),
            },
        )
        .await?;

    platform
        .upload_task_data(session, task.id, &format!("{}.zip", id.case_name), archive)
        .await?;

    let coco_path = ws.coco_annotation_path(task.id);
    if let Some(parent) = coco_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&coco_path, &coco_json)?;
    platform.upload_annotations(session, task.id, coco_json).await?;

    db::tasks::save_task(
        pool,
        &ExportedTask {
            task_id: task.id,
            task_name: task_name.clone(),
            nifti_id: id.file_name(),
            job_id: id.job_id.clone(),
            case_name: id.case_name.clone(),
            dataset_id: descriptor.id.clone(),
            created_at: time::now_ms(),
            inserted_case_id: None,
            inserted_at: None,
        },
    )
    .await?;

    info!(nifti_id, task_id = task.id, dataset = %descriptor.id, "Exported result to annotation task");

    Ok(ExportResult {
        nifti_id: nifti_id.to_string(),
        status: "success",
        task_id: Some(task.id),
        task_name: Some(task_name),
        redirect_url: Some(platform.task_url(task.id)),
        error: None,
    })
}
