//! Import of corrected annotations back into a training dataset
//!
//! For every task: export its annotations from the platform, decode the COCO
//! document into a label volume and insert it, together with the case's raw
//! channels from the case registry, into `<raw dir>/<dataset id>/`.

use segloop_common::{DatasetRegistry, Error, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::convert::volume::write_label_volume;
use crate::convert::{decode_document, document_from_export};
use crate::db;
use crate::services::cvat_client::{AnnotationPlatform, PlatformSession};
use crate::services::dataset_insert;
use crate::services::poller::PollPolicy;
use crate::workspace::Workspace;

/// Per-task outcome
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImportResult {
    Success {
        task_id: i64,
        new_case_id: String,
        dataset_type: String,
    },
    Error {
        task_id: i64,
        error: String,
    },
}

/// Where and how corrected cases are imported
pub struct ImportTarget<'a> {
    pub raw_dir: &'a Path,
    pub poll: PollPolicy,
    /// Overrides the dataset each task was exported under
    pub dataset: Option<&'a str>,
}

/// Authenticate once and import every task.
///
/// Bad input, rejected credentials and a missing raw-upload folder abort
/// the batch before any task is touched.
#[allow(clippy::too_many_arguments)]
pub async fn send_to_dataset(
    pool: &SqlitePool,
    ws: &Workspace,
    registry: &DatasetRegistry,
    platform: &dyn AnnotationPlatform,
    target: ImportTarget<'_>,
    task_ids: &[i64],
    username: &str,
    password: &str,
) -> Result<Vec<ImportResult>> {
    if task_ids.is_empty() {
        return Err(Error::InvalidInput("No task IDs provided.".to_string()));
    }
    if username.is_empty() || password.is_empty() {
        return Err(Error::InvalidInput("CVAT credentials are required.".to_string()));
    }
    if let Some(id) = target.dataset.filter(|d| !d.is_empty()) {
        registry.get(id)?;
    }

    let session = platform.login(username, password).await?;

    let raw_uploads = ws.upload_niftis_dir();
    if !raw_uploads.is_dir() {
        return Err(Error::Internal(format!(
            "Raw images folder not found at {}",
            raw_uploads.display()
        )));
    }

    let mut results = Vec::with_capacity(task_ids.len());
    for &task_id in task_ids {
        match import_one(pool, ws, registry, platform, &session, &target, task_id).await {
            Ok((new_case_id, dataset_type)) => results.push(ImportResult::Success {
                task_id,
                new_case_id,
                dataset_type,
            }),
            Err(e) => {
                warn!(task_id, "Import failed: {}", e);
                results.push(ImportResult::Error {
                    task_id,
                    error: e.to_string(),
                });
            }
        }
    }
    Ok(results)
}

async fn import_one(
    pool: &SqlitePool,
    ws: &Workspace,
    registry: &DatasetRegistry,
    platform: &dyn AnnotationPlatform,
    session: &PlatformSession,
    target: &ImportTarget<'_>,
    task_id: i64,
) -> Result<(String, String)> {
    platform.get_task(session, task_id).await?;

    let record = db::tasks::get_task(pool, task_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Task {} was not exported from this server", task_id)))?;

    let dataset_id = target
        .dataset
        .filter(|d| !d.is_empty())
        .unwrap_or(&record.dataset_id);
    let descriptor = registry.get(dataset_id)?.clone();

    let exported = platform.export_annotations(session, task_id, target.poll).await?;

    let channels = db::cases::channels_for_case(pool, &record.job_id, &record.case_name).await?;
    let dataset_dir = dataset_dir(target.raw_dir, &descriptor.id);
    let label_path = ws.corrected_volume_path(task_id);
    let source_case = record.case_name.clone();

    let case_id = tokio::task::spawn_blocking(move || -> Result<String> {
        let document = document_from_export(&exported)?;
        let volume = decode_document(&document)?;
        write_label_volume(&label_path, &volume)?;
        dataset_insert::insert_case(&dataset_dir, &descriptor, &source_case, &label_path, &channels)
    })
    .await
    .map_err(|e| Error::Internal(format!("Import task failed: {}", e)))??;

    db::tasks::mark_inserted(pool, task_id, &case_id).await?;
    info!(task_id, case_id = %case_id, dataset = %dataset_id, "Corrected case inserted");

    Ok((case_id, dataset_id.to_string()))
}

/// Dataset directory a case id ends up in
pub fn dataset_dir(raw_dir: &Path, dataset_id: &str) -> PathBuf {
    raw_dir.join(dataset_id)
}
