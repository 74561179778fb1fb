//! Removal of a result and everything derived from its upload

use segloop_common::{Error, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::db;
use crate::workspace::{NiftiId, Workspace};

#[derive(Debug, Clone, Serialize)]
pub struct DiscardFailure {
    pub nifti_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscardReport {
    pub deleted_files: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<DiscardFailure>,
}

fn remove_path(path: &Path, deleted: &mut Vec<String>) -> Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else if path.is_file() {
        std::fs::remove_file(path)?;
    } else {
        return Ok(());
    }
    debug!(path = %path.display(), "Deleted");
    deleted.push(path.display().to_string());
    Ok(())
}

async fn discard_one(pool: &SqlitePool, ws: &Workspace, nifti_id: &str, deleted: &mut Vec<String>) -> Result<()> {
    let id = NiftiId::parse(nifti_id)?;
    let channels = db::cases::channels_for_case(pool, &id.job_id, &id.case_name).await?;

    let suffixed = format!("{}_0000", id.case_name);
    let mut targets: Vec<PathBuf> = vec![
        ws.result_niftis_dir().join(id.file_name()),
        ws.result_png_dir(&id.job_id, &id.case_name),
        ws.upload_png_dir(&id.job_id, &id.case_name),
        ws.upload_png_dir(&id.job_id, &suffixed),
        ws.upload_niftis_dir().join(id.file_name()),
        ws.upload_niftis_dir().join(format!("{}_{}.nii.gz", id.job_id, suffixed)),
    ];
    for c in &channels {
        targets.push(PathBuf::from(&c.raw_path));
        targets.push(
            ws.upload_niftis_dir()
                .join(format!("{}_{}_{:04}.nii.gz", id.job_id, id.case_name, c.channel)),
        );
        if let Some(dir) = &c.png_dir {
            targets.push(PathBuf::from(dir));
        }
    }

    let before = deleted.len();
    for target in &targets {
        remove_path(target, deleted)?;
    }
    let rows = db::cases::delete_case(pool, &id.job_id, &id.case_name).await?;

    if deleted.len() == before && rows == 0 {
        return Err(Error::NotFound(format!("Nothing to discard for {}", nifti_id)));
    }
    info!(nifti_id, files = deleted.len() - before, registry_rows = rows, "Discarded result");
    Ok(())
}

/// Delete result volumes, their slices, the original slices and channel
/// volumes, and the case registry rows
pub async fn discard_files(pool: &SqlitePool, ws: &Workspace, nifti_ids: &[String]) -> Result<DiscardReport> {
    if nifti_ids.is_empty() {
        return Err(Error::InvalidInput("No NIfTI ids provided".to_string()));
    }

    let mut report = DiscardReport::default();
    for nifti_id in nifti_ids {
        if let Err(e) = discard_one(pool, ws, nifti_id, &mut report.deleted_files).await {
            warn!(nifti_id = %nifti_id, "Discard failed: {}", e);
            report.errors.push(DiscardFailure {
                nifti_id: nifti_id.clone(),
                error: e.to_string(),
            });
        }
    }
    Ok(report)
}
