//! Upload and inference job records

use segloop_common::db::{InferenceJob, JobStatus, Upload};
use segloop_common::{time, Error, Result};
use sqlx::{Row, SqlitePool};

use super::conflict_on_duplicate;

fn status_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<JobStatus> {
    let status: String = row.get("status");
    status.parse()
}

/// Register an upload. The job id is the primary key, so a second upload
/// deriving the same id fails with `Error::Conflict`.
pub async fn insert_upload(pool: &SqlitePool, upload: &Upload) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO uploads (job_id, username, archive_name, config, dataset_id, status, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&upload.job_id)
    .bind(&upload.username)
    .bind(&upload.archive_name)
    .bind(&upload.config)
    .bind(&upload.dataset_id)
    .bind(upload.status.as_str())
    .bind(upload.created_at)
    .execute(pool)
    .await
    .map_err(|e| conflict_on_duplicate(e, || format!("Job {} already exists", upload.job_id)))?;

    Ok(())
}

pub async fn get_upload(pool: &SqlitePool, job_id: &str) -> Result<Option<Upload>> {
    let row = sqlx::query(
        r#"
        SELECT job_id, username, archive_name, config, dataset_id, status, created_at
        FROM uploads
        WHERE job_id = ?
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(Some(Upload {
            job_id: row.get("job_id"),
            username: row.get("username"),
            archive_name: row.get("archive_name"),
            config: row.get("config"),
            dataset_id: row.get("dataset_id"),
            status: status_from_row(&row)?,
            created_at: row.get("created_at"),
        })),
        None => Ok(None),
    }
}

pub async fn complete_upload(pool: &SqlitePool, job_id: &str, dataset_id: &str) -> Result<()> {
    sqlx::query("UPDATE uploads SET status = ?, dataset_id = ? WHERE job_id = ?")
        .bind(JobStatus::Completed.as_str())
        .bind(dataset_id)
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Forget an upload whose ingestion failed, freeing the job id
pub async fn delete_upload(pool: &SqlitePool, job_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM uploads WHERE job_id = ?")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Create or reset the inference record for a job (status pending). A job
/// that is still pending or processing is refused with `Error::Conflict`.
pub async fn create_inference_job(
    pool: &SqlitePool,
    job_id: &str,
    username: Option<&str>,
    config: &str,
    dataset_id: &str,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO inference_jobs (job_id, username, config, dataset_id, status, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(job_id) DO UPDATE SET
            config = excluded.config,
            dataset_id = excluded.dataset_id,
            status = excluded.status,
            started_at = NULL,
            completed_at = NULL,
            error = NULL
        WHERE inference_jobs.status IN (?, ?)
        "#,
    )
    .bind(job_id)
    .bind(username)
    .bind(config)
    .bind(dataset_id)
    .bind(JobStatus::Pending.as_str())
    .bind(time::now_ms())
    .bind(JobStatus::Completed.as_str())
    .bind(JobStatus::Failed.as_str())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::Conflict(format!(
            "Inference for job {} is already pending or running",
            job_id
        )));
    }
    Ok(())
}

/// Move a job to `status`, stamping start/finish times
pub async fn update_inference_status(
    pool: &SqlitePool,
    job_id: &str,
    status: JobStatus,
    error: Option<&str>,
) -> Result<()> {
    let now = time::now_ms();
    let started_at = (status == JobStatus::Processing).then_some(now);
    let completed_at = status.is_terminal().then_some(now);

    sqlx::query(
        r#"
        UPDATE inference_jobs SET
            status = ?,
            started_at = COALESCE(?, started_at),
            completed_at = COALESCE(?, completed_at),
            error = ?
        WHERE job_id = ?
        "#,
    )
    .bind(status.as_str())
    .bind(started_at)
    .bind(completed_at)
    .bind(error)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_inference_job(pool: &SqlitePool, job_id: &str) -> Result<Option<InferenceJob>> {
    let row = sqlx::query(
        r#"
        SELECT job_id, username, config, dataset_id, status, created_at, started_at, completed_at, error
        FROM inference_jobs
        WHERE job_id = ?
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(Some(InferenceJob {
            job_id: row.get("job_id"),
            username: row.get("username"),
            config: row.get("config"),
            dataset_id: row.get("dataset_id"),
            status: status_from_row(&row)?,
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            error: row.get("error"),
        })),
        None => Ok(None),
    }
}
