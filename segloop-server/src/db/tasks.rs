//! Annotation tasks created from inference results

use segloop_common::db::ExportedTask;
use segloop_common::{time, Result};
use sqlx::{Row, SqlitePool};

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> ExportedTask {
    ExportedTask {
        task_id: row.get("task_id"),
        task_name: row.get("task_name"),
        nifti_id: row.get("nifti_id"),
        job_id: row.get("job_id"),
        case_name: row.get("case_name"),
        dataset_id: row.get("dataset_id"),
        created_at: row.get("created_at"),
        inserted_case_id: row.get("inserted_case_id"),
        inserted_at: row.get("inserted_at"),
    }
}

/// Record a task; re-exporting to an id the platform reused replaces the row
pub async fn save_task(pool: &SqlitePool, task: &ExportedTask) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO exported_tasks
            (task_id, task_name, nifti_id, job_id, case_name, dataset_id, created_at, inserted_case_id, inserted_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL)
        ON CONFLICT(task_id) DO UPDATE SET
            task_name = excluded.task_name,
            nifti_id = excluded.nifti_id,
            job_id = excluded.job_id,
            case_name = excluded.case_name,
            dataset_id = excluded.dataset_id,
            created_at = excluded.created_at,
            inserted_case_id = NULL,
            inserted_at = NULL
        "#,
    )
    .bind(task.task_id)
    .bind(&task.task_name)
    .bind(&task.nifti_id)
    .bind(&task.job_id)
    .bind(&task.case_name)
    .bind(&task.dataset_id)
    .bind(task.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_task(pool: &SqlitePool, task_id: i64) -> Result<Option<ExportedTask>> {
    let row = sqlx::query(
        r#"
        SELECT task_id, task_name, nifti_id, job_id, case_name, dataset_id, created_at, inserted_case_id, inserted_at
        FROM exported_tasks
        WHERE task_id = ?
        "#,
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(task_from_row))
}

/// All tasks, newest first
pub async fn list_tasks(pool: &SqlitePool) -> Result<Vec<ExportedTask>> {
    let rows = sqlx::query(
        r#"
        SELECT task_id, task_name, nifti_id, job_id, case_name, dataset_id, created_at, inserted_case_id, inserted_at
        FROM exported_tasks
        ORDER BY created_at DESC, task_id DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(task_from_row).collect())
}

pub async fn mark_inserted(pool: &SqlitePool, task_id: i64, case_id: &str) -> Result<()> {
    sqlx::query("UPDATE exported_tasks SET inserted_case_id = ?, inserted_at = ? WHERE task_id = ?")
        .bind(case_id)
        .bind(time::now_ms())
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(())
}
