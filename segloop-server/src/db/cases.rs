//! Case registry
//!
//! One row per raw channel file, written when an upload is ingested. Later
//! steps (dataset insertion, discard) look channels up here instead of
//! scanning directories.

use segloop_common::db::CaseChannel;
use segloop_common::Result;
use sqlx::{Row, SqlitePool};

use super::conflict_on_duplicate;

fn channel_from_row(row: &sqlx::sqlite::SqliteRow) -> CaseChannel {
    let channel: i64 = row.get("channel");
    CaseChannel {
        job_id: row.get("job_id"),
        case_name: row.get("case_name"),
        channel: channel as u32,
        dataset_id: row.get("dataset_id"),
        raw_path: row.get("raw_path"),
        png_dir: row.get("png_dir"),
    }
}

/// Insert all channels of an ingestion in one transaction
pub async fn insert_channels(pool: &SqlitePool, channels: &[CaseChannel]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for c in channels {
        sqlx::query(
            r#"
            INSERT INTO cases (job_id, case_name, channel, dataset_id, raw_path, png_dir)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&c.job_id)
        .bind(&c.case_name)
        .bind(c.channel as i64)
        .bind(&c.dataset_id)
        .bind(&c.raw_path)
        .bind(&c.png_dir)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            conflict_on_duplicate(e, || {
                format!("Case {} channel {} already registered for job {}", c.case_name, c.channel, c.job_id)
            })
        })?;
    }
    tx.commit().await?;
    Ok(())
}

/// Channels of one case, ordered by channel index
pub async fn channels_for_case(pool: &SqlitePool, job_id: &str, case_name: &str) -> Result<Vec<CaseChannel>> {
    let rows = sqlx::query(
        r#"
        SELECT job_id, case_name, channel, dataset_id, raw_path, png_dir
        FROM cases
        WHERE job_id = ? AND case_name = ?
        ORDER BY channel
        "#,
    )
    .bind(job_id)
    .bind(case_name)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(channel_from_row).collect())
}

/// Every channel registered for a job, ordered by case then channel
pub async fn channels_for_job(pool: &SqlitePool, job_id: &str) -> Result<Vec<CaseChannel>> {
    let rows = sqlx::query(
        r#"
        SELECT job_id, case_name, channel, dataset_id, raw_path, png_dir
        FROM cases
        WHERE job_id = ?
        ORDER BY case_name, channel
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(channel_from_row).collect())
}

pub async fn delete_case(pool: &SqlitePool, job_id: &str, case_name: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM cases WHERE job_id = ? AND case_name = ?")
        .bind(job_id)
        .bind(case_name)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
