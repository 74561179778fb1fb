//! Database initialisation
//!
//! One SQLite file in the root folder holds users, uploads, inference jobs,
//! the case registry and exported annotation tasks. Tables are created on
//! first start and the statements are idempotent.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Open (creating if needed) the database and its tables
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    create_tables(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database with all tables (tests, dry runs)
pub async fn init_memory_database() -> Result<SqlitePool> {
    // One connection: every pooled connection to :memory: is a separate database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    create_tables(&pool).await?;
    Ok(pool)
}

/// Create every table if missing
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    create_users_table(pool).await?;
    create_uploads_table(pool).await?;
    create_inference_jobs_table(pool).await?;
    create_cases_table(pool).await?;
    create_exported_tasks_table(pool).await?;
    Ok(())
}

/// Users authenticate against the annotation platform; no password
/// material is stored here.
async fn create_users_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            username TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            last_login INTEGER,
            is_active INTEGER NOT NULL DEFAULT 1,
            platform_verified INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_uploads_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS uploads (
            job_id TEXT PRIMARY KEY,
            username TEXT,
            archive_name TEXT NOT NULL,
            config TEXT NOT NULL,
            dataset_id TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_inference_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS inference_jobs (
            job_id TEXT PRIMARY KEY,
            username TEXT,
            config TEXT NOT NULL,
            dataset_id TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Case registry: which raw channel files belong to which case, written
/// once at ingestion and read back at dataset insertion.
async fn create_cases_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cases (
            job_id TEXT NOT NULL,
            case_name TEXT NOT NULL,
            channel INTEGER NOT NULL,
            dataset_id TEXT NOT NULL,
            raw_path TEXT NOT NULL,
            png_dir TEXT,
            PRIMARY KEY (job_id, case_name, channel)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_exported_tasks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS exported_tasks (
            task_id INTEGER PRIMARY KEY,
            task_name TEXT NOT NULL,
            nifti_id TEXT NOT NULL,
            job_id TEXT NOT NULL,
            case_name TEXT NOT NULL,
            dataset_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            inserted_case_id TEXT,
            inserted_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
