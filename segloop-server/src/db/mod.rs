//! Database queries
//!
//! Tables are created by `segloop_common::db::init`; row types live in
//! `segloop_common::db::models`.

pub mod cases;
pub mod jobs;
pub mod tasks;
pub mod users;

/// Map a primary-key violation to `Error::Conflict`
pub(crate) fn conflict_on_duplicate(err: sqlx::Error, what: impl FnOnce() -> String) -> segloop_common::Error {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            segloop_common::Error::Conflict(what())
        }
        _ => segloop_common::Error::Database(err),
    }
}

#[cfg(test)]
pub(crate) async fn test_pool() -> sqlx::SqlitePool {
    segloop_common::db::init_memory_database()
        .await
        .expect("in-memory database")
}
