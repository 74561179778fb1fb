//! User records
//!
//! Credentials are verified against the annotation platform; only the
//! username and login timestamps are kept here.

use segloop_common::db::User;
use segloop_common::{time, Result};
use sqlx::{Row, SqlitePool};

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> User {
    User {
        username: row.get("username"),
        created_at: row.get("created_at"),
        last_login: row.get("last_login"),
        is_active: row.get("is_active"),
        platform_verified: row.get("platform_verified"),
    }
}

pub async fn find_user(pool: &SqlitePool, username: &str) -> Result<Option<User>> {
    let row = sqlx::query(
        r#"
        SELECT username, created_at, last_login, is_active, platform_verified
        FROM users
        WHERE username = ?
        "#,
    )
    .bind(username)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(user_from_row))
}

/// Record a successful login. Returns the user and whether it was created.
pub async fn record_login(pool: &SqlitePool, username: &str) -> Result<(User, bool)> {
    let now = time::now_ms();

    let result = sqlx::query(
        r#"
        INSERT INTO users (username, created_at, last_login, is_active, platform_verified)
        VALUES (?, ?, ?, 1, 1)
        ON CONFLICT(username) DO NOTHING
        "#,
    )
    .bind(username)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    let is_new = result.rows_affected() == 1;
    if !is_new {
        sqlx::query("UPDATE users SET last_login = ?, platform_verified = 1 WHERE username = ?")
            .bind(now)
            .bind(username)
            .execute(pool)
            .await?;
    }

    let user = find_user(pool, username).await?.ok_or_else(|| {
        segloop_common::Error::Internal(format!("User {} vanished after login", username))
    })?;
    Ok((user, is_new))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_first_login_creates_user() {
        let pool = test_pool().await;

        let (user, is_new) = record_login(&pool, "alice").await.unwrap();
        assert!(is_new);
        assert_eq!(user.username, "alice");
        assert!(user.is_active);
        assert!(user.platform_verified);

        let (again, is_new) = record_login(&pool, "alice").await.unwrap();
        assert!(!is_new);
        assert_eq!(again.created_at, user.created_at);
        assert!(again.last_login >= user.last_login);
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let pool = test_pool().await;
        assert!(find_user(&pool, "nobody").await.unwrap().is_none());
    }
}
