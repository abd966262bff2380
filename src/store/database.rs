//! Database token store
//!
//! Persists session tokens in the `session_tokens` table through sqlx.
//!
//! SQL has no native key expiry, so every row carries an `expires_at` column
//! set from the TTL on each write. Reads ignore rows past that instant and
//! `purge_expired` deletes them for good.

use super::{ensure_same_key, TokenStore};
use crate::db::DatabasePool;
use crate::models::SessionToken;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row, SqlitePool};
use std::time::Duration;

const SELECT_TOKEN: &str = r#"
    SELECT token_id, user_id, created_at, last_used_at, absolute_expiry_at,
           inactivity_expiry_seconds, revoked, replaced_by_token_id, device_info, ip_address
    FROM session_tokens
"#;

/// SQLx-based token store
///
/// Supports both SQLite and MySQL databases.
#[derive(Debug, Clone)]
pub struct DatabaseTokenStore {
    pool: DatabasePool,
}

impl DatabaseTokenStore {
    /// Create a store over an already migrated pool
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Delete every row whose TTL has elapsed.
    ///
    /// Expired rows are already invisible to reads; call this periodically to
    /// reclaim space. Returns the number of rows deleted.
    pub async fn purge_expired(&self) -> Result<u64> {
        match &self.pool {
            DatabasePool::Sqlite(pool) => purge_expired_sqlite(pool).await,
            DatabasePool::Mysql(pool) => purge_expired_mysql(pool).await,
        }
    }
}

/// Row expiry instant for a write made now with `ttl`
fn expires_at(ttl: Duration) -> Result<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl).context("TTL out of range")?;
    Ok(Utc::now() + ttl)
}

#[async_trait]
impl TokenStore for DatabaseTokenStore {
    async fn get(&self, token_id: &str) -> Result<Option<SessionToken>> {
        match &self.pool {
            DatabasePool::Sqlite(pool) => get_token_sqlite(pool, token_id).await,
            DatabasePool::Mysql(pool) => get_token_mysql(pool, token_id).await,
        }
    }

    async fn put(&self, token: &SessionToken, ttl: Duration) -> Result<()> {
        let expires_at = expires_at(ttl)?;
        match &self.pool {
            DatabasePool::Sqlite(pool) => put_token_sqlite(pool, token, expires_at).await,
            DatabasePool::Mysql(pool) => put_token_mysql(pool, token, expires_at).await,
        }
    }

    async fn compare_and_set(
        &self,
        expected: &SessionToken,
        new: &SessionToken,
        ttl: Duration,
    ) -> Result<bool> {
        ensure_same_key(expected, new)?;
        let expires_at = expires_at(ttl)?;
        match &self.pool {
            DatabasePool::Sqlite(pool) => {
                compare_and_set_sqlite(pool, expected, new, expires_at).await
            }
            DatabasePool::Mysql(pool) => {
                compare_and_set_mysql(pool, expected, new, expires_at).await
            }
        }
    }

    async fn delete(&self, token_id: &str) -> Result<()> {
        match &self.pool {
            DatabasePool::Sqlite(pool) => delete_token_sqlite(pool, token_id).await,
            DatabasePool::Mysql(pool) => delete_token_mysql(pool, token_id).await,
        }
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<SessionToken>> {
        match &self.pool {
            DatabasePool::Sqlite(pool) => list_by_user_sqlite(pool, user_id).await,
            DatabasePool::Mysql(pool) => list_by_user_mysql(pool, user_id).await,
        }
    }
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn get_token_sqlite(pool: &SqlitePool, token_id: &str) -> Result<Option<SessionToken>> {
    let sql = format!("{} WHERE token_id = ? AND expires_at > ?", SELECT_TOKEN);
    let row = sqlx::query(&sql)
        .bind(token_id)
        .bind(Utc::now())
        .fetch_optional(pool)
        .await
        .context("Failed to get session token")?;

    row.as_ref().map(row_to_token_sqlite).transpose()
}

async fn put_token_sqlite(
    pool: &SqlitePool,
    token: &SessionToken,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO session_tokens (token_id, user_id, created_at, last_used_at,
            absolute_expiry_at, inactivity_expiry_seconds, revoked, replaced_by_token_id,
            device_info, ip_address, expires_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(token_id) DO UPDATE SET
            user_id = excluded.user_id,
            created_at = excluded.created_at,
            last_used_at = excluded.last_used_at,
            absolute_expiry_at = excluded.absolute_expiry_at,
            inactivity_expiry_seconds = excluded.inactivity_expiry_seconds,
            revoked = excluded.revoked,
            replaced_by_token_id = excluded.replaced_by_token_id,
            device_info = excluded.device_info,
            ip_address = excluded.ip_address,
            expires_at = excluded.expires_at
        "#,
    )
    .bind(&token.token_id)
    .bind(&token.user_id)
    .bind(token.created_at)
    .bind(token.last_used_at)
    .bind(token.absolute_expiry_at)
    .bind(token.inactivity_expiry_seconds as i64)
    .bind(token.revoked)
    .bind(&token.replaced_by_token_id)
    .bind(&token.device_info)
    .bind(&token.ip_address)
    .bind(expires_at)
    .execute(pool)
    .await
    .context("Failed to store session token")?;

    Ok(())
}

async fn compare_and_set_sqlite(
    pool: &SqlitePool,
    expected: &SessionToken,
    new: &SessionToken,
    expires_at: DateTime<Utc>,
) -> Result<bool> {
    // Only revocation state and client metadata ever change on a record
    let result = sqlx::query(
        r#"
        UPDATE session_tokens
        SET revoked = ?, replaced_by_token_id = ?, device_info = ?, ip_address = ?, expires_at = ?
        WHERE token_id = ? AND expires_at > ?
          AND revoked = ? AND replaced_by_token_id IS ?
          AND device_info IS ? AND ip_address IS ?
        "#,
    )
    .bind(new.revoked)
    .bind(&new.replaced_by_token_id)
    .bind(&new.device_info)
    .bind(&new.ip_address)
    .bind(expires_at)
    .bind(&expected.token_id)
    .bind(Utc::now())
    .bind(expected.revoked)
    .bind(&expected.replaced_by_token_id)
    .bind(&expected.device_info)
    .bind(&expected.ip_address)
    .execute(pool)
    .await
    .context("Failed to compare-and-set session token")?;

    Ok(result.rows_affected() == 1)
}

async fn delete_token_sqlite(pool: &SqlitePool, token_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM session_tokens WHERE token_id = ?")
        .bind(token_id)
        .execute(pool)
        .await
        .context("Failed to delete session token")?;

    Ok(())
}

async fn list_by_user_sqlite(pool: &SqlitePool, user_id: &str) -> Result<Vec<SessionToken>> {
    let sql = format!("{} WHERE user_id = ? AND expires_at > ?", SELECT_TOKEN);
    let rows = sqlx::query(&sql)
        .bind(user_id)
        .bind(Utc::now())
        .fetch_all(pool)
        .await
        .context("Failed to list session tokens by user")?;

    rows.iter().map(row_to_token_sqlite).collect()
}

async fn purge_expired_sqlite(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM session_tokens WHERE expires_at <= ?")
        .bind(Utc::now())
        .execute(pool)
        .await
        .context("Failed to delete expired session tokens")?;

    Ok(result.rows_affected())
}

fn row_to_token_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<SessionToken> {
    let inactivity: i64 = row.try_get("inactivity_expiry_seconds")?;

    Ok(SessionToken {
        token_id: row.try_get("token_id")?,
        user_id: row.try_get("user_id")?,
        created_at: row.try_get("created_at")?,
        last_used_at: row.try_get("last_used_at")?,
        absolute_expiry_at: row.try_get("absolute_expiry_at")?,
        inactivity_expiry_seconds: inactivity.max(0) as u64,
        revoked: row.try_get("revoked")?,
        replaced_by_token_id: row.try_get("replaced_by_token_id")?,
        device_info: row.try_get("device_info")?,
        ip_address: row.try_get("ip_address")?,
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn get_token_mysql(pool: &MySqlPool, token_id: &str) -> Result<Option<SessionToken>> {
    let sql = format!("{} WHERE token_id = ? AND expires_at > ?", SELECT_TOKEN);
    let row = sqlx::query(&sql)
        .bind(token_id)
        .bind(Utc::now())
        .fetch_optional(pool)
        .await
        .context("Failed to get session token")?;

    row.as_ref().map(row_to_token_mysql).transpose()
}

async fn put_token_mysql(
    pool: &MySqlPool,
    token: &SessionToken,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO session_tokens (token_id, user_id, created_at, last_used_at,
            absolute_expiry_at, inactivity_expiry_seconds, revoked, replaced_by_token_id,
            device_info, ip_address, expires_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON DUPLICATE KEY UPDATE
            user_id = VALUES(user_id),
            created_at = VALUES(created_at),
            last_used_at = VALUES(last_used_at),
            absolute_expiry_at = VALUES(absolute_expiry_at),
            inactivity_expiry_seconds = VALUES(inactivity_expiry_seconds),
            revoked = VALUES(revoked),
            replaced_by_token_id = VALUES(replaced_by_token_id),
            device_info = VALUES(device_info),
            ip_address = VALUES(ip_address),
            expires_at = VALUES(expires_at)
        "#,
    )
    .bind(&token.token_id)
    .bind(&token.user_id)
    .bind(token.created_at)
    .bind(token.last_used_at)
    .bind(token.absolute_expiry_at)
    .bind(token.inactivity_expiry_seconds as i64)
    .bind(token.revoked)
    .bind(&token.replaced_by_token_id)
    .bind(&token.device_info)
    .bind(&token.ip_address)
    .bind(expires_at)
    .execute(pool)
    .await
    .context("Failed to store session token")?;

    Ok(())
}

async fn compare_and_set_mysql(
    pool: &MySqlPool,
    expected: &SessionToken,
    new: &SessionToken,
    expires_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE session_tokens
        SET revoked = ?, replaced_by_token_id = ?, device_info = ?, ip_address = ?, expires_at = ?
        WHERE token_id = ? AND expires_at > ?
          AND revoked = ? AND replaced_by_token_id <=> ?
          AND device_info <=> ? AND ip_address <=> ?
        "#,
    )
    .bind(new.revoked)
    .bind(&new.replaced_by_token_id)
    .bind(&new.device_info)
    .bind(&new.ip_address)
    .bind(expires_at)
    .bind(&expected.token_id)
    .bind(Utc::now())
    .bind(expected.revoked)
    .bind(&expected.replaced_by_token_id)
    .bind(&expected.device_info)
    .bind(&expected.ip_address)
    .execute(pool)
    .await
    .context("Failed to compare-and-set session token")?;

    Ok(result.rows_affected() == 1)
}

async fn delete_token_mysql(pool: &MySqlPool, token_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM session_tokens WHERE token_id = ?")
        .bind(token_id)
        .execute(pool)
        .await
        .context("Failed to delete session token")?;

    Ok(())
}

async fn list_by_user_mysql(pool: &MySqlPool, user_id: &str) -> Result<Vec<SessionToken>> {
    let sql = format!("{} WHERE user_id = ? AND expires_at > ?", SELECT_TOKEN);
    let rows = sqlx::query(&sql)
        .bind(user_id)
        .bind(Utc::now())
        .fetch_all(pool)
        .await
        .context("Failed to list session tokens by user")?;

    rows.iter().map(row_to_token_mysql).collect()
}

async fn purge_expired_mysql(pool: &MySqlPool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM session_tokens WHERE expires_at <= ?")
        .bind(Utc::now())
        .execute(pool)
        .await
        .context("Failed to delete expired session tokens")?;

    Ok(result.rows_affected())
}

fn row_to_token_mysql(row: &sqlx::mysql::MySqlRow) -> Result<SessionToken> {
    let inactivity: i64 = row.try_get("inactivity_expiry_seconds")?;

    Ok(SessionToken {
        token_id: row.try_get("token_id")?,
        user_id: row.try_get("user_id")?,
        created_at: row.try_get("created_at")?,
        last_used_at: row.try_get("last_used_at")?,
        absolute_expiry_at: row.try_get("absolute_expiry_at")?,
        inactivity_expiry_seconds: inactivity.max(0) as u64,
        revoked: row.try_get("revoked")?,
        replaced_by_token_id: row.try_get("replaced_by_token_id")?,
        device_info: row.try_get("device_info")?,
        ip_address: row.try_get("ip_address")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_test_pool, migrations};

    async fn setup_test_store() -> DatabaseTokenStore {
        let pool = create_test_pool().await.expect("Failed to create test pool");
        migrations::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        DatabaseTokenStore::new(pool)
    }

    fn create_test_token(id: &str, user_id: &str) -> SessionToken {
        let now = Utc::now();
        SessionToken {
            token_id: id.to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            last_used_at: now,
            absolute_expiry_at: now + chrono::Duration::days(90),
            inactivity_expiry_seconds: 1_209_600,
            revoked: false,
            replaced_by_token_id: None,
            device_info: Some("iPhone".to_string()),
            ip_address: None,
        }
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = setup_test_store().await;
        let token = create_test_token("t1", "alice");

        store.put(&token, Duration::from_secs(60)).await.expect("Failed to store token");

        let found = store
            .get("t1")
            .await
            .expect("Failed to get token")
            .expect("Token not found");

        assert_eq!(found.token_id, "t1");
        assert_eq!(found.user_id, "alice");
        assert_eq!(found.absolute_expiry_at, token.absolute_expiry_at);
        assert_eq!(found.inactivity_expiry_seconds, 1_209_600);
        assert!(!found.revoked);
        assert_eq!(found.device_info.as_deref(), Some("iPhone"));
        assert_eq!(found.ip_address, None);
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let store = setup_test_store().await;
        let found = store.get("nonexistent").await.expect("Failed to get token");
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_expired_rows_are_invisible_and_purged() {
        let store = setup_test_store().await;
        let short = create_test_token("short", "alice");
        let long = create_test_token("long", "alice");

        store.put(&short, Duration::from_secs(1)).await.unwrap();
        store.put(&long, Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(store.get("short").await.unwrap().is_none());
        assert_eq!(store.list_by_user("alice").await.unwrap().len(), 1);

        let purged = store.purge_expired().await.expect("Failed to purge");
        assert_eq!(purged, 1);
        assert!(store.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = setup_test_store().await;
        let token = create_test_token("t1", "alice");

        store.put(&token, Duration::from_secs(60)).await.unwrap();
        store.put(&token.to_revoked(None), Duration::from_secs(60)).await.unwrap();

        let found = store.get("t1").await.unwrap().unwrap();
        assert!(found.revoked);
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let store = setup_test_store().await;
        let token = create_test_token("t1", "alice");
        store.put(&token, Duration::from_secs(60)).await.unwrap();

        let first = token.to_revoked(Some("a".to_string()));
        let second = token.to_revoked(Some("b".to_string()));

        assert!(store.compare_and_set(&token, &first, Duration::from_secs(60)).await.unwrap());
        assert!(!store.compare_and_set(&token, &second, Duration::from_secs(60)).await.unwrap());

        let found = store.get("t1").await.unwrap().unwrap();
        assert!(found.revoked);
        assert_eq!(found.replaced_by_token_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_compare_and_set_missing_row() {
        let store = setup_test_store().await;
        let token = create_test_token("t1", "alice");

        let swapped = store
            .compare_and_set(&token, &token.to_revoked(None), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!swapped);
    }

    #[tokio::test]
    async fn test_delete_and_list_by_user() {
        let store = setup_test_store().await;
        store.put(&create_test_token("a1", "alice"), Duration::from_secs(60)).await.unwrap();
        store.put(&create_test_token("a2", "alice"), Duration::from_secs(60)).await.unwrap();
        store.put(&create_test_token("b1", "bob"), Duration::from_secs(60)).await.unwrap();

        store.delete("a1").await.expect("Failed to delete token");
        store.delete("a1").await.expect("Deleting twice should succeed");

        let alice = store.list_by_user("alice").await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].token_id, "a2");
        assert_eq!(store.list_by_user("bob").await.unwrap().len(), 1);
    }
}
