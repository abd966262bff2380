//! Database migrations
//!
//! Migrations are embedded as SQL strings, one variant per supported backend,
//! and tracked in a `_migrations` table so each one runs exactly once.
//!
//! ```ignore
//! use refresh_guard::db::{create_pool, migrations};
//!
//! let pool = create_pool(&config).await?;
//! migrations::run_migrations(&pool).await?;
//! ```

use anyhow::{Context, Result};
use sqlx::Row;

use super::DatabasePool;

/// A database migration with SQL for both SQLite and MySQL
#[derive(Debug, Clone)]
pub struct Migration {
    /// Migration version number (must be unique and sequential)
    pub version: i64,
    /// Human-readable migration name
    pub name: &'static str,
    /// SQL statements for SQLite
    pub up_sqlite: &'static str,
    /// SQL statements for MySQL
    pub up_mysql: &'static str,
}

/// All migrations, in application order
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_session_tokens",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS session_tokens (
                token_id VARCHAR(64) PRIMARY KEY,
                user_id VARCHAR(255) NOT NULL,
                created_at TIMESTAMP NOT NULL,
                last_used_at TIMESTAMP NOT NULL,
                absolute_expiry_at TIMESTAMP NOT NULL,
                inactivity_expiry_seconds INTEGER NOT NULL,
                revoked BOOLEAN NOT NULL DEFAULT 0,
                replaced_by_token_id VARCHAR(64),
                device_info TEXT,
                ip_address VARCHAR(64),
                expires_at TIMESTAMP NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_session_tokens_user_id ON session_tokens(user_id);
            CREATE INDEX IF NOT EXISTS idx_session_tokens_expires_at ON session_tokens(expires_at);
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS session_tokens (
                token_id VARCHAR(64) PRIMARY KEY,
                user_id VARCHAR(255) NOT NULL,
                created_at DATETIME(6) NOT NULL,
                last_used_at DATETIME(6) NOT NULL,
                absolute_expiry_at DATETIME(6) NOT NULL,
                inactivity_expiry_seconds BIGINT NOT NULL,
                revoked BOOLEAN NOT NULL DEFAULT FALSE,
                replaced_by_token_id VARCHAR(64),
                device_info TEXT,
                ip_address VARCHAR(64),
                expires_at DATETIME(6) NOT NULL
            );
            CREATE INDEX idx_session_tokens_user_id ON session_tokens(user_id);
            CREATE INDEX idx_session_tokens_expires_at ON session_tokens(expires_at);
        "#,
    },
];

/// Run all pending migrations
///
/// Returns the number of migrations applied.
pub async fn run_migrations(pool: &DatabasePool) -> Result<usize> {
    create_migrations_table(pool).await?;

    let applied = get_applied_versions(pool).await?;
    let mut count = 0;

    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }
        tracing::info!(
            "Applying migration {}: {}",
            migration.version,
            migration.name
        );
        apply_migration(pool, migration)
            .await
            .with_context(|| format!("Failed to apply migration: {}", migration.name))?;
        count += 1;
    }

    if count > 0 {
        tracing::info!("Applied {} migration(s)", count);
    } else {
        tracing::debug!("No pending migrations");
    }

    Ok(count)
}

/// Get pending migrations count
pub async fn pending_count(pool: &DatabasePool) -> Result<usize> {
    create_migrations_table(pool).await?;
    let applied = get_applied_versions(pool).await?;
    Ok(MIGRATIONS
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .count())
}

async fn create_migrations_table(pool: &DatabasePool) -> Result<()> {
    let sql = match pool {
        DatabasePool::Sqlite(_) => {
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#
        }
        DatabasePool::Mysql(_) => {
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#
        }
    };

    pool.execute(sql)
        .await
        .context("Failed to create migrations table")?;
    Ok(())
}

async fn get_applied_versions(pool: &DatabasePool) -> Result<Vec<i64>> {
    let query = "SELECT version FROM _migrations ORDER BY version";
    let versions = match pool {
        DatabasePool::Sqlite(p) => sqlx::query(query)
            .fetch_all(p)
            .await?
            .iter()
            .map(|row| row.get::<i64, _>("version"))
            .collect(),
        DatabasePool::Mysql(p) => sqlx::query(query)
            .fetch_all(p)
            .await?
            .iter()
            .map(|row| row.get::<i64, _>("version"))
            .collect(),
    };
    Ok(versions)
}

async fn apply_migration(pool: &DatabasePool, migration: &Migration) -> Result<()> {
    let sql = match pool {
        DatabasePool::Sqlite(_) => migration.up_sqlite,
        DatabasePool::Mysql(_) => migration.up_mysql,
    };

    for statement in split_sql_statements(sql) {
        pool.execute(statement)
            .await
            .with_context(|| format!("Failed to execute: {}", truncate_sql(statement)))?;
    }

    let record = "INSERT INTO _migrations (version, name) VALUES (?, ?)";
    match pool {
        DatabasePool::Sqlite(p) => {
            sqlx::query(record)
                .bind(migration.version)
                .bind(migration.name)
                .execute(p)
                .await?;
        }
        DatabasePool::Mysql(p) => {
            sqlx::query(record)
                .bind(migration.version)
                .bind(migration.name)
                .execute(p)
                .await?;
        }
    }

    Ok(())
}

/// Truncate SQL for error messages
fn truncate_sql(sql: &str) -> String {
    match sql.char_indices().nth(100) {
        Some((i, _)) => format!("{}...", &sql[..i]),
        None => sql.to_string(),
    }
}

/// Split SQL into individual non-empty statements
fn split_sql_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty() && !is_comment_only(stmt))
        .collect()
}

/// Check if a string contains only SQL comments
fn is_comment_only(s: &str) -> bool {
    s.lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("--"))
}
