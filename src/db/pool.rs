//! Database connection pool
//!
//! One pool type covering both SQLite and MySQL. The backend is chosen from
//! configuration and callers match on the variant for driver-specific SQL.

use anyhow::{Context, Result};
use sqlx::{
    mysql::{MySqlPool, MySqlPoolOptions},
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
};
use std::str::FromStr;
use std::time::Duration;

use crate::config::{DatabaseConfig, DatabaseDriver};

/// Connection pool for either supported backend
#[derive(Debug, Clone)]
pub enum DatabasePool {
    /// SQLite pool
    Sqlite(SqlitePool),
    /// MySQL pool
    Mysql(MySqlPool),
}

impl DatabasePool {
    /// Get the database driver type
    pub fn driver(&self) -> DatabaseDriver {
        match self {
            DatabasePool::Sqlite(_) => DatabaseDriver::Sqlite,
            DatabasePool::Mysql(_) => DatabaseDriver::Mysql,
        }
    }

    /// Execute a raw SQL statement that doesn't return rows
    pub async fn execute(&self, query: &str) -> Result<u64> {
        let affected = match self {
            DatabasePool::Sqlite(pool) => sqlx::query(query).execute(pool).await?.rows_affected(),
            DatabasePool::Mysql(pool) => sqlx::query(query).execute(pool).await?.rows_affected(),
        };
        Ok(affected)
    }

    /// Check if the database connection is healthy
    pub async fn ping(&self) -> Result<()> {
        match self {
            DatabasePool::Sqlite(pool) => {
                sqlx::query("SELECT 1").fetch_one(pool).await.context("Database ping failed")?;
            }
            DatabasePool::Mysql(pool) => {
                sqlx::query("SELECT 1").fetch_one(pool).await.context("Database ping failed")?;
            }
        }
        Ok(())
    }

    /// Close the connection pool
    pub async fn close(&self) {
        match self {
            DatabasePool::Sqlite(pool) => pool.close().await,
            DatabasePool::Mysql(pool) => pool.close().await,
        }
    }
}

/// Open a SQLite pool, creating the database file and its directory if needed
async fn connect_sqlite(url: &str) -> Result<SqlitePool> {
    if !url.starts_with(":memory:") && !url.starts_with("sqlite::memory:") {
        let path = url.trim_start_matches("sqlite:");

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create database directory: {:?}", parent))?;
            }
        }
    }

    let in_memory = url == ":memory:" || url == "sqlite::memory:";
    let connection_url = if in_memory {
        "sqlite::memory:".to_string()
    } else if url.starts_with("sqlite:") {
        if url.contains('?') {
            url.to_string()
        } else {
            format!("{}?mode=rwc", url)
        }
    } else {
        format!("sqlite:{}?mode=rwc", url)
    };

    // Rotations from concurrent requests contend on the same rows
    let options = SqliteConnectOptions::from_str(&connection_url)
        .with_context(|| format!("Invalid SQLite database URL: {}", url))?
        .busy_timeout(Duration::from_secs(5));

    // Every connection to `sqlite::memory:` opens its own empty database, so
    // an in-memory pool is pinned to one connection that is never recycled.
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(10)
    };

    pool_options
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to SQLite database: {}", url))
}

/// Open a MySQL pool
async fn connect_mysql(url: &str) -> Result<MySqlPool> {
    let connection_url = if url.starts_with("mysql://") {
        url.to_string()
    } else {
        format!("mysql://{}", url)
    };

    MySqlPoolOptions::new()
        .max_connections(20)
        .connect(&connection_url)
        .await
        .with_context(|| format!("Failed to connect to MySQL database: {}", url))
}

/// Create a database connection pool based on configuration.
///
/// # Errors
///
/// Returns an error if the connection cannot be established.
///
/// # Example
///
/// ```ignore
/// use refresh_guard::config::DatabaseConfig;
/// use refresh_guard::db::create_pool;
///
/// let config = DatabaseConfig::default();
/// let pool = create_pool(&config).await?;
/// pool.ping().await?;
/// ```
pub async fn create_pool(config: &DatabaseConfig) -> Result<DatabasePool> {
    match config.driver {
        DatabaseDriver::Sqlite => Ok(DatabasePool::Sqlite(connect_sqlite(&config.url).await?)),
        DatabaseDriver::Mysql => Ok(DatabasePool::Mysql(connect_mysql(&config.url).await?)),
    }
}

/// Create a SQLite in-memory database pool for testing
pub async fn create_test_pool() -> Result<DatabasePool> {
    let config = DatabaseConfig {
        driver: DatabaseDriver::Sqlite,
        url: ":memory:".to_string(),
    };
    create_pool(&config).await
}
