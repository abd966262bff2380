//! Token store layer
//!
//! This module provides the storage contract the session token manager relies
//! on, plus the engines that satisfy it:
//! - In-memory store (moka) - default, for single-instance deployment
//! - Redis store - optional, for deployments with several service instances
//! - Database store (sqlx) - SQLite or MySQL, TTL emulated with an expiry column
//!
//! The store driver is selected based on configuration.
//!
//! # Usage
//!
//! ```rust,ignore
//! use refresh_guard::config::Config;
//! use refresh_guard::store::create_store;
//!
//! let config = Config::default();
//! let store = create_store(&config).await?;
//! store.put(&token, Duration::from_secs(60)).await?;
//! ```

pub mod database;
pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, StoreDriver};
use crate::db;
use crate::models::SessionToken;

/// Key-value store for session tokens with per-key expiry.
///
/// Records are keyed by `SessionToken::token_id`. Every write carries a TTL
/// after which the record disappears without any further call.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Get a token by identifier.
    ///
    /// Returns `Ok(None)` if the key was never written, was deleted, or has
    /// expired.
    async fn get(&self, token_id: &str) -> Result<Option<SessionToken>>;

    /// Insert or overwrite a token; the record expires after `ttl`
    async fn put(&self, token: &SessionToken, ttl: Duration) -> Result<()>;

    /// Atomically replace `expected` with `new` if the stored record still
    /// equals `expected`.
    ///
    /// Returns `Ok(false)` when the stored record differs or is gone; nothing
    /// is written in that case. Both tokens must share a `token_id`.
    async fn compare_and_set(
        &self,
        expected: &SessionToken,
        new: &SessionToken,
        ttl: Duration,
    ) -> Result<bool>;

    /// Delete a token. Deleting a missing key is a no-op.
    async fn delete(&self, token_id: &str) -> Result<()>;

    /// Every unexpired token owned by `user_id`, revoked ones included
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<SessionToken>>;
}

/// Type alias for a shared token store
pub type DynTokenStore = Arc<dyn TokenStore>;

pub use database::DatabaseTokenStore;
pub use memory::MemoryTokenStore;
#[cfg(feature = "redis-store")]
pub use redis::RedisTokenStore;

/// Reject a compare-and-set whose two sides address different records
pub(crate) fn ensure_same_key(expected: &SessionToken, new: &SessionToken) -> Result<()> {
    if expected.token_id != new.token_id {
        anyhow::bail!(
            "compare_and_set called with mismatched token ids ({} vs {})",
            expected.short_id(),
            new.short_id()
        );
    }
    Ok(())
}

/// TTL in whole seconds, never zero (a zero TTL means "no expiry" to Redis)
pub(crate) fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Create a token store based on configuration
///
/// - `StoreDriver::Memory` - Creates an in-memory store using moka
/// - `StoreDriver::Redis` - Creates a Redis store (requires `redis-store` feature)
/// - `StoreDriver::Database` - Connects to the configured database and runs migrations
///
/// # Errors
/// - Returns an error if the configuration fails `Config::validate`
/// - Returns an error if Redis is configured but the `redis-store` feature is not enabled
/// - Returns an error if Redis is configured without a URL
/// - Returns an error if the Redis or database connection fails
pub async fn create_store(config: &Config) -> Result<DynTokenStore> {
    config.validate()?;

    match config.store.driver {
        StoreDriver::Memory => {
            Ok(Arc::new(MemoryTokenStore::new()))
        }
        StoreDriver::Redis => {
            #[cfg(feature = "redis-store")]
            {
                let redis_url = config.store.redis_url.as_ref()
                    .ok_or_else(|| anyhow::anyhow!(
                        "Redis URL is required when using the redis store driver. \
                         Set 'redis_url' in store configuration or use REFRESH_GUARD_STORE_REDIS_URL environment variable."
                    ))?;

                let store = RedisTokenStore::with_prefix(redis_url, &config.store.key_prefix).await?;
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "redis-store"))]
            {
                anyhow::bail!(
                    "Redis store driver is configured but the 'redis-store' feature is not enabled. \
                     Either enable the feature with `--features redis-store` or use the 'memory' store driver."
                )
            }
        }
        StoreDriver::Database => {
            let pool = db::create_pool(&config.database).await?;
            db::migrations::run_migrations(&pool).await?;
            Ok(Arc::new(DatabaseTokenStore::new(pool)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use chrono::Utc;

    fn sample_token(id: &str) -> SessionToken {
        let now = Utc::now();
        SessionToken {
            token_id: id.to_string(),
            user_id: "user-1".to_string(),
            created_at: now,
            last_used_at: now,
            absolute_expiry_at: now + chrono::Duration::days(1),
            inactivity_expiry_seconds: 3600,
            revoked: false,
            replaced_by_token_id: None,
            device_info: None,
            ip_address: None,
        }
    }

    #[tokio::test]
    async fn test_create_memory_store() {
        let config = Config::default();
        let store = create_store(&config).await.unwrap();

        let token = sample_token("factory-memory");
        store.put(&token, Duration::from_secs(60)).await.unwrap();
        let found = store.get("factory-memory").await.unwrap();
        assert_eq!(found, Some(token));
    }

    #[tokio::test]
    async fn test_create_database_store() {
        let mut config = Config::default();
        config.store.driver = StoreDriver::Database;
        config.database = DatabaseConfig {
            driver: crate::config::DatabaseDriver::Sqlite,
            url: ":memory:".to_string(),
        };
        let store = create_store(&config).await.unwrap();

        let token = sample_token("factory-database");
        store.put(&token, Duration::from_secs(60)).await.unwrap();
        let found = store.get("factory-database").await.unwrap().expect("stored token");
        assert_eq!(found.user_id, token.user_id);
    }

    #[tokio::test]
    async fn test_create_store_rejects_invalid_policy() {
        let mut config = Config::default();
        config.session.reuse_grace_seconds = 0;

        let result = create_store(&config).await;
        assert!(result.is_err());
        let err = result.err().unwrap().to_string();
        assert!(err.contains("reuse_grace_seconds"));
    }

    #[cfg(not(feature = "redis-store"))]
    #[tokio::test]
    async fn test_create_redis_store_without_feature() {
        let mut config = Config::default();
        config.store.driver = StoreDriver::Redis;
        config.store.redis_url = Some("redis://localhost:6379".to_string());

        let result = create_store(&config).await;
        assert!(result.is_err());
        let err = result.err().unwrap().to_string();
        assert!(err.contains("redis-store") && err.contains("feature"));
    }

    #[cfg(feature = "redis-store")]
    #[tokio::test]
    async fn test_create_redis_store_without_url() {
        let mut config = Config::default();
        config.store.driver = StoreDriver::Redis;
        config.store.redis_url = None;

        let result = create_store(&config).await;
        assert!(result.is_err());
        let err = result.err().unwrap().to_string();
        assert!(err.contains("Redis URL"));
    }

    #[test]
    fn test_ttl_seconds_never_zero() {
        assert_eq!(ttl_seconds(Duration::from_millis(10)), 1);
        assert_eq!(ttl_seconds(Duration::from_secs(3600)), 3600);
    }

    #[test]
    fn test_ensure_same_key() {
        let a = sample_token("a");
        let b = sample_token("b");
        assert!(ensure_same_key(&a, &a).is_ok());
        assert!(ensure_same_key(&a, &b).is_err());
    }
}
