//! Redis token store
//!
//! Provides a shared token store for deployments with several service
//! instances.
//!
//! # Layout
//! - `{prefix}:token:{token_id}` holds the JSON record, written with `SET EX`
//! - `{prefix}:user:{user_id}` is a set of the user's token ids
//!
//! Index members whose record has expired are pruned when the user's tokens
//! are listed. Compare-and-set runs as a Lua script so the read and the write
//! happen atomically on the server.

use super::{ensure_same_key, ttl_seconds, TokenStore};
use crate::models::SessionToken;
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;

/// Default key prefix
const DEFAULT_PREFIX: &str = "refresh_token";

/// Swap the record only if it still serializes to the expected JSON
const COMPARE_AND_SET_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'EX', tonumber(ARGV[3]))
    return 1
end
return 0
"#;

/// Redis token store
pub struct RedisTokenStore {
    connection: MultiplexedConnection,
    prefix: String,
    cas_script: Script,
}

impl std::fmt::Debug for RedisTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTokenStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisTokenStore {
    /// Connect with the default key prefix
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established.
    pub async fn new(redis_url: &str) -> Result<Self> {
        Self::with_prefix(redis_url, DEFAULT_PREFIX).await
    }

    /// Connect with a custom key prefix
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established.
    pub async fn with_prefix(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("Failed to create Redis client")?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;

        Ok(Self {
            connection,
            prefix: prefix.to_string(),
            cas_script: Script::new(COMPARE_AND_SET_SCRIPT),
        })
    }

    fn token_key(&self, token_id: &str) -> String {
        format!("{}:token:{}", self.prefix, token_id)
    }

    fn user_key(&self, user_id: &str) -> String {
        format!("{}:user:{}", self.prefix, user_id)
    }
}

fn to_json(token: &SessionToken) -> Result<String> {
    serde_json::to_string(token).context("Failed to serialize session token")
}

fn from_json(json: &str) -> Result<SessionToken> {
    serde_json::from_str(json).context("Failed to deserialize session token")
}

#[async_trait]
impl TokenStore for RedisTokenStore {
    async fn get(&self, token_id: &str) -> Result<Option<SessionToken>> {
        let mut conn = self.connection.clone();

        let result: Option<String> = conn
            .get(self.token_key(token_id))
            .await
            .context("Failed to get session token from Redis")?;

        result.as_deref().map(from_json).transpose()
    }

    async fn put(&self, token: &SessionToken, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let json = to_json(token)?;

        let _: () = redis::pipe()
            .atomic()
            .set_ex(self.token_key(&token.token_id), json, ttl_seconds(ttl))
            .ignore()
            .sadd(self.user_key(&token.user_id), &token.token_id)
            .ignore()
            .query_async(&mut conn)
            .await
            .context("Failed to store session token in Redis")?;

        Ok(())
    }

    async fn compare_and_set(
        &self,
        expected: &SessionToken,
        new: &SessionToken,
        ttl: Duration,
    ) -> Result<bool> {
        ensure_same_key(expected, new)?;
        let mut conn = self.connection.clone();

        let swapped: i64 = self
            .cas_script
            .key(self.token_key(&expected.token_id))
            .arg(to_json(expected)?)
            .arg(to_json(new)?)
            .arg(ttl_seconds(ttl))
            .invoke_async(&mut conn)
            .await
            .context("Failed to compare-and-set session token in Redis")?;

        Ok(swapped == 1)
    }

    async fn delete(&self, token_id: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let key = self.token_key(token_id);

        // The owner is only known from the record itself
        let existing: Option<String> = conn
            .get(&key)
            .await
            .context("Failed to get session token from Redis")?;

        match existing.as_deref().map(from_json).transpose()? {
            Some(token) => {
                let _: () = redis::pipe()
                    .atomic()
                    .del(&key)
                    .ignore()
                    .srem(self.user_key(&token.user_id), token_id)
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .context("Failed to delete session token from Redis")?;
            }
            None => {
                let _: () = conn
                    .del(&key)
                    .await
                    .context("Failed to delete session token from Redis")?;
            }
        }

        Ok(())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<SessionToken>> {
        let mut conn = self.connection.clone();
        let user_key = self.user_key(user_id);

        let ids: Vec<String> = conn
            .smembers(&user_key)
            .await
            .context("Failed to read user token index from Redis")?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.token_key(id)).collect();
        let records: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .context("Failed to read session tokens from Redis")?;

        let mut tokens = Vec::with_capacity(ids.len());
        let mut stale = Vec::new();
        for (id, record) in ids.iter().zip(records) {
            match record {
                Some(json) => tokens.push(from_json(&json)?),
                None => stale.push(id.clone()),
            }
        }

        if !stale.is_empty() {
            tracing::debug!("Pruning {} expired entries from {}", stale.len(), user_key);
            let _: () = conn
                .srem(&user_key, stale)
                .await
                .context("Failed to prune user token index in Redis")?;
        }

        Ok(tokens)
    }
}
