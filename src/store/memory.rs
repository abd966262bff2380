//! In-memory token store using moka
//!
//! Provides a fast, thread-safe in-process store with per-entry TTL.
//!
//! # Features
//! - Each record expires after the TTL given when it was written
//! - No size bound: an acknowledged write stays until its TTL elapses or it
//!   is deleted, never evicted to make room
//! - Atomic compare-and-set through moka's per-key compute API
//! - User listing by scanning live entries

use super::{ensure_same_key, TokenStore};
use crate::models::SessionToken;
use anyhow::Result;
use async_trait::async_trait;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use moka::Expiry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Stored record together with the TTL it was written with
#[derive(Clone)]
struct StoredToken {
    token: Arc<SessionToken>,
    ttl: Duration,
}

impl StoredToken {
    fn new(token: &SessionToken, ttl: Duration) -> Self {
        Self {
            token: Arc::new(token.clone()),
            ttl,
        }
    }
}

/// Expiry policy: every insert or overwrite restarts the clock with the
/// record's own TTL; reads leave it untouched.
struct PerRecordExpiry;

impl Expiry<String, StoredToken> for PerRecordExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredToken,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredToken,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-memory token store using moka
///
/// Growth is bounded by the per-record TTLs alone; records are never evicted
/// before their TTL elapses.
pub struct MemoryTokenStore {
    cache: Cache<String, StoredToken>,
}

impl std::fmt::Debug for MemoryTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTokenStore")
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}

impl MemoryTokenStore {
    /// Create a new memory store
    pub fn new() -> Self {
        let cache = Cache::builder().expire_after(PerRecordExpiry).build();

        Self { cache }
    }

    /// Get the current number of records in the store
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Process pending expirations and evictions
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

impl Default for MemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, token_id: &str) -> Result<Option<SessionToken>> {
        Ok(self
            .cache
            .get(token_id)
            .await
            .map(|stored| stored.token.as_ref().clone()))
    }

    async fn put(&self, token: &SessionToken, ttl: Duration) -> Result<()> {
        self.cache
            .insert(token.token_id.clone(), StoredToken::new(token, ttl))
            .await;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        expected: &SessionToken,
        new: &SessionToken,
        ttl: Duration,
    ) -> Result<bool> {
        ensure_same_key(expected, new)?;

        let replacement = StoredToken::new(new, ttl);
        let result = self
            .cache
            .entry(expected.token_id.clone())
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) if entry.value().token.as_ref() == expected => Op::Put(replacement),
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;

        Ok(matches!(result, CompResult::ReplacedWith(_)))
    }

    async fn delete(&self, token_id: &str) -> Result<()> {
        self.cache.invalidate(token_id).await;
        Ok(())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<SessionToken>> {
        // Scans every entry; the user index lives only in the distributed stores
        let tokens = self
            .cache
            .iter()
            .filter(|(_, stored)| stored.token.user_id == user_id)
            .map(|(_, stored)| stored.token.as_ref().clone())
            .collect();

        Ok(tokens)
    }
}
