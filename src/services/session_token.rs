//! Session token service
//!
//! Implements the refresh token lifecycle on top of a [`TokenStore`]:
//! - Login issues a token that starts a new session family
//! - Every refresh rotates the presented token into a successor
//! - Presenting an already consumed token revokes every session of its owner
//! - Logout revokes one token or all of a user's tokens
//!
//! The manager keeps no state of its own. Everything lives in the store, so
//! any number of manager instances may share one store.

use crate::config::{ConfigError, SessionConfig};
use crate::models::{short_token_id, SessionToken};
use crate::services::clock::{Clock, SystemClock};
use crate::services::token_id::generate_token_id;
use crate::store::DynTokenStore;
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Compare-and-set attempts before giving up on revoking one record
const MAX_REVOKE_ATTEMPTS: usize = 3;

/// Error types for session token operations
#[derive(Debug, thiserror::Error)]
pub enum SessionTokenError {
    /// Token is unknown or the store already expired it
    #[error("Refresh token not found")]
    TokenNotFound,

    /// Token was consumed or explicitly revoked
    #[error("Refresh token has been revoked")]
    Revoked,

    /// An already revoked token was presented for rotation
    #[error("Refresh token reuse detected")]
    ReuseDetected,

    /// Absolute session lifetime has passed
    #[error("Refresh token expired")]
    Expired,

    /// Another rotation of the same token won the race
    #[error("Refresh token was rotated concurrently")]
    ConcurrentRotation,

    /// Store failure
    #[error("Token store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Outcome of revoking a single record
enum Revocation {
    /// The record was live and is now revoked
    Revoked(SessionToken),
    /// The record was already revoked; its grace window was restarted
    AlreadyRevoked(SessionToken),
    /// The record disappeared before it could be revoked
    Gone,
}

/// Session token manager
pub struct SessionTokenManager {
    store: DynTokenStore,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
}

impl SessionTokenManager {
    /// Create a manager using the system clock
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if the policy is unusable.
    pub fn new(store: DynTokenStore, config: SessionConfig) -> Result<Self, ConfigError> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Create a manager with a custom time source
    pub fn with_clock(
        store: DynTokenStore,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            store,
            config,
            clock,
        })
    }

    /// Get the session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn grace_ttl(&self) -> Duration {
        Duration::from_secs(self.config.reuse_grace_seconds)
    }

    fn absolute_expiry_from(&self, now: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
        let lifetime = chrono::Duration::from_std(Duration::from_secs(
            self.config.absolute_expiry_seconds,
        ))
        .context("Absolute expiry out of range")?;

        now.checked_add_signed(lifetime)
            .ok_or_else(|| anyhow!("Absolute expiry out of range"))
    }

    /// Issue a token for a fresh login.
    ///
    /// When the user already has `max_tokens_per_user` live sessions, the
    /// least recently used ones are revoked first to make room.
    pub async fn create(
        &self,
        user_id: &str,
        device_info: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<SessionToken, SessionTokenError> {
        self.enforce_capacity(user_id).await?;

        let now = self.clock.now();
        let token = SessionToken {
            token_id: generate_token_id()?,
            user_id: user_id.to_string(),
            created_at: now,
            last_used_at: now,
            absolute_expiry_at: self.absolute_expiry_from(now)?,
            inactivity_expiry_seconds: self.config.inactivity_expiry_seconds,
            revoked: false,
            replaced_by_token_id: None,
            device_info: device_info.map(str::to_string),
            ip_address: ip_address.map(str::to_string),
        };

        self.store.put(&token, token.effective_ttl(now)).await?;

        tracing::debug!(
            "Issued refresh token {} for user {}",
            token.short_id(),
            user_id
        );

        Ok(token)
    }

    /// Revoke the oldest live sessions until a new one fits under the cap
    async fn enforce_capacity(&self, user_id: &str) -> Result<(), SessionTokenError> {
        let now = self.clock.now();
        let mut live: Vec<SessionToken> = self
            .store
            .list_by_user(user_id)
            .await?
            .into_iter()
            .filter(|t| t.is_valid_at(now))
            .collect();

        let max = self.config.max_tokens_per_user;
        if live.len() < max {
            return Ok(());
        }

        live.sort_by_key(|t| t.last_used_at);
        let excess = (live.len() + 1).saturating_sub(max);

        for token in live.into_iter().take(excess) {
            tracing::info!(
                "Session limit ({}) reached for user {}, revoking oldest token {}",
                max,
                user_id,
                token.short_id()
            );
            self.revoke_record(token).await?;
        }

        Ok(())
    }

    /// Exchange a token for its successor.
    ///
    /// The presented token is revoked and kept for the grace window so that a
    /// later replay is recognized. The successor inherits the family's
    /// absolute expiry.
    ///
    /// # Errors
    /// - `TokenNotFound` if the token is unknown or already purged
    /// - `ReuseDetected` if the token was already revoked; every token of the
    ///   owner is revoked before this is returned
    /// - `Expired` if the family's absolute lifetime has passed
    /// - `ConcurrentRotation` if another rotation of the same token won
    pub async fn rotate(
        &self,
        token_id: &str,
        device_info: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<SessionToken, SessionTokenError> {
        let current = match self.store.get(token_id).await? {
            Some(token) => token,
            None => {
                tracing::debug!("Rotation of unknown token {}", short_token_id(token_id));
                return Err(SessionTokenError::TokenNotFound);
            }
        };

        if current.revoked {
            tracing::warn!(
                "Refresh token reuse detected for user {} (token {}), revoking all sessions",
                current.user_id,
                current.short_id()
            );
            self.revoke_all(&current.user_id).await?;
            return Err(SessionTokenError::ReuseDetected);
        }

        let now = self.clock.now();
        if current.is_expired_at(now) {
            tracing::debug!(
                "Refresh token {} passed its absolute expiry",
                current.short_id()
            );
            self.store.delete(token_id).await?;
            return Err(SessionTokenError::Expired);
        }

        let successor = SessionToken {
            token_id: generate_token_id()?,
            user_id: current.user_id.clone(),
            created_at: now,
            last_used_at: now,
            absolute_expiry_at: current.absolute_expiry_at,
            inactivity_expiry_seconds: current.inactivity_expiry_seconds,
            revoked: false,
            replaced_by_token_id: None,
            device_info: device_info
                .map(str::to_string)
                .or_else(|| current.device_info.clone()),
            ip_address: ip_address
                .map(str::to_string)
                .or_else(|| current.ip_address.clone()),
        };

        // The successor is stored before the predecessor points at it, so a
        // concurrent revoke_all that follows the pointer always finds it.
        self.store
            .put(&successor, successor.effective_ttl(now))
            .await?;

        let consumed = current.to_revoked(Some(successor.token_id.clone()));
        let swapped = self
            .store
            .compare_and_set(&current, &consumed, self.grace_ttl())
            .await?;

        if !swapped {
            tracing::warn!(
                "Concurrent rotation of token {} for user {}, discarding successor",
                current.short_id(),
                current.user_id
            );
            self.store.delete(&successor.token_id).await?;
            return Err(SessionTokenError::ConcurrentRotation);
        }

        tracing::debug!(
            "Rotated refresh token {} -> {} for user {}",
            current.short_id(),
            successor.short_id(),
            successor.user_id
        );

        Ok(successor)
    }

    /// Check a token without advancing its rotation chain
    pub async fn validate(&self, token_id: &str) -> Result<SessionToken, SessionTokenError> {
        let token = self
            .store
            .get(token_id)
            .await?
            .ok_or(SessionTokenError::TokenNotFound)?;

        if token.revoked {
            return Err(SessionTokenError::Revoked);
        }

        if token.is_expired_at(self.clock.now()) {
            return Err(SessionTokenError::Expired);
        }

        Ok(token)
    }

    /// Revoke a single token (logout of one session).
    ///
    /// Unknown and already revoked tokens are left alone.
    pub async fn revoke(&self, token_id: &str) -> Result<(), SessionTokenError> {
        let token = match self.store.get(token_id).await? {
            Some(token) if !token.revoked => token,
            _ => return Ok(()),
        };

        if let Revocation::Revoked(token) = self.revoke_record(token).await? {
            tracing::info!(
                "Revoked refresh token {} for user {}",
                token.short_id(),
                token.user_id
            );
        }

        Ok(())
    }

    /// Revoke every token owned by `user_id`.
    ///
    /// Already revoked tokens get a fresh grace window. Successors reachable
    /// through `replaced_by_token_id` are revoked as well, which covers a
    /// rotation that completed while the user's tokens were being listed.
    /// Every token is attempted even if some fail; the first failure is
    /// returned afterwards and the caller should retry.
    ///
    /// Returns the number of tokens that were live and are now revoked.
    pub async fn revoke_all(&self, user_id: &str) -> Result<usize, SessionTokenError> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut pending = self.store.list_by_user(user_id).await?;
        let mut newly_revoked = 0;
        let mut first_error: Option<anyhow::Error> = None;

        while !pending.is_empty() {
            pending.retain(|t| t.user_id == user_id && seen.insert(t.token_id.clone()));

            let results = join_all(pending.drain(..).map(|t| self.revoke_record(t))).await;

            let mut successors = Vec::new();
            for result in results {
                let record = match result {
                    Ok(Revocation::Revoked(token)) => {
                        newly_revoked += 1;
                        token
                    }
                    Ok(Revocation::AlreadyRevoked(token)) => token,
                    Ok(Revocation::Gone) => continue,
                    Err(e) => {
                        tracing::error!(
                            "Failed to revoke a token for user {}: {:#}",
                            user_id,
                            e
                        );
                        first_error.get_or_insert(e);
                        continue;
                    }
                };
                if let Some(next) = record.replaced_by_token_id {
                    if !seen.contains(&next) {
                        successors.push(next);
                    }
                }
            }

            for id in successors {
                match self.store.get(&id).await {
                    Ok(Some(token)) => pending.push(token),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(
                            "Failed to load successor token for user {}: {:#}",
                            user_id,
                            e
                        );
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(SessionTokenError::Store(e));
        }

        tracing::warn!(
            "Revoked all sessions for user {} ({} newly revoked)",
            user_id,
            newly_revoked
        );

        Ok(newly_revoked)
    }

    /// Mark one record revoked with the grace TTL.
    ///
    /// Retries on a lost compare-and-set against the freshly read record, so
    /// a concurrent rotation's successor pointer is never overwritten.
    async fn revoke_record(&self, token: SessionToken) -> anyhow::Result<Revocation> {
        let ttl = self.grace_ttl();
        let mut current = token;

        for _ in 0..MAX_REVOKE_ATTEMPTS {
            let revoked = current.to_revoked(None);
            if self.store.compare_and_set(&current, &revoked, ttl).await? {
                return Ok(if current.revoked {
                    Revocation::AlreadyRevoked(revoked)
                } else {
                    Revocation::Revoked(revoked)
                });
            }

            current = match self.store.get(&current.token_id).await? {
                Some(latest) => latest,
                None => return Ok(Revocation::Gone),
            };
        }

        Err(anyhow!(
            "Failed to revoke token {} after {} attempts",
            current.short_id(),
            MAX_REVOKE_ATTEMPTS
        ))
    }

    /// Live sessions for a user, most recently used first
    pub async fn active_sessions(
        &self,
        user_id: &str,
    ) -> Result<Vec<SessionToken>, SessionTokenError> {
        let now = self.clock.now();
        let mut sessions: Vec<SessionToken> = self
            .store
            .list_by_user(user_id)
            .await?
            .into_iter()
            .filter(|t| t.is_valid_at(now))
            .collect();

        sessions.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        Ok(sessions)
    }

    /// Permanently delete every record of a user, revoked ones included.
    ///
    /// Used when the account itself goes away. Returns the number of records
    /// deleted.
    pub async fn delete_all(&self, user_id: &str) -> Result<usize, SessionTokenError> {
        let tokens = self.store.list_by_user(user_id).await?;

        let results = join_all(tokens.iter().map(|t| self.store.delete(&t.token_id))).await;

        let mut deleted = 0;
        let mut first_error: Option<anyhow::Error> = None;
        for result in results {
            match result {
                Ok(()) => deleted += 1,
                Err(e) => {
                    tracing::error!("Failed to delete a token for user {}: {:#}", user_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(SessionTokenError::Store(e));
        }

        tracing::info!("Deleted {} token record(s) for user {}", deleted, user_id);
        Ok(deleted)
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use crate::store::{MemoryTokenStore, TokenStore};
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[derive(Debug, Clone)]
    enum Action {
        Create,
        Rotate(usize),
        Revoke(usize),
        RevokeAll,
        Advance(i64),
    }

    fn action_strategy() -> impl Strategy<Value = Action> {
        prop_oneof![
            Just(Action::Create),
            (0usize..16).prop_map(Action::Rotate),
            (0usize..16).prop_map(Action::Revoke),
            Just(Action::RevokeAll),
            (1i64..120).prop_map(Action::Advance),
        ]
    }

    fn setup() -> (SessionTokenManager, Arc<MemoryTokenStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryTokenStore::new());
        let clock = Arc::new(ManualClock::default());
        let config = SessionConfig {
            inactivity_expiry_seconds: 3600,
            absolute_expiry_seconds: 600,
            max_tokens_per_user: 3,
            reuse_grace_seconds: 3600,
        };
        let manager = SessionTokenManager::with_clock(store.clone(), config, clock.clone())
            .expect("valid session config");
        (manager, store, clock)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(30))]

        /// Once a token is revoked it never reads back as live, whatever
        /// sequence of operations follows.
        #[test]
        fn prop_revocation_is_monotonic(actions in prop::collection::vec(action_strategy(), 1..30)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let result: Result<(), TestCaseError> = rt.block_on(async {
                let (manager, store, clock) = setup();
                let mut issued: Vec<String> = Vec::new();
                let mut revoked: HashSet<String> = HashSet::new();

                for action in actions {
                    match action {
                        Action::Create => {
                            let token = manager.create("alice", None, None).await.unwrap();
                            issued.push(token.token_id);
                        }
                        Action::Rotate(i) if !issued.is_empty() => {
                            let id = issued[i % issued.len()].clone();
                            if let Ok(successor) = manager.rotate(&id, None, None).await {
                                issued.push(successor.token_id);
                            }
                        }
                        Action::Revoke(i) if !issued.is_empty() => {
                            let id = issued[i % issued.len()].clone();
                            manager.revoke(&id).await.unwrap();
                        }
                        Action::RevokeAll => {
                            manager.revoke_all("alice").await.unwrap();
                        }
                        Action::Advance(secs) => clock.advance(chrono::Duration::seconds(secs)),
                        _ => {}
                    }

                    for id in &issued {
                        if let Some(token) = store.get(id).await.unwrap() {
                            if revoked.contains(id) {
                                prop_assert!(token.revoked, "token became live again");
                            }
                            if token.revoked {
                                revoked.insert(id.clone());
                            }
                        }
                    }
                    prop_assert!(manager.active_sessions("alice").await.unwrap().len() <= 3);
                }
                Ok(())
            });
            result?;
        }

        /// Every token in a rotation chain shares the root's absolute expiry
        /// and the chain links each predecessor to its successor.
        #[test]
        fn prop_family_shares_absolute_expiry(steps in prop::collection::vec(0i64..60, 1..10)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let result: Result<(), TestCaseError> = rt.block_on(async {
                let (manager, store, clock) = setup();
                let root = manager.create("alice", None, None).await.unwrap();
                let mut chain: HashMap<String, SessionToken> = HashMap::new();
                let mut current = root.clone();

                for secs in steps {
                    clock.advance(chrono::Duration::seconds(secs));
                    let successor = manager.rotate(&current.token_id, None, None).await.unwrap();
                    prop_assert_eq!(successor.absolute_expiry_at, root.absolute_expiry_at);

                    let predecessor = store.get(&current.token_id).await.unwrap().unwrap();
                    prop_assert!(predecessor.revoked);
                    prop_assert_eq!(
                        predecessor.replaced_by_token_id.as_deref(),
                        Some(successor.token_id.as_str())
                    );

                    chain.insert(current.token_id.clone(), predecessor);
                    current = successor;
                }

                prop_assert!(chain.values().all(|t| t.absolute_expiry_at == root.absolute_expiry_at));
                let live = manager.active_sessions("alice").await.unwrap();
                prop_assert_eq!(live.len(), 1);
                prop_assert_eq!(&live[0].token_id, &current.token_id);
                Ok(())
            });
            result?;
        }
    }
}
