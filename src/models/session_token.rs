//! Session token model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Refresh credential handed to a client and exchanged for access tokens.
///
/// A token is immutable apart from `revoked`, which only ever moves from
/// `false` to `true`, and `replaced_by_token_id`, which is set once when the
/// token is consumed by a rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    /// Opaque random identifier; both the store key and the client-facing value
    pub token_id: String,
    /// Owning principal
    pub user_id: String,
    /// When this token was minted
    pub created_at: DateTime<Utc>,
    /// When the rotation (or login) that produced this token happened
    pub last_used_at: DateTime<Utc>,
    /// Ceiling shared by every token of the session family
    pub absolute_expiry_at: DateTime<Utc>,
    /// Sliding window length, copied across rotations
    pub inactivity_expiry_seconds: u64,
    /// Whether the token has been consumed or explicitly revoked
    pub revoked: bool,
    /// Successor issued when this token was rotated
    pub replaced_by_token_id: Option<String>,
    /// Advisory client description
    pub device_info: Option<String>,
    /// Advisory client address
    pub ip_address: Option<String>,
}

impl SessionToken {
    /// Check the validity predicate: not revoked and before the absolute ceiling.
    ///
    /// Inactivity is not checked here; the store drops the record once the
    /// sliding window elapses.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.is_expired_at(now)
    }

    /// Check if the absolute ceiling has been reached
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.absolute_expiry_at
    }

    /// Whole seconds left until the absolute ceiling, zero once passed
    pub fn remaining_absolute_seconds(&self, now: DateTime<Utc>) -> u64 {
        (self.absolute_expiry_at - now).num_seconds().max(0) as u64
    }

    /// TTL handed to the store: the shorter of the sliding window and the time
    /// left before the absolute ceiling.
    ///
    /// Rounded up to whole seconds and never below one second, so every store
    /// engine keeps the record for the same span. A record may outlive its
    /// ceiling by less than a second; `is_expired_at` still rejects it.
    pub fn effective_ttl(&self, now: DateTime<Utc>) -> Duration {
        let remaining_ms = (self.absolute_expiry_at - now).num_milliseconds().max(0) as u64;
        let seconds = self
            .inactivity_expiry_seconds
            .min(remaining_ms.div_ceil(1000))
            .max(1);
        Duration::from_secs(seconds)
    }

    /// Copy of this token marked revoked, optionally pointing at its successor
    pub fn to_revoked(&self, replaced_by: Option<String>) -> Self {
        Self {
            revoked: true,
            replaced_by_token_id: replaced_by.or_else(|| self.replaced_by_token_id.clone()),
            ..self.clone()
        }
    }

    /// Short, log-safe form of the identifier
    pub fn short_id(&self) -> &str {
        short_token_id(&self.token_id)
    }
}

/// Truncate a token identifier for logging; full identifiers are credentials.
pub fn short_token_id(token_id: &str) -> &str {
    let end = token_id
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(token_id.len());
    &token_id[..end]
}
