//! Data models
//!
//! This module contains the data structures shared by the token stores and
//! the session token manager.

mod session_token;

pub use session_token::{short_token_id, SessionToken};
