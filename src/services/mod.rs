//! Services layer - Business logic
//!
//! This module contains the refresh token lifecycle:
//! - `session_token` - creation, rotation, reuse detection and revocation
//! - `clock` - injectable time source
//! - `token_id` - random token identifiers

pub mod clock;
pub mod session_token;
pub mod token_id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use session_token::{SessionTokenError, SessionTokenManager};
pub use token_id::generate_token_id;
