//! Database layer
//!
//! Backs the `database` token store. Supports:
//! - SQLite (default, single-node deployment)
//! - MySQL (shared between service instances)
//!
//! The database driver is selected based on configuration.

pub mod migrations;
pub mod pool;

pub use pool::{create_pool, create_test_pool, DatabasePool};
