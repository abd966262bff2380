//! Refresh Guard - Refresh token rotation with reuse detection
//!
//! This library issues long-lived refresh tokens, rotates them on every use,
//! and treats replay of a consumed token as a compromise signal.
//!
//! ```rust,ignore
//! use refresh_guard::config::Config;
//! use refresh_guard::services::SessionTokenManager;
//! use refresh_guard::store::create_store;
//!
//! let config = Config::load_with_env(std::path::Path::new("config.yml"))?;
//! let store = create_store(&config).await?;
//! let manager = SessionTokenManager::new(store, config.session.clone())?;
//!
//! let token = manager.create("user-42", Some("Firefox"), None).await?;
//! let next = manager.rotate(&token.token_id, None, None).await?;
//! ```

pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod store;
