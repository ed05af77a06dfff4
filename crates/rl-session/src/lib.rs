//! Revline diagnostic session.
//!
//! `SessionManager` drives one OBD-II adapter through connect, adaptive
//! polling and trouble-code commands, and publishes everything it learns
//! on `tokio::sync::watch` channels. Demo mode swaps the adapter for a
//! seeded simulator behind the same API.

pub mod codes;
pub mod config;
pub mod error;
pub mod link;
pub mod manager;
pub mod observe;
pub mod poller;
pub mod simulator;

pub use config::SessionConfig;
pub use error::{SessionError, SessionResult};
pub use manager::SessionManager;
