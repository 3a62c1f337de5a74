//! QuickIM: instant-messaging server core
//!
//! Clients speak a length-prefixed binary protocol over TCP. The server keeps
//! one live session per user, delivers messages only between contacts that
//! are online, and pushes presence changes to the users who list someone as
//! a contact.

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod store;

pub use client::{ClientConfig, ImClient};
pub use config::ServerConfig;
pub use error::{ImError, Result};
pub use server::{ImServer, ServerContext, ServerStats};
pub use store::{CredentialStore, InMemoryCredentialStore, User};

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
