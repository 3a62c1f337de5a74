//! Credential and contact storage
//!
//! The server only talks to storage through [`CredentialStore`]. An
//! in-memory implementation backs the binary and the tests.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::UserId;

pub mod memory;

pub use memory::InMemoryCredentialStore;

/// A registered account. Never mutated once created.
#[derive(Clone, PartialEq, Eq)]
pub struct User {
    pub user_id: UserId,
    pub username: String,
    pub password_hash: String,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Storage failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("username already taken: {0}")]
    UsernameTaken(String),

    #[error("password hashing failed: {0}")]
    Hashing(#[from] bcrypt::BcryptError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result of a contact list mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactEdit {
    Done,
    /// No account with that username
    NotFound,
    AlreadyContact,
    NotAContact,
    SelfContact,
}

/// Narrow repository interface over accounts and contact edges.
///
/// Contacts are directed: `add_contact(a, "b")` lets `a` see `b`'s presence
/// and message `b`, nothing more.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up an account by exact username
    async fn find_user(&self, username: &str) -> Result<Option<User>, StoreError>;

    /// Check a plaintext password against the user's stored hash
    async fn verify_password(&self, user: &User, password: &str) -> Result<bool, StoreError>;

    /// Create an account, hashing the password. Fails with
    /// [`StoreError::UsernameTaken`] on a duplicate username.
    async fn create_user(&self, username: &str, password: &str) -> Result<User, StoreError>;

    /// Contacts owned by `user_id`, sorted by username
    async fn get_contacts(&self, user_id: UserId) -> Result<Vec<User>, StoreError>;

    /// Users that have `user_id` in their contact list
    async fn get_contact_owners(&self, user_id: UserId) -> Result<Vec<User>, StoreError>;

    async fn add_contact(
        &self,
        user_id: UserId,
        contact_username: &str,
    ) -> Result<ContactEdit, StoreError>;

    async fn remove_contact(
        &self,
        user_id: UserId,
        contact_username: &str,
    ) -> Result<ContactEdit, StoreError>;

    /// Case-insensitive substring search over usernames
    async fn search_users(
        &self,
        query: &str,
        exclude_user_id: UserId,
        limit: usize,
    ) -> Result<Vec<User>, StoreError>;
}
