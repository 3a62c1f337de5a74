//! In-memory credential store with bcrypt password hashes

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{ContactEdit, CredentialStore, StoreError, User};
use crate::protocol::UserId;

#[derive(Debug, Default)]
struct StoreState {
    users: HashMap<UserId, User>,
    by_name: HashMap<String, UserId>,
    /// owner -> contacts
    contacts: HashMap<UserId, BTreeSet<UserId>>,
    next_user_id: UserId,
}

impl StoreState {
    fn user_by_name(&self, username: &str) -> Option<&User> {
        self.by_name.get(username).and_then(|id| self.users.get(id))
    }

    fn sorted_users<I>(&self, ids: I) -> Vec<User>
    where
        I: IntoIterator<Item = UserId>,
    {
        let mut users: Vec<User> = ids
            .into_iter()
            .filter_map(|id| self.users.get(&id).cloned())
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }
}

/// Volatile store; everything is lost when the process exits
#[derive(Debug)]
pub struct InMemoryCredentialStore {
    state: RwLock<StoreState>,
    bcrypt_cost: u32,
}

impl InMemoryCredentialStore {
    pub fn new(bcrypt_cost: u32) -> Self {
        Self {
            state: RwLock::new(StoreState {
                next_user_id: 1,
                ..Default::default()
            }),
            bcrypt_cost,
        }
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn find_user(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self.state.read().await.user_by_name(username).cloned())
    }

    async fn verify_password(&self, user: &User, password: &str) -> Result<bool, StoreError> {
        let password = password.to_owned();
        let hash = user.password_hash.clone();
        let valid = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await??;
        Ok(valid)
    }

    async fn create_user(&self, username: &str, password: &str) -> Result<User, StoreError> {
        if self.state.read().await.by_name.contains_key(username) {
            return Err(StoreError::UsernameTaken(username.to_owned()));
        }

        let cost = self.bcrypt_cost;
        let password = password.to_owned();
        let password_hash =
            tokio::task::spawn_blocking(move || bcrypt::hash(password, cost)).await??;

        // Re-check: another registration may have won while we were hashing
        let mut state = self.state.write().await;
        if state.by_name.contains_key(username) {
            return Err(StoreError::UsernameTaken(username.to_owned()));
        }

        let user_id = state.next_user_id;
        state.next_user_id += 1;

        let user = User {
            user_id,
            username: username.to_owned(),
            password_hash,
        };
        state.by_name.insert(user.username.clone(), user_id);
        state.users.insert(user_id, user.clone());

        info!("User registered: {} (id {})", user.username, user_id);
        Ok(user)
    }

    async fn get_contacts(&self, user_id: UserId) -> Result<Vec<User>, StoreError> {
        let state = self.state.read().await;
        let ids = state
            .contacts
            .get(&user_id)
            .map(|set| set.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(state.sorted_users(ids))
    }

    async fn get_contact_owners(&self, user_id: UserId) -> Result<Vec<User>, StoreError> {
        let state = self.state.read().await;
        let owners: Vec<UserId> = state
            .contacts
            .iter()
            .filter(|(_, set)| set.contains(&user_id))
            .map(|(owner, _)| *owner)
            .collect();
        Ok(state.sorted_users(owners))
    }

    async fn add_contact(
        &self,
        user_id: UserId,
        contact_username: &str,
    ) -> Result<ContactEdit, StoreError> {
        let mut state = self.state.write().await;
        let Some(contact_id) = state.user_by_name(contact_username).map(|u| u.user_id) else {
            return Ok(ContactEdit::NotFound);
        };
        if contact_id == user_id {
            return Ok(ContactEdit::SelfContact);
        }

        let inserted = state.contacts.entry(user_id).or_default().insert(contact_id);
        if inserted {
            debug!("User {} added contact {}", user_id, contact_id);
            Ok(ContactEdit::Done)
        } else {
            Ok(ContactEdit::AlreadyContact)
        }
    }

    async fn remove_contact(
        &self,
        user_id: UserId,
        contact_username: &str,
    ) -> Result<ContactEdit, StoreError> {
        let mut state = self.state.write().await;
        let Some(contact_id) = state.user_by_name(contact_username).map(|u| u.user_id) else {
            return Ok(ContactEdit::NotFound);
        };

        let removed = state
            .contacts
            .get_mut(&user_id)
            .is_some_and(|set| set.remove(&contact_id));
        if removed {
            debug!("User {} removed contact {}", user_id, contact_id);
            Ok(ContactEdit::Done)
        } else {
            Ok(ContactEdit::NotAContact)
        }
    }

    async fn search_users(
        &self,
        query: &str,
        exclude_user_id: UserId,
        limit: usize,
    ) -> Result<Vec<User>, StoreError> {
        let needle = query.to_lowercase();
        let state = self.state.read().await;
        let matches: Vec<UserId> = state
            .users
            .values()
            .filter(|u| u.user_id != exclude_user_id)
            .filter(|u| u.username.to_lowercase().contains(&needle))
            .map(|u| u.user_id)
            .collect();

        let mut users = state.sorted_users(matches);
        users.truncate(limit);
        Ok(users)
    }
}
