//! Presence and contact management
//!
//! Presence changes are pushed to the users that have the affected user as a
//! contact and are currently online. Contact list edits and user search are
//! served here as well.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::protocol::{
    ContactAction, ContactActionResponse, ContactActionStatus, ContactEntry, Encodable,
    PresenceStatus, PresenceUpdate, UserId, UserSearchResponse,
};
use crate::server::registry::{Session, SessionRegistry};
use crate::store::{ContactEdit, CredentialStore, User};

/// Most usernames returned by one search
pub const SEARCH_LIMIT: usize = 20;

impl From<ContactEdit> for ContactActionStatus {
    fn from(edit: ContactEdit) -> Self {
        match edit {
            ContactEdit::Done => ContactActionStatus::Ok,
            ContactEdit::NotFound => ContactActionStatus::NotFound,
            ContactEdit::AlreadyContact => ContactActionStatus::AlreadyPresent,
            ContactEdit::NotAContact => ContactActionStatus::NotPresent,
            ContactEdit::SelfContact => ContactActionStatus::SelfContact,
        }
    }
}

pub struct PresenceManager {
    store: Arc<dyn CredentialStore>,
    registry: Arc<SessionRegistry>,
}

impl PresenceManager {
    pub fn new(store: Arc<dyn CredentialStore>, registry: Arc<SessionRegistry>) -> Self {
        Self { store, registry }
    }

    pub async fn get_contacts(&self, user_id: UserId) -> Result<Vec<User>> {
        Ok(self.store.get_contacts(user_id).await?)
    }

    /// Tell every online user who has the session's user as a contact about
    /// its new status. Nothing is sent if the status is already out of date.
    /// Returns how many were notified.
    pub async fn broadcast_presence(
        &self,
        subject: &Session,
        status: PresenceStatus,
    ) -> Result<usize> {
        let owners = self.store.get_contact_owners(subject.user_id).await?;
        if owners.is_empty() {
            return Ok(0);
        }

        let frame = PresenceUpdate {
            username: subject.username.clone(),
            status,
        }
        .encode_frame()?;
        let recipients: Vec<UserId> = owners.iter().map(|owner| owner.user_id).collect();

        let notified = self
            .registry
            .fan_out_presence(subject, status, &recipients, &frame)
            .await;

        debug!(
            "{} is {}, notified {} contact owners",
            subject.username, status, notified
        );
        Ok(notified)
    }

    /// Contacts of `user_id` with their live status, sorted by username
    pub async fn list_contact_status(&self, user_id: UserId) -> Result<Vec<ContactEntry>> {
        let contacts = self.store.get_contacts(user_id).await?;
        let mut entries = Vec::with_capacity(contacts.len());
        for contact in contacts {
            let status = if self.registry.is_online(contact.user_id).await {
                PresenceStatus::Online
            } else {
                PresenceStatus::Offline
            };
            entries.push(ContactEntry {
                username: contact.username,
                status,
            });
        }
        Ok(entries)
    }

    pub async fn add_contact(&self, owner: &Session, username: &str) -> Result<ContactActionResponse> {
        let username = username.trim();
        let edit = self.store.add_contact(owner.user_id, username).await?;
        if edit == ContactEdit::Done {
            info!("{} added contact {}", owner.username, username);
        }
        Ok(ContactActionResponse {
            action: ContactAction::Add,
            status: edit.into(),
            username: username.to_owned(),
        })
    }

    pub async fn remove_contact(
        &self,
        owner: &Session,
        username: &str,
    ) -> Result<ContactActionResponse> {
        let username = username.trim();
        let edit = self.store.remove_contact(owner.user_id, username).await?;
        if edit == ContactEdit::Done {
            info!("{} removed contact {}", owner.username, username);
        }
        Ok(ContactActionResponse {
            action: ContactAction::Remove,
            status: edit.into(),
            username: username.to_owned(),
        })
    }

    /// Usernames containing `query`, excluding the requester
    pub async fn search_users(&self, owner: &Session, query: &str) -> Result<UserSearchResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(UserSearchResponse::default());
        }

        let users = self
            .store
            .search_users(query, owner.user_id, SEARCH_LIMIT)
            .await?;
        Ok(UserSearchResponse {
            usernames: users.into_iter().map(|u| u.username).collect(),
        })
    }
}
