//! Authentication: account registration, login, logout
//!
//! Successful logins install a session in the registry and announce the user
//! as online to its contact owners. Ending a session announces it offline.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::protocol::{ErrorCode, ErrorMessage, PresenceStatus};
use crate::server::presence::PresenceManager;
use crate::server::registry::{
    ConnectionId, OutboundHandle, RegistryError, Session, SessionRegistry,
};
use crate::store::{CredentialStore, StoreError, User};

pub const MIN_USERNAME_LEN: usize = 3;
pub const MAX_USERNAME_LEN: usize = 20;
pub const MIN_PASSWORD_LEN: usize = 4;

/// Login failures. `UnknownUser` and `BadPassword` look the same on the wire.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unknown user")]
    UnknownUser,

    #[error("wrong password")]
    BadPassword,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("username already taken: {0}")]
    UsernameTaken(String),

    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for RegisterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UsernameTaken(name) => RegisterError::UsernameTaken(name),
            other => RegisterError::Store(other),
        }
    }
}

/// Check registration input, returning the trimmed username
pub fn validate_registration(username: &str, password: &str) -> Result<String, String> {
    let username = username.trim();
    let len = username.chars().count();
    if !(MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&len) {
        return Err(format!(
            "Username must be {}-{} characters",
            MIN_USERNAME_LEN, MAX_USERNAME_LEN
        ));
    }
    if !username.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err("Username must be alphanumeric".to_string());
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        ));
    }
    Ok(username.to_owned())
}

pub struct AuthService {
    store: Arc<dyn CredentialStore>,
    registry: Arc<SessionRegistry>,
    presence: Arc<PresenceManager>,
    bcrypt_cost: u32,
    /// Verified against when the username is unknown, so both failure paths
    /// cost one bcrypt verification
    dummy_user: OnceCell<User>,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        registry: Arc<SessionRegistry>,
        presence: Arc<PresenceManager>,
        bcrypt_cost: u32,
    ) -> Self {
        Self {
            store,
            registry,
            presence,
            bcrypt_cost,
            dummy_user: OnceCell::new(),
        }
    }

    pub async fn register_account(
        &self,
        username: &str,
        password: &str,
    ) -> Result<User, RegisterError> {
        let username = validate_registration(username, password).map_err(RegisterError::Rejected)?;
        Ok(self.store.create_user(&username, password).await?)
    }

    /// Verify credentials and bind a session to the connection behind
    /// `outbound`. A session the user already had elsewhere is closed with
    /// `Superseded`.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        outbound: OutboundHandle,
    ) -> Result<Session, AuthError> {
        let username = username.trim();
        let user = match self.store.find_user(username).await? {
            Some(user) => user,
            None => {
                let dummy = self.dummy_user().await?;
                let _ = self.store.verify_password(dummy, password).await?;
                return Err(AuthError::UnknownUser);
            }
        };

        if !self.store.verify_password(&user, password).await? {
            return Err(AuthError::BadPassword);
        }

        let connection_id = outbound.connection_id();
        let (session, evicted) = self
            .registry
            .register(&user, outbound)
            .await
            .inspect_err(|e| error!("Cannot bind session for {}: {}", user.username, e))?;

        if let Some(old) = evicted {
            info!(
                "Closing superseded connection {} of {}",
                old.connection_id, old.username
            );
            old.outbound.close(Some(ErrorMessage::new(
                ErrorCode::Superseded,
                "Logged in from another connection",
            )));
        }

        info!("User logged in: {} (connection {})", session.username, connection_id);
        self.announce(&session, PresenceStatus::Online).await;
        Ok(session)
    }

    /// Explicit logout of a live session. Returns false if the session was
    /// already gone.
    pub async fn logout(&self, session: &Session) -> bool {
        let ended = self.disconnect(session.connection_id).await;
        if let Some(ended) = &ended {
            info!("User logged out: {}", ended.username);
        }
        ended.is_some()
    }

    /// Remove whatever session the connection owns and announce it offline.
    /// Safe to call more than once.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Option<Session> {
        let session = self.registry.unregister(connection_id).await?;
        self.announce(&session, PresenceStatus::Offline).await;
        Some(session)
    }

    async fn announce(&self, session: &Session, status: PresenceStatus) {
        if let Err(e) = self.presence.broadcast_presence(session, status).await {
            warn!("Presence broadcast for {} failed: {}", session.username, e);
        }
    }

    async fn dummy_user(&self) -> Result<&User, StoreError> {
        let cost = self.bcrypt_cost;
        self.dummy_user
            .get_or_try_init(|| async move {
                let password_hash =
                    tokio::task::spawn_blocking(move || bcrypt::hash("quickim-dummy", cost))
                        .await??;
                Ok::<_, StoreError>(User {
                    user_id: 0,
                    username: String::new(),
                    password_hash,
                })
            })
            .await
    }
}
