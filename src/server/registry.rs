//! Session registry: who is online and how to reach them
//!
//! One lock guards three indices (user id, username, connection id) that are
//! always updated together, so every operation is atomic with respect to the
//! others. Outbound frames are pushed onto a connection's send queue while the
//! lock is held; a frame is never enqueued for a session that has already been
//! removed.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use thiserror::Error;
#[cfg(test)]
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DEFAULT_SEND_QUEUE_CAPACITY;
use crate::current_timestamp;
use crate::protocol::{Encodable, ErrorCode, ErrorMessage, Frame, PresenceStatus, UserId};
use crate::store::User;

/// Unique id of one accepted TCP connection
pub type ConnectionId = Uuid;

/// Items on a connection's send queue
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Write this frame
    Frame(Frame),
    /// Flush what is queued, write the optional error, then close the socket
    Close(Option<ErrorMessage>),
}

/// Shared between both ends of one send queue
#[derive(Debug, Default)]
struct QueueSignals {
    /// Cancelled as soon as a close is requested; the reader stops taking
    /// new frames
    closing: CancellationToken,
    /// Cancelled when the backlog is to be dropped instead of flushed
    aborted: CancellationToken,
    abort_reason: OnceLock<ErrorMessage>,
}

/// Sending side of a connection's bounded FIFO send queue
#[derive(Debug, Clone)]
pub struct OutboundHandle {
    connection_id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    signals: Arc<QueueSignals>,
}

impl OutboundHandle {
    /// Create a handle for a fresh connection along with the queue's receiver
    pub fn new(connection_id: ConnectionId) -> (Self, OutboundQueue) {
        Self::with_capacity(connection_id, DEFAULT_SEND_QUEUE_CAPACITY)
    }

    pub fn with_capacity(connection_id: ConnectionId, capacity: usize) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let signals = Arc::new(QueueSignals::default());
        let queue = OutboundQueue {
            rx,
            signals: Arc::clone(&signals),
        };
        (
            Self {
                connection_id,
                tx,
                signals,
            },
            queue,
        )
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue a frame. Returns false if the connection is closing or its
    /// writer is gone. A full queue means the peer stopped reading: the
    /// connection is dropped with `QueueOverflow`.
    pub fn send_frame(&self, frame: Frame) -> bool {
        if self.signals.aborted.is_cancelled() {
            return false;
        }
        match self.tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Send queue of {} is full, dropping the connection",
                    self.connection_id
                );
                self.abort(Some(ErrorMessage::new(
                    ErrorCode::QueueOverflow,
                    "Send queue full",
                )));
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Encode and queue a message
    pub fn send<M: Encodable>(&self, msg: &M) -> bool {
        match msg.encode_frame() {
            Ok(frame) => self.send_frame(frame),
            Err(e) => {
                error!(
                    "Failed to encode {:?} for {}: {}",
                    msg.frame_type(),
                    self.connection_id,
                    e
                );
                false
            }
        }
    }

    /// Ask the writer to flush and close the connection. With no room left
    /// for the request, the backlog is dropped instead.
    pub fn close(&self, error: Option<ErrorMessage>) -> bool {
        let requested = match self.tx.try_send(Outbound::Close(error)) {
            Ok(()) => true,
            Err(TrySendError::Full(Outbound::Close(error))) => {
                self.abort(error);
                true
            }
            Err(_) => false,
        };
        self.signals.closing.cancel();
        requested
    }

    /// True once a close was requested or the writer is gone
    pub fn is_closing(&self) -> bool {
        self.signals.closing.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once a close was requested
    pub async fn closing(&self) {
        self.signals.closing.cancelled().await
    }

    fn abort(&self, reason: Option<ErrorMessage>) {
        if let Some(reason) = reason {
            let _ = self.signals.abort_reason.set(reason);
        }
        self.signals.aborted.cancel();
        self.signals.closing.cancel();
    }
}

/// Receiving side of a send queue, owned by the connection's writer
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Outbound>,
    signals: Arc<QueueSignals>,
}

impl OutboundQueue {
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Result<Outbound, TryRecvError> {
        self.rx.try_recv()
    }

    /// Refuse anything sent from now on
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Cancelled when the writer must stop without flushing
    pub fn abort_token(&self) -> CancellationToken {
        self.signals.aborted.clone()
    }

    /// The error to send the peer after an abort, if one was given
    pub fn abort_reason(&self) -> Option<ErrorMessage> {
        self.signals.abort_reason.get().cloned()
    }
}

/// Live binding between an authenticated user and one connection
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: UserId,
    pub username: String,
    pub connection_id: ConnectionId,
    /// Unix ms
    pub authenticated_at: u64,
    pub outbound: OutboundHandle,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection {connection_id} is already bound to user {user_id}")]
    ConnectionAlreadyBound {
        connection_id: ConnectionId,
        user_id: UserId,
    },
}

#[derive(Debug, Default)]
struct RegistryState {
    by_user: HashMap<UserId, Session>,
    by_name: HashMap<String, UserId>,
    by_conn: HashMap<ConnectionId, UserId>,
}

impl RegistryState {
    fn remove_user(&mut self, user_id: UserId) -> Option<Session> {
        let session = self.by_user.remove(&user_id)?;
        self.by_name.remove(&session.username);
        self.by_conn.remove(&session.connection_id);
        Some(session)
    }

    fn session_by_name(&self, username: &str) -> Option<&Session> {
        self.by_name
            .get(username)
            .and_then(|user_id| self.by_user.get(user_id))
    }
}

/// Authoritative map of online users
#[derive(Debug, Default)]
pub struct SessionRegistry {
    state: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session for `user` on the given connection.
    ///
    /// An existing session for the same user is detached and returned; the
    /// caller is responsible for closing its connection.
    pub async fn register(
        &self,
        user: &User,
        outbound: OutboundHandle,
    ) -> Result<(Session, Option<Session>), RegistryError> {
        let connection_id = outbound.connection_id();
        let mut state = self.state.write().await;

        if let Some(bound) = state.by_conn.get(&connection_id) {
            return Err(RegistryError::ConnectionAlreadyBound {
                connection_id,
                user_id: *bound,
            });
        }

        let evicted = state.remove_user(user.user_id);
        if let Some(old) = &evicted {
            info!(
                "Session {} for {} superseded by connection {}",
                old.session_id, old.username, connection_id
            );
        }

        let session = Session {
            session_id: Uuid::new_v4(),
            user_id: user.user_id,
            username: user.username.clone(),
            connection_id,
            authenticated_at: current_timestamp(),
            outbound,
        };

        state.by_name.insert(session.username.clone(), session.user_id);
        state.by_conn.insert(connection_id, session.user_id);
        state.by_user.insert(session.user_id, session.clone());

        debug!(
            "Registered session {} for {} ({} online)",
            session.session_id,
            session.username,
            state.by_user.len()
        );
        Ok((session, evicted))
    }

    /// Remove the session owning `connection_id`, if any. Idempotent; a
    /// connection whose session was superseded owns nothing and removes
    /// nothing.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<Session> {
        let mut state = self.state.write().await;
        let user_id = *state.by_conn.get(&connection_id)?;
        let session = state.remove_user(user_id);
        if let Some(session) = &session {
            debug!(
                "Unregistered session {} for {}",
                session.session_id, session.username
            );
        }
        session
    }

    pub async fn lookup_by_username(&self, username: &str) -> Option<Session> {
        self.state.read().await.session_by_name(username).cloned()
    }

    pub async fn lookup_by_user_id(&self, user_id: UserId) -> Option<Session> {
        self.state.read().await.by_user.get(&user_id).cloned()
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.state.read().await.by_user.contains_key(&user_id)
    }

    pub async fn online_count(&self) -> usize {
        self.state.read().await.by_user.len()
    }

    /// Enqueue a frame for the user with this name. False if offline or the
    /// connection is already shutting down.
    pub async fn send_to_username(&self, username: &str, frame: Frame) -> bool {
        let state = self.state.read().await;
        match state.session_by_name(username) {
            Some(session) => session.outbound.send_frame(frame),
            None => false,
        }
    }

    /// Enqueue a frame for the user with this id
    pub async fn send_to_user(&self, user_id: UserId, frame: Frame) -> bool {
        let state = self.state.read().await;
        match state.by_user.get(&user_id) {
            Some(session) => session.outbound.send_frame(frame),
            None => false,
        }
    }

    /// Push a presence `frame` about `subject` to every online user in
    /// `recipients`, but only while `status` is still true: `Online` while
    /// `subject` is the user's current session, `Offline` while the user has
    /// none. Check and enqueue happen under one lock, so a stale update can
    /// never land behind a newer one. Returns how many were notified.
    pub async fn fan_out_presence(
        &self,
        subject: &Session,
        status: PresenceStatus,
        recipients: &[UserId],
        frame: &Frame,
    ) -> usize {
        let state = self.state.read().await;
        let current = state.by_user.get(&subject.user_id);
        let still_true = match status {
            PresenceStatus::Online => current.is_some_and(|s| s.session_id == subject.session_id),
            PresenceStatus::Offline => current.is_none(),
        };
        if !still_true {
            debug!(
                "Dropping stale {} update for session {} of {}",
                status, subject.session_id, subject.username
            );
            return 0;
        }

        recipients
            .iter()
            .filter_map(|user_id| state.by_user.get(user_id))
            .filter(|session| session.outbound.send_frame(frame.clone()))
            .count()
    }

    /// Remove every session, for server shutdown
    pub async fn drain(&self) -> Vec<Session> {
        let mut state = self.state.write().await;
        state.by_name.clear();
        state.by_conn.clear();
        state.by_user.drain().map(|(_, session)| session).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::protocol::{Decodable, FrameType, Ping, PresenceUpdate};

    fn user(user_id: UserId, username: &str) -> User {
        User {
            user_id,
            username: username.to_string(),
            password_hash: String::new(),
        }
    }

    fn connection() -> (OutboundHandle, OutboundQueue) {
        OutboundHandle::new(Uuid::new_v4())
    }

    fn presence_frame(username: &str, status: PresenceStatus) -> Frame {
        PresenceUpdate {
            username: username.to_string(),
            status,
        }
        .encode_frame()
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = connection();
        let conn_id = handle.connection_id();

        let (session, evicted) = registry.register(&user(1, "alice"), handle).await.unwrap();
        assert!(evicted.is_none());
        assert_eq!(session.connection_id, conn_id);

        assert!(registry.is_online(1).await);
        assert_eq!(registry.online_count().await, 1);
        assert_eq!(
            registry.lookup_by_username("alice").await.unwrap().session_id,
            session.session_id
        );
        assert_eq!(
            registry.lookup_by_user_id(1).await.unwrap().username,
            "alice"
        );
        assert!(registry.lookup_by_username("bob").await.is_none());
    }

    #[tokio::test]
    async fn test_second_login_supersedes() {
        let registry = SessionRegistry::new();
        let alice = user(1, "alice");
        let (first, _rx1) = connection();
        let (second, _rx2) = connection();
        let first_conn = first.connection_id();
        let second_conn = second.connection_id();

        let (old, _) = registry.register(&alice, first).await.unwrap();
        let (new, evicted) = registry.register(&alice, second).await.unwrap();

        let evicted = evicted.unwrap();
        assert_eq!(evicted.session_id, old.session_id);
        assert_eq!(evicted.connection_id, first_conn);
        assert_eq!(registry.online_count().await, 1);
        assert_eq!(
            registry.lookup_by_username("alice").await.unwrap().connection_id,
            second_conn
        );

        // Teardown of the superseded connection must not remove the new session
        assert!(registry.unregister(first_conn).await.is_none());
        assert_eq!(
            registry.lookup_by_user_id(1).await.unwrap().session_id,
            new.session_id
        );
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = connection();
        let conn_id = handle.connection_id();
        registry.register(&user(1, "alice"), handle).await.unwrap();

        assert!(registry.unregister(conn_id).await.is_some());
        assert!(registry.unregister(conn_id).await.is_none());
        assert!(!registry.is_online(1).await);
        assert!(registry.lookup_by_username("alice").await.is_none());
    }

    #[tokio::test]
    async fn test_connection_already_bound() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = connection();
        registry
            .register(&user(1, "alice"), handle.clone())
            .await
            .unwrap();

        let result = registry.register(&user(2, "bob"), handle).await;
        assert!(matches!(
            result,
            Err(RegistryError::ConnectionAlreadyBound { user_id: 1, .. })
        ));
        assert!(!registry.is_online(2).await);
    }

    #[tokio::test]
    async fn test_concurrent_logins_distinct_users() {
        let registry = Arc::new(SessionRegistry::new());
        let mut tasks = Vec::new();
        let mut receivers = Vec::new();

        for i in 0..50u64 {
            let (handle, rx) = connection();
            receivers.push(rx);
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let u = user(i % 20, &format!("user{}", i % 20));
                registry.register(&u, handle).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.online_count().await, 20);
    }

    #[tokio::test]
    async fn test_send_to_user_preserves_order() {
        let registry = SessionRegistry::new();
        let (handle, mut rx) = connection();
        registry.register(&user(1, "alice"), handle).await.unwrap();

        for nonce in 0..5 {
            let frame = Ping { nonce }.encode_frame().unwrap();
            assert!(registry.send_to_username("alice", frame).await);
        }

        for expected in 0..5u64 {
            match rx.recv().await.unwrap() {
                Outbound::Frame(frame) => {
                    assert_eq!(frame.frame_type, FrameType::Ping);
                    assert_eq!(&frame.payload[..], &expected.to_be_bytes());
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_send_to_offline_or_closed() {
        let registry = SessionRegistry::new();
        let frame = Ping { nonce: 1 }.encode_frame().unwrap();
        assert!(!registry.send_to_user(1, frame.clone()).await);

        let (handle, rx) = connection();
        registry.register(&user(1, "alice"), handle).await.unwrap();
        drop(rx);
        assert!(!registry.send_to_user(1, frame).await);
    }

    #[tokio::test]
    async fn test_full_queue_drops_connection() {
        let registry = SessionRegistry::new();
        let (handle, mut queue) = OutboundHandle::with_capacity(Uuid::new_v4(), 2);
        registry.register(&user(1, "alice"), handle.clone()).await.unwrap();
        let abort = queue.abort_token();

        let frame = Ping { nonce: 1 }.encode_frame().unwrap();
        assert!(registry.send_to_user(1, frame.clone()).await);
        assert!(registry.send_to_user(1, frame.clone()).await);
        assert!(!abort.is_cancelled());

        assert!(!registry.send_to_user(1, frame.clone()).await);
        assert!(abort.is_cancelled());
        assert!(handle.is_closing());
        assert_eq!(
            queue.abort_reason().map(|e| e.code),
            Some(ErrorCode::QueueOverflow)
        );

        // Once aborted nothing more is accepted, even with room again
        queue.try_recv().unwrap();
        assert!(!registry.send_to_user(1, frame).await);
    }

    #[tokio::test]
    async fn test_close_on_full_queue_aborts() {
        let (handle, queue) = OutboundHandle::with_capacity(Uuid::new_v4(), 1);
        assert!(handle.send(&Ping { nonce: 1 }));
        assert!(!handle.is_closing());

        let reason = ErrorMessage::new(ErrorCode::IdleTimeout, "Idle timeout");
        assert!(handle.close(Some(reason)));
        assert!(handle.is_closing());
        assert!(queue.abort_token().is_cancelled());
        assert_eq!(
            queue.abort_reason().map(|e| e.code),
            Some(ErrorCode::IdleTimeout)
        );
    }

    #[tokio::test]
    async fn test_close_marks_closing() {
        let (handle, mut queue) = connection();
        handle.close(None);
        assert!(handle.is_closing());
        assert!(!queue.abort_token().is_cancelled());
        assert!(matches!(queue.try_recv().unwrap(), Outbound::Close(None)));
    }

    #[tokio::test]
    async fn test_stale_presence_not_sent() {
        let registry = SessionRegistry::new();
        let (watcher, mut watcher_rx) = connection();
        registry.register(&user(1, "alice"), watcher).await.unwrap();

        let (first, _rx1) = connection();
        let (second, _rx2) = connection();
        let (old, _) = registry.register(&user(2, "bob"), first).await.unwrap();
        let (new, _) = registry.register(&user(2, "bob"), second).await.unwrap();

        let online = presence_frame("bob", PresenceStatus::Online);
        let offline = presence_frame("bob", PresenceStatus::Offline);

        // The superseded session is no longer the one online
        let sent = registry
            .fan_out_presence(&old, PresenceStatus::Online, &[1], &online)
            .await;
        assert_eq!(sent, 0);
        // bob is still online through the new session
        let sent = registry
            .fan_out_presence(&old, PresenceStatus::Offline, &[1], &offline)
            .await;
        assert_eq!(sent, 0);
        assert!(watcher_rx.try_recv().is_err());

        registry.unregister(new.connection_id).await.unwrap();
        let sent = registry
            .fan_out_presence(&new, PresenceStatus::Offline, &[1], &offline)
            .await;
        assert_eq!(sent, 1);
        // An Online that lost the race with the disconnect stays unsent
        let sent = registry
            .fan_out_presence(&new, PresenceStatus::Online, &[1], &online)
            .await;
        assert_eq!(sent, 0);

        match watcher_rx.try_recv().unwrap() {
            Outbound::Frame(frame) => {
                let update = PresenceUpdate::decode_frame(&frame).unwrap();
                assert_eq!(update.status, PresenceStatus::Offline);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(watcher_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drain() {
        let registry = SessionRegistry::new();
        let (a, _rxa) = connection();
        let (b, _rxb) = connection();
        registry.register(&user(1, "alice"), a).await.unwrap();
        registry.register(&user(2, "bob"), b).await.unwrap();

        let drained = registry.drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.online_count().await, 0);
        assert!(registry.lookup_by_username("bob").await.is_none());
    }
}
