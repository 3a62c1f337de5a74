//! Per-connection handler
//!
//! Each accepted socket is split in two: the handler task owns the read half
//! and runs the decode/dispatch loop, a writer task owns the write half and
//! drains the connection's FIFO send queue. Every outbound frame, replies and
//! deliveries from other sessions alike, goes through that queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ImError;
use crate::protocol::*;
use crate::server::auth::{AuthError, RegisterError};
use crate::server::listener::ServerContext;
use crate::server::registry::{ConnectionId, Outbound, OutboundHandle, OutboundQueue, Session};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// What the read loop does after a frame has been handled
#[derive(Debug)]
enum Flow {
    Continue,
    /// End the connection, optionally telling the peer why
    Close(Option<ErrorMessage>),
}

/// Drives one client connection from accept to teardown
pub struct ConnectionHandler {
    ctx: Arc<ServerContext>,
    connection_id: ConnectionId,
    remote_addr: SocketAddr,
    outbound: OutboundHandle,
    outbound_rx: Option<OutboundQueue>,
    /// Set once the connection has logged in
    session: Option<Session>,
    /// Child of the server's shutdown token; also cancelled by the writer
    /// once the socket is closed
    cancel: CancellationToken,
    created_at: Instant,
}

impl ConnectionHandler {
    pub fn new(ctx: Arc<ServerContext>, remote_addr: SocketAddr) -> Self {
        let connection_id = Uuid::new_v4();
        let (outbound, outbound_rx) =
            OutboundHandle::with_capacity(connection_id, ctx.config.send_queue_capacity);
        let cancel = ctx.shutdown.child_token();

        Self {
            ctx,
            connection_id,
            remote_addr,
            outbound,
            outbound_rx: Some(outbound_rx),
            session: None,
            cancel,
            created_at: Instant::now(),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Run the connection to completion. Teardown happens exactly once, here,
    /// whatever ended the read loop.
    pub async fn run(mut self, stream: TcpStream) {
        info!("New connection {} from {}", self.connection_id, self.remote_addr);

        let (reader, writer) = stream.into_split();
        let Some(outbound_rx) = self.outbound_rx.take() else {
            error!("Connection {} started twice", self.connection_id);
            return;
        };
        let write_timeout = self.ctx.config.write_timeout;
        let mut writer_task = tokio::spawn(write_loop(
            writer,
            outbound_rx,
            self.cancel.clone(),
            self.connection_id,
            write_timeout,
        ));

        let close_error = self.read_loop(reader).await;

        // Flush what is queued, then release the session. Deliveries racing
        // with the close are discarded along with the queue. A close that was
        // already requested from outside carries its own error.
        if close_error.is_some() || !self.outbound.is_closing() {
            self.outbound.close(close_error);
        }
        if tokio::time::timeout(write_timeout, &mut writer_task)
            .await
            .is_err()
        {
            warn!(
                "Connection {} did not flush within {:?}, aborting writer",
                self.connection_id, write_timeout
            );
            writer_task.abort();
        }

        if let Some(session) = self.ctx.auth.disconnect(self.connection_id).await {
            info!("User {} disconnected", session.username);
        }
        self.session = None;

        info!(
            "Connection {} from {} closed after {:?}",
            self.connection_id,
            self.remote_addr,
            self.created_at.elapsed()
        );
    }

    /// Read, decode and dispatch until the connection should close. Returns
    /// the error frame to send on the way out, if any.
    async fn read_loop(&mut self, mut reader: OwnedReadHalf) -> Option<ErrorMessage> {
        let mut codec = FrameCodec::new(self.ctx.config.max_frame_size);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let idle_timeout = self.ctx.config.idle_timeout;

        loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancel_reason(),
                _ = self.outbound.closing() => return self.cancel_reason(),
                read = tokio::time::timeout(idle_timeout, reader.read(&mut buf)) => read,
            };

            let n = match read {
                Err(_) => {
                    warn!(
                        "Connection {} idle for {:?}, closing",
                        self.connection_id, idle_timeout
                    );
                    return Some(ErrorMessage::new(ErrorCode::IdleTimeout, "Idle timeout"));
                }
                Ok(Ok(0)) => {
                    debug!("Connection {} closed by peer", self.connection_id);
                    return None;
                }
                Ok(Err(e)) => {
                    debug!("Connection {} read error: {}", self.connection_id, e);
                    return None;
                }
                Ok(Ok(n)) => n,
            };

            codec.feed(&buf[..n]);
            if let Flow::Close(error) = self.dispatch_buffered(&mut codec).await {
                return error;
            }
        }
    }

    /// Dispatch every complete frame in `codec`. A connection stopped from
    /// outside meanwhile stops at the next frame.
    async fn dispatch_buffered(&mut self, codec: &mut FrameCodec) -> Flow {
        loop {
            if self.cancel.is_cancelled() || self.outbound.is_closing() {
                return Flow::Close(self.cancel_reason());
            }
            match codec.decode_next() {
                Ok(Some(frame)) => {
                    if let Flow::Close(error) = self.dispatch(frame).await {
                        return Flow::Close(error);
                    }
                }
                Ok(None) => return Flow::Continue,
                Err(e) => {
                    warn!("Malformed frame on {}: {}", self.connection_id, e);
                    return self.fail(ErrorMessage::malformed(e.to_string()));
                }
            }
        }
    }

    /// The error to leave with when the connection was stopped from outside.
    /// Only shutdown needs one; a supersede or abort has queued its own.
    fn cancel_reason(&self) -> Option<ErrorMessage> {
        if self.ctx.shutdown.is_cancelled() {
            return Some(ErrorMessage::new(
                ErrorCode::ShuttingDown,
                "Server shutting down",
            ));
        }
        debug!("Connection {} closed from outside", self.connection_id);
        None
    }

    async fn dispatch(&mut self, frame: Frame) -> Flow {
        let frame_type = frame.frame_type;
        debug!("{} <- {:?}", self.connection_id, frame_type);

        if !frame_type.is_client_request() {
            warn!(
                "Connection {} sent server-only frame {:?}",
                self.connection_id, frame_type
            );
            return self.fail(unexpected(frame_type));
        }

        if self.session.is_none() && !frame_type.allowed_before_auth() {
            return self.fail(ErrorMessage::unauthenticated());
        }

        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Undecodable {:?} on {}: {}", frame_type, self.connection_id, e);
                return self.fail(ErrorMessage::malformed(e.to_string()));
            }
        };

        match self.session.clone() {
            Some(session) => self.dispatch_session(session, message).await,
            None => self.dispatch_guest(message).await,
        }
    }

    /// Frames on a connection that has not logged in
    async fn dispatch_guest(&mut self, message: Message) -> Flow {
        match message {
            Message::RegisterRequest(req) => self.handle_register(req).await,
            Message::LoginRequest(req) => self.handle_login(req).await,
            Message::Ping(ping) => self.handle_ping(ping),
            Message::Pong(_) => Flow::Continue,
            _ => self.fail(ErrorMessage::unauthenticated()),
        }
    }

    async fn dispatch_session(&mut self, session: Session, message: Message) -> Flow {
        match message {
            Message::RegisterRequest(req) => self.handle_register(req).await,
            Message::LoginRequest(_) => self.fail(ErrorMessage::new(
                ErrorCode::AlreadyAuthenticated,
                format!("Already logged in as {}", session.username),
            )),
            Message::LogoutRequest(_) => self.handle_logout(&session).await,
            Message::Ping(ping) => self.handle_ping(ping),
            Message::Pong(_) => Flow::Continue,
            Message::SendMessage(msg) => self.handle_send_message(&session, msg).await,
            Message::ContactListRequest(_) => self.send_contact_list(&session).await,
            Message::AddContact(req) => {
                let result = self.ctx.presence.add_contact(&session, &req.username).await;
                self.handle_contact_edit(&session, result).await
            }
            Message::RemoveContact(req) => {
                let result = self.ctx.presence.remove_contact(&session, &req.username).await;
                self.handle_contact_edit(&session, result).await
            }
            Message::UserSearchRequest(req) => {
                match self.ctx.presence.search_users(&session, &req.query).await {
                    Ok(response) => {
                        self.reply(&response);
                        Flow::Continue
                    }
                    Err(e) => self.internal_error("search", e),
                }
            }

            // Server-to-client frames never get this far
            message @ (Message::RegisterResponse(_)
            | Message::LoginResponse(_)
            | Message::LogoutResponse(_)
            | Message::MessageDelivered(_)
            | Message::MessageAccepted(_)
            | Message::DeliveryFailed(_)
            | Message::ContactListResponse(_)
            | Message::ContactActionResponse(_)
            | Message::UserSearchResponse(_)
            | Message::PresenceUpdate(_)
            | Message::Error(_)) => self.fail(unexpected(message.frame_type())),
        }
    }

    async fn handle_register(&mut self, req: RegisterRequest) -> Flow {
        let response = match self
            .ctx
            .auth
            .register_account(&req.username, &req.password)
            .await
        {
            Ok(user) => RegisterResponse {
                status: RegisterStatus::Ok,
                message: format!("Account {} created", user.username),
            },
            Err(RegisterError::UsernameTaken(_)) => RegisterResponse {
                status: RegisterStatus::UsernameTaken,
                message: "Username already exists".to_string(),
            },
            Err(RegisterError::Rejected(reason)) => RegisterResponse {
                status: RegisterStatus::Rejected,
                message: reason,
            },
            Err(RegisterError::Store(e)) => return self.internal_error("register", e),
        };
        self.reply(&response);
        Flow::Continue
    }

    async fn handle_login(&mut self, req: LoginRequest) -> Flow {
        let result = self
            .ctx
            .auth
            .login(&req.username, &req.password, self.outbound.clone())
            .await;

        match result {
            Ok(session) => {
                self.reply(&LoginResponse::ok(&session.username));
                self.session = Some(session);
                Flow::Continue
            }
            Err(AuthError::UnknownUser | AuthError::BadPassword) => {
                info!("Failed login for {:?} on {}", req.username.trim(), self.connection_id);
                self.reply(&LoginResponse::auth_failed());
                Flow::Continue
            }
            Err(AuthError::Registry(e)) => {
                error!("Registry rejected login on {}: {}", self.connection_id, e);
                self.reply(&LoginResponse::auth_failed());
                Flow::Close(None)
            }
            Err(AuthError::Store(e)) => self.internal_error("login", e),
        }
    }

    async fn handle_logout(&mut self, session: &Session) -> Flow {
        self.ctx.auth.logout(session).await;
        self.session = None;
        self.reply(&LogoutResponse {
            message: "Goodbye!".to_string(),
        });
        Flow::Close(None)
    }

    fn handle_ping(&self, ping: Ping) -> Flow {
        self.reply(&Pong { nonce: ping.nonce });
        Flow::Continue
    }

    async fn handle_send_message(&self, session: &Session, msg: SendMessage) -> Flow {
        match self.ctx.router.route(session, &msg).await {
            Ok(outcome) => {
                self.reply(&outcome.acknowledgement(msg.message_id));
                Flow::Continue
            }
            Err(e) => self.internal_error("route", e),
        }
    }

    async fn send_contact_list(&self, session: &Session) -> Flow {
        match self.ctx.presence.list_contact_status(session.user_id).await {
            Ok(entries) => {
                self.reply(&ContactListResponse { entries });
                Flow::Continue
            }
            Err(e) => self.internal_error("contact list", e),
        }
    }

    /// Reply to an add/remove and follow a successful edit with a fresh list
    async fn handle_contact_edit(
        &self,
        session: &Session,
        result: crate::Result<ContactActionResponse>,
    ) -> Flow {
        match result {
            Ok(response) => {
                let changed = response.status == ContactActionStatus::Ok;
                self.reply(&response);
                if changed {
                    self.send_contact_list(session).await
                } else {
                    Flow::Continue
                }
            }
            Err(e) => self.internal_error("contact edit", e),
        }
    }

    fn reply<M: Encodable>(&self, msg: &M) {
        if !self.outbound.send(msg) {
            debug!("Connection {} writer gone, reply dropped", self.connection_id);
        }
    }

    /// Send `error` to the peer. Fatal codes end the connection with it.
    fn fail(&self, error: ErrorMessage) -> Flow {
        if error.code.is_fatal() {
            return Flow::Close(Some(error));
        }
        self.reply(&error);
        Flow::Continue
    }

    fn internal_error(&self, operation: &str, err: impl Into<ImError>) -> Flow {
        let err = err.into();
        error!(
            "{} failed on {} (code {}): {}",
            operation,
            self.connection_id,
            err.code(),
            err
        );
        self.fail(ErrorMessage::internal())
    }
}

fn unexpected(frame_type: FrameType) -> ErrorMessage {
    ErrorMessage::new(
        ErrorCode::UnexpectedFrame,
        format!("{:?} is not a client frame", frame_type),
    )
}

/// Owns the write half; drains the send queue in order until a `Close`. An
/// aborted queue is dropped unflushed.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: OutboundQueue,
    cancel: CancellationToken,
    connection_id: ConnectionId,
    write_timeout: Duration,
) {
    let aborted = queue.abort_token();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut final_error = None;
    let mut mid_frame = false;

    loop {
        let item = tokio::select! {
            biased;
            _ = aborted.cancelled() => break,
            item = queue.recv() => item,
        };
        let frame = match item {
            Some(Outbound::Frame(frame)) => frame,
            Some(Outbound::Close(error)) => {
                final_error = error;
                break;
            }
            None => break,
        };

        buf.clear();
        frame.encode(&mut buf);
        let written = tokio::select! {
            biased;
            _ = aborted.cancelled() => {
                mid_frame = true;
                break;
            }
            written = writer.write_all(&buf) => written,
        };
        if let Err(e) = written {
            debug!("Write to {} failed: {}", connection_id, e);
            break;
        }
    }

    // Nothing can follow a partly written frame
    if aborted.is_cancelled() && final_error.is_none() && !mid_frame {
        final_error = queue.abort_reason();
    }

    // Refuse anything queued after this point
    queue.close();
    if let Some(error) = final_error {
        write_final(&mut writer, &error, write_timeout, connection_id).await;
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Shutdown of {} failed: {}", connection_id, e);
    }
    cancel.cancel();
    debug!("Writer for {} finished", connection_id);
}

async fn write_final(
    writer: &mut OwnedWriteHalf,
    error: &ErrorMessage,
    write_timeout: Duration,
    connection_id: ConnectionId,
) {
    let frame = match error.encode_frame() {
        Ok(frame) => frame,
        Err(e) => {
            error!("Cannot encode close error for {}: {}", connection_id, e);
            return;
        }
    };
    let bytes = frame.encode_to_bytes();
    match tokio::time::timeout(write_timeout, writer.write_all(&bytes)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Final write to {} failed: {}", connection_id, e),
        Err(_) => debug!("Final write to {} timed out", connection_id),
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::ImClient;
    use crate::config::{MIN_BCRYPT_COST, ServerConfig};
    use crate::store::InMemoryCredentialStore;

    fn context() -> Arc<ServerContext> {
        let config = ServerConfig {
            bcrypt_cost: MIN_BCRYPT_COST,
            ..Default::default()
        };
        let store = Arc::new(InMemoryCredentialStore::new(MIN_BCRYPT_COST));
        Arc::new(ServerContext::new(config, store))
    }

    fn handler(ctx: &Arc<ServerContext>) -> (ConnectionHandler, OutboundQueue) {
        let mut handler = ConnectionHandler::new(Arc::clone(ctx), "127.0.0.1:4000".parse().unwrap());
        let queue = handler.outbound_rx.take().unwrap();
        (handler, queue)
    }

    fn buffered_pings(count: u64) -> FrameCodec {
        let mut codec = FrameCodec::new(DEFAULT_MAX_FRAME_SIZE);
        for nonce in 0..count {
            codec.feed(&Ping { nonce }.encode_frame().unwrap().encode_to_bytes());
        }
        codec
    }

    fn queued_message(queue: &mut OutboundQueue) -> Message {
        match queue.try_recv().unwrap() {
            Outbound::Frame(frame) => Message::decode(&frame).unwrap(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_buffered_frames_dispatched_in_order() {
        let ctx = context();
        let (mut conn, mut queue) = handler(&ctx);
        let mut codec = buffered_pings(3);

        assert!(matches!(conn.dispatch_buffered(&mut codec).await, Flow::Continue));
        for nonce in 0..3 {
            assert_eq!(queued_message(&mut queue), Message::Pong(Pong { nonce }));
        }
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_superseded_connection_skips_buffered_frames() {
        let ctx = context();
        ctx.auth.register_account("alice", "secret").await.unwrap();

        let (mut old, mut old_queue) = handler(&ctx);
        let session = ctx
            .auth
            .login("alice", "secret", old.outbound.clone())
            .await
            .unwrap();
        old.session = Some(session);

        let (elsewhere, _elsewhere_queue) = OutboundHandle::new(Uuid::new_v4());
        ctx.auth.login("alice", "secret", elsewhere).await.unwrap();

        let mut codec = buffered_pings(2);
        assert!(matches!(
            old.dispatch_buffered(&mut codec).await,
            Flow::Close(None)
        ));

        match old_queue.try_recv().unwrap() {
            Outbound::Close(Some(err)) => assert_eq!(err.code, ErrorCode::Superseded),
            other => panic!("unexpected {:?}", other),
        }
        assert!(old_queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_dispatch() {
        let ctx = context();
        let (mut conn, mut queue) = handler(&ctx);
        ctx.shutdown.cancel();

        let mut codec = buffered_pings(1);
        match conn.dispatch_buffered(&mut codec).await {
            Flow::Close(Some(err)) => assert_eq!(err.code, ErrorCode::ShuttingDown),
            other => panic!("unexpected {:?}", other),
        }
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_error_fatality() {
        let ctx = context();
        let (mut conn, mut queue) = handler(&ctx);

        // Recoverable: the error is queued and the connection stays up
        let frame = ContactListRequest.encode_frame().unwrap();
        assert!(matches!(conn.dispatch(frame).await, Flow::Continue));
        match queued_message(&mut queue) {
            Message::Error(err) => assert_eq!(err.code, ErrorCode::Unauthenticated),
            other => panic!("unexpected {:?}", other),
        }

        // Fatal: the error leaves with the close
        let frame = PresenceUpdate {
            username: "alice".to_string(),
            status: PresenceStatus::Online,
        }
        .encode_frame()
        .unwrap();
        match conn.dispatch(frame).await {
            Flow::Close(Some(err)) => assert_eq!(err.code, ErrorCode::UnexpectedFrame),
            other => panic!("unexpected {:?}", other),
        }
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_aborted_queue_is_not_flushed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = ImClient::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let (_reader, writer) = stream.into_split();

        let (handle, queue) = OutboundHandle::with_capacity(Uuid::new_v4(), 2);
        assert!(handle.send(&Ping { nonce: 1 }));
        assert!(handle.send(&Ping { nonce: 2 }));
        assert!(!handle.send(&Ping { nonce: 3 }));

        let cancel = CancellationToken::new();
        write_loop(
            writer,
            queue,
            cancel.clone(),
            handle.connection_id(),
            Duration::from_secs(1),
        )
        .await;
        assert!(cancel.is_cancelled());

        // Only the overflow error reaches the peer, none of the backlog
        match client.recv().await.unwrap() {
            Message::Error(err) => assert_eq!(err.code, ErrorCode::QueueOverflow),
            other => panic!("unexpected {:?}", other),
        }
        assert!(client.wait_closed().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_flushes_queue_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = ImClient::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let (_reader, writer) = stream.into_split();

        let (handle, queue) = OutboundHandle::new(Uuid::new_v4());
        assert!(handle.send(&Pong { nonce: 1 }));
        handle.close(Some(ErrorMessage::new(ErrorCode::IdleTimeout, "Idle timeout")));
        // Lands behind the close and is never written
        handle.send(&Pong { nonce: 2 });

        write_loop(
            writer,
            queue,
            CancellationToken::new(),
            handle.connection_id(),
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(client.recv().await.unwrap(), Message::Pong(Pong { nonce: 1 }));
        match client.recv().await.unwrap() {
            Message::Error(err) => assert_eq!(err.code, ErrorCode::IdleTimeout),
            other => panic!("unexpected {:?}", other),
        }
        assert!(client.wait_closed().await.unwrap().is_none());
    }
}
