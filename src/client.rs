//! QuickIM protocol client
//!
//! A thin request/response client over one TCP connection. Server pushes
//! (deliveries, presence updates) that arrive while waiting for a response
//! are buffered and handed out by later `recv` calls in arrival order.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ImError, Result};
use crate::protocol::*;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// Bound on establishing the TCP connection
    pub connect_timeout: Duration,
    /// Bound on waiting for any single response
    pub response_timeout: Duration,
    /// Largest frame accepted from the server
    pub max_frame_size: usize,
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

pub struct ImClient {
    config: ClientConfig,
    stream: TcpStream,
    codec: FrameCodec,
    /// Messages read while waiting for something else
    pending: VecDeque<Message>,
    read_buf: Vec<u8>,
}

impl ImClient {
    /// Connect with default settings
    pub async fn connect(server_addr: SocketAddr) -> Result<Self> {
        Self::connect_with(ClientConfig::new(server_addr)).await
    }

    pub async fn connect_with(config: ClientConfig) -> Result<Self> {
        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(config.server_addr),
        )
        .await
        .map_err(|_| ImError::timeout(format!("connecting to {}", config.server_addr)))??;
        stream.set_nodelay(true)?;
        info!("Connected to {}", config.server_addr);

        Ok(Self {
            codec: FrameCodec::new(config.max_frame_size),
            config,
            stream,
            pending: VecDeque::new(),
            read_buf: vec![0u8; READ_BUFFER_SIZE],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Send one message
    pub async fn send<M: Encodable>(&mut self, msg: &M) -> Result<()> {
        let frame = msg.encode_frame()?;
        self.send_frame(&frame).await
    }

    /// Send a prebuilt frame
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        debug!("-> {:?}", frame.frame_type);
        self.stream.write_all(&frame.encode_to_bytes()).await?;
        Ok(())
    }

    /// Write raw bytes, bypassing the codec
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Half-close the connection; the server sees EOF
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Next message from the server, waiting at most `response_timeout`
    pub async fn recv(&mut self) -> Result<Message> {
        let timeout = self.config.response_timeout;
        self.recv_within(timeout)
            .await?
            .ok_or_else(|| ImError::timeout(format!("no message within {:?}", timeout)))
    }

    /// Next message, or `None` if nothing arrives within `timeout`
    pub async fn recv_within(&mut self, timeout: Duration) -> Result<Option<Message>> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(Some(msg));
        }
        self.read_message(Instant::now() + timeout).await
    }

    /// Wait for the first message matching `predicate`. Anything else read in
    /// the meantime stays queued for `recv`.
    pub async fn wait_for<F>(&mut self, predicate: F) -> Result<Message>
    where
        F: Fn(&Message) -> bool,
    {
        if let Some(pos) = self.pending.iter().position(&predicate) {
            if let Some(msg) = self.pending.remove(pos) {
                return Ok(msg);
            }
        }

        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            match self.read_message(deadline).await? {
                Some(msg) if predicate(&msg) => return Ok(msg),
                Some(msg) => self.pending.push_back(msg),
                None => {
                    return Err(ImError::timeout(format!(
                        "no matching message within {:?}",
                        self.config.response_timeout
                    )));
                }
            }
        }
    }

    /// Wait until the server closes the connection. Returns the error frame
    /// it sent on the way out, if any.
    pub async fn wait_closed(&mut self) -> Result<Option<ErrorMessage>> {
        let deadline = Instant::now() + self.config.response_timeout;
        let mut last_error = None;
        loop {
            if let Some(msg) = self.pending.pop_front() {
                if let Message::Error(err) = msg {
                    last_error = Some(err);
                }
                continue;
            }
            match self.read_message(deadline).await {
                Ok(Some(Message::Error(err))) => last_error = Some(err),
                Ok(Some(_)) => {}
                Ok(None) => return Err(ImError::timeout("connection still open")),
                Err(ImError::Closed(_)) => return Ok(last_error),
                Err(ImError::Network(_)) => return Ok(last_error),
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_message(&mut self, deadline: Instant) -> Result<Option<Message>> {
        loop {
            if let Some(frame) = self.codec.decode_next()? {
                debug!("<- {:?}", frame.frame_type);
                return Ok(Some(Message::decode(&frame)?));
            }

            let read = tokio::time::timeout_at(deadline, self.stream.read(&mut self.read_buf)).await;
            match read {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => return Err(ImError::closed("server closed the connection")),
                Ok(Ok(n)) => self.codec.feed(&self.read_buf[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Send `request` and wait for the response selected by `extract`. An
    /// `Error` frame from the server fails the call.
    async fn request<M, T, F>(&mut self, request: &M, extract: F) -> Result<T>
    where
        M: Encodable,
        F: Fn(&Message) -> Option<T>,
    {
        self.send(request).await?;
        let msg = self
            .wait_for(|m| matches!(m, Message::Error(_)) || extract(m).is_some())
            .await?;
        if let Message::Error(err) = msg {
            return Err(err.into());
        }
        extract(&msg).ok_or_else(|| ImError::internal("response vanished"))
    }

    pub async fn register(&mut self, username: &str, password: &str) -> Result<RegisterResponse> {
        let req = RegisterRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        self.request(&req, |m| match m {
            Message::RegisterResponse(r) => Some(r.clone()),
            _ => None,
        })
        .await
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<LoginResponse> {
        let req = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        self.request(&req, |m| match m {
            Message::LoginResponse(r) => Some(r.clone()),
            _ => None,
        })
        .await
    }

    pub async fn logout(&mut self) -> Result<LogoutResponse> {
        self.request(&LogoutRequest, |m| match m {
            Message::LogoutResponse(r) => Some(r.clone()),
            _ => None,
        })
        .await
    }

    pub async fn ping(&mut self, nonce: u64) -> Result<Pong> {
        self.request(&Ping { nonce }, |m| match m {
            Message::Pong(p) if p.nonce == nonce => Some(*p),
            _ => None,
        })
        .await
    }

    /// Send a chat message and wait for its acknowledgement, either
    /// `MessageAccepted` or `DeliveryFailed`
    pub async fn send_message(&mut self, recipient: &str, body: &str) -> Result<Message> {
        let message_id = Uuid::new_v4().to_string();
        let req = SendMessage {
            message_id: message_id.clone(),
            recipient: recipient.to_string(),
            body: body.to_string(),
        };
        self.request(&req, |m| match m {
            Message::MessageAccepted(ack) if ack.message_id == message_id => Some(m.clone()),
            Message::DeliveryFailed(fail) if fail.message_id == message_id => Some(m.clone()),
            _ => None,
        })
        .await
    }

    pub async fn contact_list(&mut self) -> Result<ContactListResponse> {
        self.request(&ContactListRequest, |m| match m {
            Message::ContactListResponse(r) => Some(r.clone()),
            _ => None,
        })
        .await
    }

    pub async fn add_contact(&mut self, username: &str) -> Result<ContactActionResponse> {
        let req = AddContact {
            username: username.to_string(),
        };
        self.contact_action(&req, ContactAction::Add).await
    }

    pub async fn remove_contact(&mut self, username: &str) -> Result<ContactActionResponse> {
        let req = RemoveContact {
            username: username.to_string(),
        };
        self.contact_action(&req, ContactAction::Remove).await
    }

    /// A successful edit is followed by a refreshed contact list, which is
    /// consumed here so later `contact_list` calls see fresh data
    async fn contact_action<M: Encodable>(
        &mut self,
        req: &M,
        action: ContactAction,
    ) -> Result<ContactActionResponse> {
        let response = self
            .request(req, |m| match m {
                Message::ContactActionResponse(r) if r.action == action => Some(r.clone()),
                _ => None,
            })
            .await?;
        if response.status == ContactActionStatus::Ok {
            self.wait_for(|m| matches!(m, Message::ContactListResponse(_)))
                .await?;
        }
        Ok(response)
    }

    pub async fn search_users(&mut self, query: &str) -> Result<UserSearchResponse> {
        let req = UserSearchRequest {
            query: query.to_string(),
        };
        self.request(&req, |m| match m {
            Message::UserSearchResponse(r) => Some(r.clone()),
            _ => None,
        })
        .await
    }

    /// Wait for a message delivered from another user
    pub async fn next_delivery(&mut self) -> Result<MessageDelivered> {
        match self
            .wait_for(|m| matches!(m, Message::MessageDelivered(_)))
            .await?
        {
            Message::MessageDelivered(msg) => Ok(msg),
            other => Err(ImError::internal(format!("unexpected {:?}", other.frame_type()))),
        }
    }

    /// Wait for a presence change of `username`
    pub async fn next_presence(&mut self, username: &str) -> Result<PresenceUpdate> {
        match self
            .wait_for(|m| matches!(m, Message::PresenceUpdate(p) if p.username == username))
            .await?
        {
            Message::PresenceUpdate(update) => Ok(update),
            other => Err(ImError::internal(format!("unexpected {:?}", other.frame_type()))),
        }
    }
}
