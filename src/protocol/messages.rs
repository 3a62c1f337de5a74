//! Protocol message types for the IM system
//!
//! Every payload that can travel inside a frame, together with its binary
//! layout. Field order in `write`/`read` is the wire order.

use std::fmt;

use super::frame::FrameError;
use super::payload::{PayloadReader, PayloadWriter};

/// Unique identifier types
pub type UserId = u64;

/// Binary layout of a message payload
pub trait PayloadFormat: Sized {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError>;
    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError>;
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident : $repr:ty, $field:literal { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[repr($repr)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub const FIELD: &'static str = $field;

            pub fn from_repr(value: $repr) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_enum!(
    /// Outcome of an account registration
    RegisterStatus: u8, "register_status" {
        Ok = 0x00,
        UsernameTaken = 0x01,
        Rejected = 0x02,
    }
);

wire_enum!(
    /// Outcome of a login attempt. Unknown user and wrong password are both
    /// reported as `AuthFailed`.
    LoginStatus: u8, "login_status" {
        Ok = 0x00,
        AuthFailed = 0x01,
    }
);

wire_enum!(
    /// Online/offline visibility of a user
    PresenceStatus: u8, "presence_status" {
        Offline = 0x00,
        Online = 0x01,
    }
);

wire_enum!(
    /// Why a message was not handed to its recipient
    DeliveryFailure: u8, "delivery_failure" {
        RecipientOffline = 0x01,
        NotAContact = 0x02,
        InvalidMessage = 0x03,
    }
);

wire_enum!(
    ContactAction: u8, "contact_action" {
        Add = 0x01,
        Remove = 0x02,
    }
);

wire_enum!(
    ContactActionStatus: u8, "contact_action_status" {
        Ok = 0x00,
        NotFound = 0x01,
        AlreadyPresent = 0x02,
        NotPresent = 0x03,
        SelfContact = 0x04,
    }
);

wire_enum!(
    /// Error codes carried by `Error` frames
    ErrorCode: u16, "error_code" {
        MalformedFrame = 1001,
        Unauthenticated = 1002,
        UnexpectedFrame = 1003,
        AlreadyAuthenticated = 1004,
        Superseded = 1005,
        IdleTimeout = 1006,
        ServerBusy = 1007,
        ShuttingDown = 1008,
        Internal = 1009,
        QueueOverflow = 1010,
    }
);

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceStatus::Online => f.write_str("online"),
            PresenceStatus::Offline => f.write_str("offline"),
        }
    }
}

impl ErrorCode {
    /// Whether the server closes the connection after sending this code
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ErrorCode::Unauthenticated | ErrorCode::AlreadyAuthenticated | ErrorCode::Internal
        )
    }
}

fn read_u8_enum<T>(
    r: &mut PayloadReader<'_>,
    field: &'static str,
    from: fn(u8) -> Option<T>,
) -> Result<T, FrameError> {
    let value = r.get_u8(field)?;
    from(value).ok_or(FrameError::InvalidValue { field, value })
}

// =============================================================================
// Account and session control (0x00 - 0x0F)
// =============================================================================

/// Create a new account
#[derive(Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

/// Authenticate an existing account
#[derive(Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

// Passwords stay out of logs.
impl fmt::Debug for RegisterRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl PayloadFormat for RegisterRequest {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_str("username", &self.username)?;
        w.put_str("password", &self.password)?;
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            username: r.get_string("username")?,
            password: r.get_string("password")?,
        })
    }
}

impl PayloadFormat for LoginRequest {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_str("username", &self.username)?;
        w.put_str("password", &self.password)?;
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            username: r.get_string("username")?,
            password: r.get_string("password")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    pub status: RegisterStatus,
    pub message: String,
}

impl PayloadFormat for RegisterResponse {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_u8(self.status as u8);
        w.put_str("message", &self.message)?;
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            status: read_u8_enum(r, RegisterStatus::FIELD, RegisterStatus::from_repr)?,
            message: r.get_string("message")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    pub status: LoginStatus,
    pub message: String,
}

impl LoginResponse {
    pub fn ok(username: &str) -> Self {
        Self {
            status: LoginStatus::Ok,
            message: format!("Welcome, {}", username),
        }
    }

    /// The single failure response for both unknown users and bad passwords
    pub fn auth_failed() -> Self {
        Self {
            status: LoginStatus::AuthFailed,
            message: "Invalid username or password".to_string(),
        }
    }
}

impl PayloadFormat for LoginResponse {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_u8(self.status as u8);
        w.put_str("message", &self.message)?;
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            status: read_u8_enum(r, LoginStatus::FIELD, LoginStatus::from_repr)?,
            message: r.get_string("message")?,
        })
    }
}

/// End the session; the server answers with `LogoutResponse` and closes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogoutRequest;

impl PayloadFormat for LogoutRequest {
    fn write(&self, _w: &mut PayloadWriter) -> Result<(), FrameError> {
        Ok(())
    }

    fn read(_r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutResponse {
    pub message: String,
}

impl PayloadFormat for LogoutResponse {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_str("message", &self.message)?;
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            message: r.get_string("message")?,
        })
    }
}

/// Keepalive ping, valid in both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub nonce: u64,
}

/// Reply to a Ping, echoing its nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub nonce: u64,
}

impl PayloadFormat for Ping {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_u64(self.nonce);
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            nonce: r.get_u64("nonce")?,
        })
    }
}

impl PayloadFormat for Pong {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_u64(self.nonce);
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            nonce: r.get_u64("nonce")?,
        })
    }
}

// =============================================================================
// Messaging (0x10 - 0x1F)
// =============================================================================

/// Send a text message to a contact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessage {
    /// Client-chosen id echoed in the acknowledgement
    pub message_id: String,
    pub recipient: String,
    pub body: String,
}

impl PayloadFormat for SendMessage {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_str("message_id", &self.message_id)?;
        w.put_str("recipient", &self.recipient)?;
        w.put_str("body", &self.body)?;
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            message_id: r.get_string("message_id")?,
            recipient: r.get_string("recipient")?,
            body: r.get_string("body")?,
        })
    }
}

/// A message pushed to its recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDelivered {
    pub message_id: String,
    pub sender: String,
    pub body: String,
    /// Server receive time (Unix ms)
    pub sent_at: u64,
}

impl PayloadFormat for MessageDelivered {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_str("message_id", &self.message_id)?;
        w.put_str("sender", &self.sender)?;
        w.put_str("body", &self.body)?;
        w.put_u64(self.sent_at);
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            message_id: r.get_string("message_id")?,
            sender: r.get_string("sender")?,
            body: r.get_string("body")?,
            sent_at: r.get_u64("sent_at")?,
        })
    }
}

/// Tells the sender its message was handed to the recipient's connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAccepted {
    pub message_id: String,
}

impl PayloadFormat for MessageAccepted {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_str("message_id", &self.message_id)?;
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            message_id: r.get_string("message_id")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailed {
    pub message_id: String,
    pub reason: DeliveryFailure,
}

impl PayloadFormat for DeliveryFailed {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_str("message_id", &self.message_id)?;
        w.put_u8(self.reason as u8);
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            message_id: r.get_string("message_id")?,
            reason: read_u8_enum(r, DeliveryFailure::FIELD, DeliveryFailure::from_repr)?,
        })
    }
}

// =============================================================================
// Contacts and directory (0x20 - 0x2F)
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactListRequest;

impl PayloadFormat for ContactListRequest {
    fn write(&self, _w: &mut PayloadWriter) -> Result<(), FrameError> {
        Ok(())
    }

    fn read(_r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self)
    }
}

/// One row of a contact list snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactEntry {
    pub username: String,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactListResponse {
    pub entries: Vec<ContactEntry>,
}

impl PayloadFormat for ContactListResponse {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_count("entries", self.entries.len())?;
        for entry in &self.entries {
            w.put_str("username", &entry.username)?;
            w.put_u8(entry.status as u8);
        }
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        let count = r.get_u16("entries")? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(ContactEntry {
                username: r.get_string("username")?,
                status: read_u8_enum(r, PresenceStatus::FIELD, PresenceStatus::from_repr)?,
            });
        }
        Ok(Self { entries })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddContact {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveContact {
    pub username: String,
}

impl PayloadFormat for AddContact {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_str("username", &self.username)?;
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            username: r.get_string("username")?,
        })
    }
}

impl PayloadFormat for RemoveContact {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_str("username", &self.username)?;
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            username: r.get_string("username")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactActionResponse {
    pub action: ContactAction,
    pub status: ContactActionStatus,
    pub username: String,
}

impl PayloadFormat for ContactActionResponse {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_u8(self.action as u8);
        w.put_u8(self.status as u8);
        w.put_str("username", &self.username)?;
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            action: read_u8_enum(r, ContactAction::FIELD, ContactAction::from_repr)?,
            status: read_u8_enum(r, ContactActionStatus::FIELD, ContactActionStatus::from_repr)?,
            username: r.get_string("username")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSearchRequest {
    pub query: String,
}

impl PayloadFormat for UserSearchRequest {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_str("query", &self.query)?;
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            query: r.get_string("query")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSearchResponse {
    pub usernames: Vec<String>,
}

impl PayloadFormat for UserSearchResponse {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_count("usernames", self.usernames.len())?;
        for username in &self.usernames {
            w.put_str("username", username)?;
        }
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        let count = r.get_u16("usernames")? as usize;
        let mut usernames = Vec::with_capacity(count);
        for _ in 0..count {
            usernames.push(r.get_string("username")?);
        }
        Ok(Self { usernames })
    }
}

// =============================================================================
// Presence (0x30 - 0x3F)
// =============================================================================

/// A contact came online or went offline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub username: String,
    pub status: PresenceStatus,
}

impl PayloadFormat for PresenceUpdate {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_str("username", &self.username)?;
        w.put_u8(self.status as u8);
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        Ok(Self {
            username: r.get_string("username")?,
            status: read_u8_enum(r, PresenceStatus::FIELD, PresenceStatus::from_repr)?,
        })
    }
}

// =============================================================================
// Error (0xFF)
// =============================================================================

/// Error response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorMessage {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MalformedFrame, message)
    }

    pub fn unauthenticated() -> Self {
        Self::new(ErrorCode::Unauthenticated, "Authentication required")
    }

    pub fn internal() -> Self {
        Self::new(ErrorCode::Internal, "Internal server error")
    }
}

impl PayloadFormat for ErrorMessage {
    fn write(&self, w: &mut PayloadWriter) -> Result<(), FrameError> {
        w.put_u16(self.code as u16);
        w.put_str("message", &self.message)?;
        Ok(())
    }

    fn read(r: &mut PayloadReader<'_>) -> Result<Self, FrameError> {
        let raw = r.get_u16(ErrorCode::FIELD)?;
        let code = ErrorCode::from_repr(raw).unwrap_or(ErrorCode::Internal);
        Ok(Self {
            code,
            message: r.get_string("message")?,
        })
    }
}
