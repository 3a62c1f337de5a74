//! Codec for encoding/decoding protocol messages to/from frames
//!
//! This module provides the bridge between typed messages and binary frames.

use bytes::Bytes;

use super::frame::{Frame, FrameError, FrameType};
use super::messages::*;
use super::payload::{PayloadReader, PayloadWriter};

/// Trait for messages that can be encoded to frames
pub trait Encodable {
    /// Get the frame type for this message
    fn frame_type(&self) -> FrameType;

    /// Encode the message payload to bytes
    fn encode_payload(&self) -> Result<Bytes, FrameError>;

    /// Encode the complete frame
    fn encode_frame(&self) -> Result<Frame, FrameError> {
        Ok(Frame::new(self.frame_type(), self.encode_payload()?))
    }
}

/// Trait for messages that can be decoded from frames
pub trait Decodable: Sized {
    /// Expected frame type for this message
    fn expected_frame_type() -> FrameType;

    /// Decode the message from a payload. The whole payload must be consumed.
    fn decode_payload(payload: &[u8]) -> Result<Self, FrameError>;

    /// Decode from a complete frame, validating the frame type
    fn decode_frame(frame: &Frame) -> Result<Self, FrameError> {
        if frame.frame_type != Self::expected_frame_type() {
            return Err(FrameError::WrongFrameType {
                expected: Self::expected_frame_type(),
                actual: frame.frame_type,
            });
        }
        Self::decode_payload(&frame.payload)
    }
}

/// Implements Encodable, Decodable and the `Message` conversion for a type
macro_rules! impl_codec {
    ($type:ident) => {
        impl_codec!($type => $type);
    };
    ($type:ident => $variant:ident) => {
        impl Encodable for $type {
            fn frame_type(&self) -> FrameType {
                FrameType::$variant
            }

            fn encode_payload(&self) -> Result<Bytes, FrameError> {
                let mut writer = PayloadWriter::new();
                PayloadFormat::write(self, &mut writer)?;
                Ok(writer.finish())
            }
        }

        impl Decodable for $type {
            fn expected_frame_type() -> FrameType {
                FrameType::$variant
            }

            fn decode_payload(payload: &[u8]) -> Result<Self, FrameError> {
                let mut reader = PayloadReader::new(payload);
                let msg = <$type as PayloadFormat>::read(&mut reader)?;
                reader.finish()?;
                Ok(msg)
            }
        }

        impl From<$type> for Message {
            fn from(msg: $type) -> Self {
                Message::$variant(msg)
            }
        }
    };
}

// Account and session control
impl_codec!(RegisterRequest);
impl_codec!(RegisterResponse);
impl_codec!(LoginRequest);
impl_codec!(LoginResponse);
impl_codec!(LogoutRequest);
impl_codec!(LogoutResponse);
impl_codec!(Ping);
impl_codec!(Pong);

// Messaging
impl_codec!(SendMessage);
impl_codec!(MessageDelivered);
impl_codec!(MessageAccepted);
impl_codec!(DeliveryFailed);

// Contacts and directory
impl_codec!(ContactListRequest);
impl_codec!(ContactListResponse);
impl_codec!(AddContact);
impl_codec!(RemoveContact);
impl_codec!(ContactActionResponse);
impl_codec!(UserSearchRequest);
impl_codec!(UserSearchResponse);

// Presence
impl_codec!(PresenceUpdate);

// Error message
impl_codec!(ErrorMessage => Error);

/// Any frame, decoded into its typed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // Account and session control
    RegisterRequest(RegisterRequest),
    RegisterResponse(RegisterResponse),
    LoginRequest(LoginRequest),
    LoginResponse(LoginResponse),
    LogoutRequest(LogoutRequest),
    LogoutResponse(LogoutResponse),
    Ping(Ping),
    Pong(Pong),

    // Messaging
    SendMessage(SendMessage),
    MessageDelivered(MessageDelivered),
    MessageAccepted(MessageAccepted),
    DeliveryFailed(DeliveryFailed),

    // Contacts and directory
    ContactListRequest(ContactListRequest),
    ContactListResponse(ContactListResponse),
    AddContact(AddContact),
    RemoveContact(RemoveContact),
    ContactActionResponse(ContactActionResponse),
    UserSearchRequest(UserSearchRequest),
    UserSearchResponse(UserSearchResponse),

    // Presence
    PresenceUpdate(PresenceUpdate),

    // Error
    Error(ErrorMessage),
}

impl Message {
    /// Decode a frame into a typed message
    pub fn decode(frame: &Frame) -> Result<Self, FrameError> {
        let payload = &frame.payload[..];

        Ok(match frame.frame_type {
            FrameType::RegisterRequest => Self::RegisterRequest(Decodable::decode_payload(payload)?),
            FrameType::RegisterResponse => {
                Self::RegisterResponse(Decodable::decode_payload(payload)?)
            }
            FrameType::LoginRequest => Self::LoginRequest(Decodable::decode_payload(payload)?),
            FrameType::LoginResponse => Self::LoginResponse(Decodable::decode_payload(payload)?),
            FrameType::LogoutRequest => Self::LogoutRequest(Decodable::decode_payload(payload)?),
            FrameType::LogoutResponse => Self::LogoutResponse(Decodable::decode_payload(payload)?),
            FrameType::Ping => Self::Ping(Decodable::decode_payload(payload)?),
            FrameType::Pong => Self::Pong(Decodable::decode_payload(payload)?),

            FrameType::SendMessage => Self::SendMessage(Decodable::decode_payload(payload)?),
            FrameType::MessageDelivered => {
                Self::MessageDelivered(Decodable::decode_payload(payload)?)
            }
            FrameType::MessageAccepted => Self::MessageAccepted(Decodable::decode_payload(payload)?),
            FrameType::DeliveryFailed => Self::DeliveryFailed(Decodable::decode_payload(payload)?),

            FrameType::ContactListRequest => {
                Self::ContactListRequest(Decodable::decode_payload(payload)?)
            }
            FrameType::ContactListResponse => {
                Self::ContactListResponse(Decodable::decode_payload(payload)?)
            }
            FrameType::AddContact => Self::AddContact(Decodable::decode_payload(payload)?),
            FrameType::RemoveContact => Self::RemoveContact(Decodable::decode_payload(payload)?),
            FrameType::ContactActionResponse => {
                Self::ContactActionResponse(Decodable::decode_payload(payload)?)
            }
            FrameType::UserSearchRequest => {
                Self::UserSearchRequest(Decodable::decode_payload(payload)?)
            }
            FrameType::UserSearchResponse => {
                Self::UserSearchResponse(Decodable::decode_payload(payload)?)
            }

            FrameType::PresenceUpdate => Self::PresenceUpdate(Decodable::decode_payload(payload)?),

            FrameType::Error => Self::Error(Decodable::decode_payload(payload)?),
        })
    }

    /// Get the frame type of this message
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::RegisterRequest(_) => FrameType::RegisterRequest,
            Self::RegisterResponse(_) => FrameType::RegisterResponse,
            Self::LoginRequest(_) => FrameType::LoginRequest,
            Self::LoginResponse(_) => FrameType::LoginResponse,
            Self::LogoutRequest(_) => FrameType::LogoutRequest,
            Self::LogoutResponse(_) => FrameType::LogoutResponse,
            Self::Ping(_) => FrameType::Ping,
            Self::Pong(_) => FrameType::Pong,
            Self::SendMessage(_) => FrameType::SendMessage,
            Self::MessageDelivered(_) => FrameType::MessageDelivered,
            Self::MessageAccepted(_) => FrameType::MessageAccepted,
            Self::DeliveryFailed(_) => FrameType::DeliveryFailed,
            Self::ContactListRequest(_) => FrameType::ContactListRequest,
            Self::ContactListResponse(_) => FrameType::ContactListResponse,
            Self::AddContact(_) => FrameType::AddContact,
            Self::RemoveContact(_) => FrameType::RemoveContact,
            Self::ContactActionResponse(_) => FrameType::ContactActionResponse,
            Self::UserSearchRequest(_) => FrameType::UserSearchRequest,
            Self::UserSearchResponse(_) => FrameType::UserSearchResponse,
            Self::PresenceUpdate(_) => FrameType::PresenceUpdate,
            Self::Error(_) => FrameType::Error,
        }
    }
}

impl Encodable for Message {
    fn frame_type(&self) -> FrameType {
        Message::frame_type(self)
    }

    fn encode_payload(&self) -> Result<Bytes, FrameError> {
        match self {
            Self::RegisterRequest(m) => m.encode_payload(),
            Self::RegisterResponse(m) => m.encode_payload(),
            Self::LoginRequest(m) => m.encode_payload(),
            Self::LoginResponse(m) => m.encode_payload(),
            Self::LogoutRequest(m) => m.encode_payload(),
            Self::LogoutResponse(m) => m.encode_payload(),
            Self::Ping(m) => m.encode_payload(),
            Self::Pong(m) => m.encode_payload(),
            Self::SendMessage(m) => m.encode_payload(),
            Self::MessageDelivered(m) => m.encode_payload(),
            Self::MessageAccepted(m) => m.encode_payload(),
            Self::DeliveryFailed(m) => m.encode_payload(),
            Self::ContactListRequest(m) => m.encode_payload(),
            Self::ContactListResponse(m) => m.encode_payload(),
            Self::AddContact(m) => m.encode_payload(),
            Self::RemoveContact(m) => m.encode_payload(),
            Self::ContactActionResponse(m) => m.encode_payload(),
            Self::UserSearchRequest(m) => m.encode_payload(),
            Self::UserSearchResponse(m) => m.encode_payload(),
            Self::PresenceUpdate(m) => m.encode_payload(),
            Self::Error(m) => m.encode_payload(),
        }
    }
}
