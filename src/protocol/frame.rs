//! Binary frame protocol with length-prefixed messages
//!
//! Frame format:
//! ```text
//! +-----------+--------+----------------+-------------+
//! | version   | type   | length         | payload     |
//! | (1 byte)  | (1 byte)| (4 bytes, BE) | (variable)  |
//! +-----------+--------+----------------+-------------+
//! ```
//!
//! Decoding is resumable: bytes are fed into a [`FrameCodec`] as they arrive
//! and complete frames are pulled out one at a time. The declared payload
//! length is checked against the configured maximum as soon as the header is
//! buffered, so an oversized frame never causes an allocation of its size.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Protocol version carried in the first byte of every frame
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame header size: 1 byte version + 1 byte type + 4 bytes length
pub const FRAME_HEADER_SIZE: usize = 6;

/// Default maximum frame payload size (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Reasons a byte stream or payload cannot be turned into a frame.
///
/// Every variant is a protocol error: the connection that produced it is
/// closed after an `Error` frame is sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown frame type 0x{0:02X}")]
    UnknownFrameType(u8),

    #[error("frame payload too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("payload truncated while reading {field}")]
    Truncated { field: &'static str },

    #[error("field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: u8 },

    #[error("{0} unexpected trailing bytes in payload")]
    TrailingBytes(usize),

    #[error("field {field} too long to encode: {len}")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("expected {expected:?} frame, got {actual:?}")]
    WrongFrameType {
        expected: FrameType,
        actual: FrameType,
    },
}

/// Frame types, grouped by concern
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    // Account and session control (0x00 - 0x0F)
    RegisterRequest = 0x01,
    RegisterResponse = 0x02,
    LoginRequest = 0x03,
    LoginResponse = 0x04,
    LogoutRequest = 0x05,
    LogoutResponse = 0x06,
    Ping = 0x07,
    Pong = 0x08,

    // Messaging (0x10 - 0x1F)
    SendMessage = 0x10,
    MessageDelivered = 0x11,
    MessageAccepted = 0x12,
    DeliveryFailed = 0x13,

    // Contacts and directory (0x20 - 0x2F)
    ContactListRequest = 0x20,
    ContactListResponse = 0x21,
    AddContact = 0x22,
    RemoveContact = 0x23,
    ContactActionResponse = 0x24,
    UserSearchRequest = 0x25,
    UserSearchResponse = 0x26,

    // Presence (0x30 - 0x3F)
    PresenceUpdate = 0x30,

    // Error (0xFF)
    Error = 0xFF,
}

impl FrameType {
    /// Convert from u8, returns None for unknown types
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(FrameType::RegisterRequest),
            0x02 => Some(FrameType::RegisterResponse),
            0x03 => Some(FrameType::LoginRequest),
            0x04 => Some(FrameType::LoginResponse),
            0x05 => Some(FrameType::LogoutRequest),
            0x06 => Some(FrameType::LogoutResponse),
            0x07 => Some(FrameType::Ping),
            0x08 => Some(FrameType::Pong),

            0x10 => Some(FrameType::SendMessage),
            0x11 => Some(FrameType::MessageDelivered),
            0x12 => Some(FrameType::MessageAccepted),
            0x13 => Some(FrameType::DeliveryFailed),

            0x20 => Some(FrameType::ContactListRequest),
            0x21 => Some(FrameType::ContactListResponse),
            0x22 => Some(FrameType::AddContact),
            0x23 => Some(FrameType::RemoveContact),
            0x24 => Some(FrameType::ContactActionResponse),
            0x25 => Some(FrameType::UserSearchRequest),
            0x26 => Some(FrameType::UserSearchResponse),

            0x30 => Some(FrameType::PresenceUpdate),

            0xFF => Some(FrameType::Error),
            _ => None,
        }
    }

    /// Frames a client may send to the server
    pub fn is_client_request(&self) -> bool {
        matches!(
            self,
            FrameType::RegisterRequest
                | FrameType::LoginRequest
                | FrameType::LogoutRequest
                | FrameType::Ping
                | FrameType::Pong
                | FrameType::SendMessage
                | FrameType::ContactListRequest
                | FrameType::AddContact
                | FrameType::RemoveContact
                | FrameType::UserSearchRequest
        )
    }

    /// Frames the server accepts on a connection that has not logged in yet
    pub fn allowed_before_auth(&self) -> bool {
        matches!(
            self,
            FrameType::RegisterRequest
                | FrameType::LoginRequest
                | FrameType::Ping
                | FrameType::Pong
        )
    }
}

/// A single protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with the given type and payload
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Create an empty frame (no payload)
    pub fn empty(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            payload: Bytes::new(),
        }
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Encode this frame into a buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_size());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Encode this frame into a new Bytes
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Try to decode a frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more data is needed. Nothing is consumed
    /// unless a whole frame is returned.
    pub fn decode(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Frame>, FrameError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &buf[..FRAME_HEADER_SIZE];
        let version = header.get_u8();
        let frame_type_byte = header.get_u8();
        let payload_len = header.get_u32() as usize;

        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }

        let frame_type =
            FrameType::from_u8(frame_type_byte).ok_or(FrameError::UnknownFrameType(frame_type_byte))?;

        if payload_len > max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: payload_len,
                max: max_frame_size,
            });
        }

        let total_size = FRAME_HEADER_SIZE + payload_len;
        if buf.len() < total_size {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }
}

/// Streaming frame decoder for one connection
#[derive(Debug)]
pub struct FrameCodec {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Create a new frame codec rejecting payloads above `max_frame_size`
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_frame_size,
        }
    }

    /// Feed data into the codec
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame
    pub fn decode_next(&mut self) -> Result<Option<Frame>, FrameError> {
        Frame::decode(&mut self.buffer, self.max_frame_size)
    }

    /// Bytes received but not yet consumed by a complete frame
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_from_u8() {
        let types = [
            FrameType::RegisterRequest,
            FrameType::LoginResponse,
            FrameType::SendMessage,
            FrameType::DeliveryFailed,
            FrameType::ContactListResponse,
            FrameType::PresenceUpdate,
            FrameType::Error,
        ];

        for frame_type in types {
            let byte = frame_type as u8;
            assert_eq!(FrameType::from_u8(byte), Some(frame_type));
        }
        assert_eq!(FrameType::from_u8(0x7E), None);
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::new(FrameType::SendMessage, vec![0xAA, 0xBB, 0xCC]);
        let encoded = frame.encode_to_bytes();

        assert_eq!(
            &encoded[..],
            &[PROTOCOL_VERSION, 0x10, 0, 0, 0, 3, 0xAA, 0xBB, 0xCC]
        );
    }

    #[test]
    fn test_frame_codec_streaming() {
        let mut codec = FrameCodec::default();

        let frame1 = Frame::new(FrameType::Ping, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let frame2 = Frame::new(FrameType::Pong, vec![8, 7, 6, 5, 4, 3, 2, 1]);

        let mut data = BytesMut::new();
        frame1.encode(&mut data);
        frame2.encode(&mut data);

        // Partial header
        codec.feed(&data[..3]);
        assert!(codec.decode_next().unwrap().is_none());

        // Header plus part of the payload
        codec.feed(&data[3..10]);
        assert!(codec.decode_next().unwrap().is_none());
        assert_eq!(codec.buffered_len(), 10);

        codec.feed(&data[10..]);
        assert_eq!(codec.decode_next().unwrap(), Some(frame1));
        assert_eq!(codec.decode_next().unwrap(), Some(frame2));
        assert!(codec.decode_next().unwrap().is_none());
        assert_eq!(codec.buffered_len(), 0);
    }

    #[test]
    fn test_empty_frame() {
        let frame = Frame::empty(FrameType::ContactListRequest);
        assert!(frame.payload.is_empty());
        assert_eq!(frame.encoded_size(), FRAME_HEADER_SIZE);

        let mut buf = BytesMut::from(&frame.encode_to_bytes()[..]);
        let decoded = Frame::decode(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(decoded, Some(frame));
    }

    #[test]
    fn test_invalid_frame_type() {
        let mut data = BytesMut::new();
        data.put_u8(PROTOCOL_VERSION);
        data.put_u8(0xFE);
        data.put_u32(0);

        let result = Frame::decode(&mut data, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(result, Err(FrameError::UnknownFrameType(0xFE)));
    }

    #[test]
    fn test_unsupported_version() {
        let mut data = BytesMut::new();
        data.put_u8(9);
        data.put_u8(FrameType::Ping as u8);
        data.put_u32(0);

        let result = Frame::decode(&mut data, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(result, Err(FrameError::UnsupportedVersion(9)));
    }

    #[test]
    fn test_frame_too_large_rejected_from_header_alone() {
        let mut codec = FrameCodec::new(64);

        let mut header = BytesMut::new();
        header.put_u8(PROTOCOL_VERSION);
        header.put_u8(FrameType::SendMessage as u8);
        header.put_u32(65);
        codec.feed(&header);

        assert_eq!(
            codec.decode_next(),
            Err(FrameError::FrameTooLarge { size: 65, max: 64 })
        );
    }

    #[test]
    fn test_frame_at_limit_accepted() {
        let mut codec = FrameCodec::new(4);
        let frame = Frame::new(FrameType::Ping, vec![0u8; 4]);
        codec.feed(&frame.encode_to_bytes());

        assert_eq!(codec.decode_next().unwrap(), Some(frame));
    }

    #[test]
    fn test_declared_length_never_satisfied() {
        let mut codec = FrameCodec::default();

        let mut data = BytesMut::new();
        data.put_u8(PROTOCOL_VERSION);
        data.put_u8(FrameType::SendMessage as u8);
        data.put_u32(10);
        data.put_slice(&[1, 2, 3]);
        codec.feed(&data);

        assert!(codec.decode_next().unwrap().is_none());
        assert_eq!(codec.buffered_len(), FRAME_HEADER_SIZE + 3);
    }

    #[test]
    fn test_frame_type_groups() {
        assert!(FrameType::LoginRequest.allowed_before_auth());
        assert!(!FrameType::SendMessage.allowed_before_auth());

        assert!(FrameType::SendMessage.is_client_request());
        assert!(!FrameType::MessageDelivered.is_client_request());
        assert!(!FrameType::Error.is_client_request());
    }
}
