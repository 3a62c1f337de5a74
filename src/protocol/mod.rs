//! Protocol layer for the IM server
//!
//! This module provides:
//! - Binary frame encoding/decoding
//! - Primitive payload fields
//! - Message type definitions
//! - Codec traits bridging the two

pub mod codec;
pub mod frame;
pub mod messages;
pub mod payload;

// Re-export commonly used types
pub use codec::{Decodable, Encodable, Message};
pub use frame::{
    DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, Frame, FrameCodec, FrameError, FrameType,
    PROTOCOL_VERSION,
};
pub use messages::*;
pub use payload::{PayloadReader, PayloadWriter};
