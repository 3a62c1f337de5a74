//! Primitive payload encoding shared by all message types
//!
//! Integers are big-endian. Strings are a `u16` byte length followed by
//! UTF-8; lists are a `u16` element count followed by the elements.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::frame::FrameError;

/// Builds a payload field by field
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16(value);
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    /// Write a length-prefixed UTF-8 string
    pub fn put_str(&mut self, field: &'static str, value: &str) -> Result<&mut Self, FrameError> {
        let len = u16::try_from(value.len()).map_err(|_| FrameError::FieldTooLong {
            field,
            len: value.len(),
        })?;
        self.buf.put_u16(len);
        self.buf.put_slice(value.as_bytes());
        Ok(self)
    }

    /// Write a list count, failing if it does not fit the wire format
    pub fn put_count(&mut self, field: &'static str, count: usize) -> Result<&mut Self, FrameError> {
        let len = u16::try_from(count).map_err(|_| FrameError::FieldTooLong { field, len: count })?;
        self.buf.put_u16(len);
        Ok(self)
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads fields out of a received payload
#[derive(Debug)]
pub struct PayloadReader<'a> {
    data: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn get_u8(&mut self, field: &'static str) -> Result<u8, FrameError> {
        self.ensure(1, field)?;
        Ok(self.data.get_u8())
    }

    pub fn get_u16(&mut self, field: &'static str) -> Result<u16, FrameError> {
        self.ensure(2, field)?;
        Ok(self.data.get_u16())
    }

    pub fn get_u64(&mut self, field: &'static str) -> Result<u64, FrameError> {
        self.ensure(8, field)?;
        Ok(self.data.get_u64())
    }

    pub fn get_string(&mut self, field: &'static str) -> Result<String, FrameError> {
        let len = self.get_u16(field)? as usize;
        self.ensure(len, field)?;
        let (raw, rest) = self.data.split_at(len);
        self.data = rest;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| FrameError::InvalidUtf8 { field })
    }

    /// Fail if anything is left over after the last field
    pub fn finish(self) -> Result<(), FrameError> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(FrameError::TrailingBytes(self.data.len()))
        }
    }

    fn ensure(&self, needed: usize, field: &'static str) -> Result<(), FrameError> {
        if self.data.remaining() < needed {
            Err(FrameError::Truncated { field })
        } else {
            Ok(())
        }
    }
}
