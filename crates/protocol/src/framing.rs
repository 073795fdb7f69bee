//! Length-delimited framing of protobuf messages.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - unsigned LEB128 varint: body length in bytes
//! - N bytes: protobuf encoded body
//!
//! Frames are simply concatenated; a datagram is a header frame followed by
//! the (possibly encrypted) concatenation of payload frames.

use bytes::{Buf, Bytes};
use prost::encoding::{decode_varint, encode_varint};
use prost::Message;

use crate::error::{ProtocolError, Result};

/// Something that can be appended to a buffer as one frame.
///
/// Implemented for every protobuf message; runtime-typed device payloads
/// reach it through [`crate::schema::DevicePayload::as_wire`].
pub trait WireMessage {
    /// Appends the length prefix and the encoded body to `buffer`.
    fn write_to(&self, buffer: &mut Vec<u8>) -> Result<()>;
}

impl<M: Message> WireMessage for M {
    fn write_to(&self, buffer: &mut Vec<u8>) -> Result<()> {
        write_message(buffer, self)
    }
}

/// Appends `message` to `buffer`, preceded by its varint encoded length.
pub fn write_message<M: Message>(buffer: &mut Vec<u8>, message: &M) -> Result<()> {
    message.encode_length_delimited(buffer)?;
    Ok(())
}

/// Appends an already encoded body to `buffer` as one frame.
pub fn write_frame(buffer: &mut Vec<u8>, body: &[u8]) {
    encode_varint(body.len() as u64, buffer);
    buffer.extend_from_slice(body);
}

/// Consumes one frame from the front of `buffer` and returns its body.
pub fn read_frame(buffer: &mut Bytes) -> Result<Bytes> {
    if !buffer.has_remaining() {
        return Err(ProtocolError::InvalidLengthPrefix(
            "buffer is empty".to_string(),
        ));
    }
    let declared = decode_varint(buffer)
        .map_err(|e| ProtocolError::InvalidLengthPrefix(e.to_string()))?;
    let declared = usize::try_from(declared).unwrap_or(usize::MAX);

    if declared > buffer.remaining() {
        return Err(ProtocolError::TruncatedInput {
            declared,
            available: buffer.remaining(),
        });
    }

    Ok(buffer.split_to(declared))
}

/// Consumes one frame from the front of `buffer` and decodes it as `M`.
pub fn read_message<M: Message + Default>(buffer: &mut Bytes) -> Result<M> {
    let body = read_frame(buffer)?;
    Ok(M::decode(body)?)
}

/// Cursor over a buffer of consecutive frames.
#[derive(Debug, Clone, Default)]
pub struct MessageReader {
    buffer: Bytes,
}

impl MessageReader {
    /// Create a reader positioned at the start of `data`.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            buffer: data.into(),
        }
    }

    /// Decode the next frame as `M`.
    pub fn read<M: Message + Default>(&mut self) -> Result<M> {
        read_message(&mut self.buffer)
    }

    /// Take the next frame body without decoding it.
    pub fn read_frame(&mut self) -> Result<Bytes> {
        read_frame(&mut self.buffer)
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buffer.len()
    }

    /// Unread bytes, without consuming them.
    pub fn remaining_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the reader, returning the unread bytes.
    pub fn into_remaining(self) -> Bytes {
        self.buffer
    }
}
