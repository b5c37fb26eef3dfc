//! Protocol codec for encoding/decoding messages
//!
//! Handles MessagePack serialization of messages and framing of the
//! resulting payloads on stream transports.

use bytes::{Buf, BufMut, BytesMut};
use rmpv::Value;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

use super::{Message, MessageError, MessageMap, WireMessage, DEFAULT_MAX_FRAME_SIZE};

/// Size of the length header used by [`Framing::LengthPrefixed`]
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Message did not unpack into a map, got {0}")]
    NotAMap(&'static str),

    #[error("{0} unexpected bytes after message")]
    TrailingBytes(usize),

    #[error("Message too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error(transparent)]
    Message(#[from] MessageError),
}

impl CodecError {
    /// The bytes were not a single MessagePack map
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            CodecError::Decode(_) | CodecError::NotAMap(_) | CodecError::TrailingBytes(_)
        )
    }

    /// The map was read but did not describe the expected message
    pub fn message_error(&self) -> Option<&MessageError> {
        match self {
            CodecError::Message(e) => Some(e),
            _ => None,
        }
    }
}

pub type CodecResult<T> = Result<T, CodecError>;

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Boolean(_) => "boolean",
        Value::Integer(_) => "integer",
        Value::F32(_) | Value::F64(_) => "float",
        Value::String(_) => "string",
        Value::Binary(_) => "binary",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        Value::Ext(..) => "extension",
    }
}

/// Serialize a message into its MessagePack map.
///
/// Only [`Message`] values (or a single variant, through `Into`) can be
/// encoded.
pub fn encode(message: impl Into<Message>) -> CodecResult<Vec<u8>> {
    let message: Message = message.into();
    let value = Value::from(message.to_map());
    let mut buf = Vec::with_capacity(64);
    rmpv::encode::write_value(&mut buf, &value).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

fn read_map(bytes: &[u8]) -> CodecResult<MessageMap> {
    let mut rest = bytes;
    let value =
        rmpv::decode::read_value(&mut rest).map_err(|e| CodecError::Decode(e.to_string()))?;

    if !rest.is_empty() {
        return Err(CodecError::TrailingBytes(rest.len()));
    }

    match value {
        Value::Map(entries) => Ok(MessageMap::from(entries)),
        other => Err(CodecError::NotAMap(value_kind(&other))),
    }
}

/// Decode bytes as one specific variant.
///
/// The tag must name `M`; a message of any other kind is rejected with a
/// type error rather than converted.
pub fn decode<M: WireMessage>(bytes: &[u8]) -> CodecResult<M> {
    let map = read_map(bytes)?;
    Ok(M::from_map(&map)?)
}

/// Decode bytes as whichever variant their tag names
pub fn decode_message(bytes: &[u8]) -> CodecResult<Message> {
    let map = read_map(bytes)?;
    Ok(Message::from_map(&map)?)
}

/// How messages are delimited on a stream transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Each frame is exactly one MessagePack value
    #[default]
    Delimited,
    /// 4-byte big-endian payload length, then the payload
    LengthPrefixed,
}

/// Encodes messages into the wire format
#[derive(Debug, Clone)]
pub struct Encoder {
    framing: Framing,
    max_frame_size: usize,
}

impl Encoder {
    pub fn new(framing: Framing, max_frame_size: usize) -> Self {
        Self {
            framing,
            max_frame_size,
        }
    }

    /// Encode a message into a buffer
    pub fn encode(&self, message: impl Into<Message>, buf: &mut BytesMut) -> CodecResult<()> {
        let payload = encode(message)?;

        if payload.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(payload.len(), self.max_frame_size));
        }

        if self.framing == Framing::LengthPrefixed {
            buf.put_u32(payload.len() as u32);
        }
        buf.put_slice(&payload);

        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(Framing::default(), DEFAULT_MAX_FRAME_SIZE)
    }
}

fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(e) | rmpv::decode::Error::InvalidDataRead(e) => {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Splits a byte stream into message payloads
#[derive(Debug, Clone)]
pub struct Decoder {
    framing: Framing,
    max_frame_size: usize,
}

impl Decoder {
    pub fn new(framing: Framing, max_frame_size: usize) -> Self {
        Self {
            framing,
            max_frame_size,
        }
    }

    /// Attempt to take one frame payload from the buffer.
    /// Returns Ok(None) if more data is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> CodecResult<Option<BytesMut>> {
        match self.framing {
            Framing::Delimited => self.decode_delimited(buf),
            Framing::LengthPrefixed => self.decode_length_prefixed(buf),
        }
    }

    fn decode_delimited(&self, buf: &mut BytesMut) -> CodecResult<Option<BytesMut>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let parsed = {
            let mut rest = &buf[..];
            rmpv::decode::read_value(&mut rest).map(|_| buf.len() - rest.len())
        };

        match parsed {
            Ok(length) if length > self.max_frame_size => {
                Err(CodecError::FrameTooLarge(length, self.max_frame_size))
            }
            Ok(length) => Ok(Some(buf.split_to(length))),
            Err(e) if is_incomplete(&e) => {
                if buf.len() > self.max_frame_size {
                    return Err(CodecError::FrameTooLarge(buf.len(), self.max_frame_size));
                }
                Ok(None)
            }
            // The reader refused the value outright (nesting past its depth
            // limit). More bytes cannot fix that, so hand everything over as
            // one frame and let the caller see the decode failure.
            Err(_) => Ok(Some(buf.split())),
        }
    }

    fn decode_length_prefixed(&self, buf: &mut BytesMut) -> CodecResult<Option<BytesMut>> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(length, self.max_frame_size));
        }

        if buf.len() < LENGTH_PREFIX_SIZE + length {
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(buf.split_to(length)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(Framing::default(), DEFAULT_MAX_FRAME_SIZE)
    }
}
