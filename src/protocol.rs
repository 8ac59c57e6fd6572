//! Wire format and frame codec.
//!
//! Every frame on the wire is three parts:
//!
//! ```text
//! [header: uvarint][length: uvarint][payload: length bytes]
//!
//! header = (stream_id << 3) | kind
//! ```
//!
//! Varints are unsigned LEB128 (7 data bits per byte, high bit = continue).

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};

/// Default maximum payload size of a single frame (1 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1 << 20;

/// Longest encoding of a u64 varint
pub const MAX_VARINT_LEN: usize = 10;

const KIND_BITS: u32 = 3;
const KIND_MASK: u64 = 0b111;

/// Largest stream id that fits in a frame header next to the kind bits
pub const MAX_STREAM_ID: u64 = u64::MAX >> KIND_BITS;

/// Which side of the session allocated a stream's numeric id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Opened by this side
    Initiator,
    /// Opened by the remote side
    Receiver,
}

impl Origin {
    /// The role the other side plays for the same stream
    pub fn flip(self) -> Self {
        match self {
            Origin::Initiator => Origin::Receiver,
            Origin::Receiver => Origin::Initiator,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Initiator => f.write_str("initiator"),
            Origin::Receiver => f.write_str("receiver"),
        }
    }
}

/// Identifies a stream within a session: numeric id plus local role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub id: u64,
    pub origin: Origin,
}

impl StreamKey {
    pub fn new(id: u64, origin: Origin) -> Self {
        Self { id, origin }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.origin, self.id)
    }
}

/// Message kind, the low three bits of the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    NewStream = 0,
    MessageFromReceiver = 1,
    MessageFromInitiator = 2,
    CloseFromReceiver = 3,
    CloseFromInitiator = 4,
    ResetFromReceiver = 5,
    ResetFromInitiator = 6,
}

/// What a frame asks the recipient to do with the addressed stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Open,
    Message,
    Close,
    Reset,
}

impl MessageKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn action(self) -> Action {
        match self {
            MessageKind::NewStream => Action::Open,
            MessageKind::MessageFromReceiver | MessageKind::MessageFromInitiator => Action::Message,
            MessageKind::CloseFromReceiver | MessageKind::CloseFromInitiator => Action::Close,
            MessageKind::ResetFromReceiver | MessageKind::ResetFromInitiator => Action::Reset,
        }
    }

    /// Role of the sending side for the addressed stream.
    ///
    /// NewStream is always sent by the initiator.
    pub fn sender_origin(self) -> Origin {
        match self {
            MessageKind::NewStream
            | MessageKind::MessageFromInitiator
            | MessageKind::CloseFromInitiator
            | MessageKind::ResetFromInitiator => Origin::Initiator,
            MessageKind::MessageFromReceiver
            | MessageKind::CloseFromReceiver
            | MessageKind::ResetFromReceiver => Origin::Receiver,
        }
    }

    fn message(origin: Origin) -> Self {
        match origin {
            Origin::Initiator => MessageKind::MessageFromInitiator,
            Origin::Receiver => MessageKind::MessageFromReceiver,
        }
    }

    fn close(origin: Origin) -> Self {
        match origin {
            Origin::Initiator => MessageKind::CloseFromInitiator,
            Origin::Receiver => MessageKind::CloseFromReceiver,
        }
    }

    fn reset(origin: Origin) -> Self {
        match origin {
            Origin::Initiator => MessageKind::ResetFromInitiator,
            Origin::Receiver => MessageKind::ResetFromReceiver,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageKind::NewStream),
            1 => Ok(MessageKind::MessageFromReceiver),
            2 => Ok(MessageKind::MessageFromInitiator),
            3 => Ok(MessageKind::CloseFromReceiver),
            4 => Ok(MessageKind::CloseFromInitiator),
            5 => Ok(MessageKind::ResetFromReceiver),
            6 => Ok(MessageKind::ResetFromInitiator),
            other => Err(Error::InvalidFrameHeader(other)),
        }
    }
}

/// Protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Numeric stream id as chosen by the stream's initiator
    pub stream_id: u64,

    pub kind: MessageKind,

    pub payload: Bytes,
}

impl Frame {
    pub fn new(stream_id: u64, kind: MessageKind, payload: Bytes) -> Self {
        Self {
            stream_id,
            kind,
            payload,
        }
    }

    /// Create a NewStream frame carrying the stream name
    pub fn new_stream(stream_id: u64, name: &str) -> Self {
        Self::new(
            stream_id,
            MessageKind::NewStream,
            Bytes::copy_from_slice(name.as_bytes()),
        )
    }

    /// Create a data frame sent by the local side of `key`
    pub fn message(key: StreamKey, data: Bytes) -> Self {
        Self::new(key.id, MessageKind::message(key.origin), data)
    }

    /// Create a Close frame sent by the local side of `key`
    pub fn close(key: StreamKey) -> Self {
        Self::new(key.id, MessageKind::close(key.origin), Bytes::new())
    }

    /// Create a Reset frame sent by the local side of `key`
    pub fn reset(key: StreamKey) -> Self {
        Self::new(key.id, MessageKind::reset(key.origin), Bytes::new())
    }

    /// Key of the addressed stream as seen by the side receiving this frame
    pub fn recipient_key(&self) -> StreamKey {
        StreamKey::new(self.stream_id, self.kind.sender_origin().flip())
    }

    /// Encoded header value: `(stream_id << 3) | kind`
    pub fn header(&self) -> u64 {
        (self.stream_id << KIND_BITS) | u64::from(self.kind.code())
    }
}

/// Append `value` as an unsigned varint
pub fn put_varint(dst: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        dst.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Number of bytes `value` occupies as a varint
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Parse a varint from the front of `src` without consuming it.
///
/// Returns `(value, bytes_used)`, or `None` if more bytes are needed.
pub fn peek_varint(src: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (i, &byte) in src.iter().enumerate() {
        if i >= MAX_VARINT_LEN || (i == MAX_VARINT_LEN - 1 && byte > 1) {
            return Err(Error::Protocol("varint overflows u64".into()));
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

/// Encode a single frame into a fresh buffer.
///
/// Fails with `FrameTooLarge` if the payload exceeds `max_message_size`.
pub fn encode(
    stream_id: u64,
    kind: MessageKind,
    payload: &[u8],
    max_message_size: usize,
) -> Result<BytesMut> {
    let mut codec = FrameCodec::new(max_message_size);
    let mut dst = BytesMut::new();
    codec.encode(
        Frame::new(stream_id, kind, Bytes::copy_from_slice(payload)),
        &mut dst,
    )?;
    Ok(dst)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header,
    Length { stream_id: u64, kind: MessageKind },
    Payload { stream_id: u64, kind: MessageKind, len: usize },
}

/// Resumable frame codec.
///
/// Decoding keeps its position across calls, so bytes can be fed in
/// arbitrary chunks.
#[derive(Debug)]
pub struct FrameCodec {
    max_message_size: usize,
    state: DecodeState,
}

impl FrameCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            state: DecodeState::Header,
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Whether the decoder is between frames
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::Header
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    let Some((header, used)) = peek_varint(src)? else {
                        return Ok(None);
                    };
                    let kind = MessageKind::try_from((header & KIND_MASK) as u8)?;
                    src.advance(used);
                    self.state = DecodeState::Length {
                        stream_id: header >> KIND_BITS,
                        kind,
                    };
                }
                DecodeState::Length { stream_id, kind } => {
                    let Some((len, used)) = peek_varint(src)? else {
                        return Ok(None);
                    };
                    if len > self.max_message_size as u64 {
                        return Err(Error::FrameTooLarge(
                            usize::try_from(len).unwrap_or(usize::MAX),
                            self.max_message_size,
                        ));
                    }
                    src.advance(used);
                    let len = len as usize;
                    src.reserve(len.saturating_sub(src.len()));
                    self.state = DecodeState::Payload {
                        stream_id,
                        kind,
                        len,
                    };
                }
                DecodeState::Payload {
                    stream_id,
                    kind,
                    len,
                } => {
                    if src.len() < len {
                        return Ok(None);
                    }
                    let payload = src.split_to(len).freeze();
                    self.state = DecodeState::Header;
                    return Ok(Some(Frame::new(stream_id, kind, payload)));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.is_idle() => Ok(None),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed in the middle of a frame",
            )
            .into()),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let len = frame.payload.len();
        if len > self.max_message_size {
            return Err(Error::FrameTooLarge(len, self.max_message_size));
        }
        if frame.stream_id > MAX_STREAM_ID {
            return Err(Error::Protocol(format!(
                "stream id {} does not fit in a frame header",
                frame.stream_id
            )));
        }

        let header = frame.header();
        dst.reserve(varint_len(header) + varint_len(len as u64) + len);
        put_varint(dst, header);
        put_varint(dst, len as u64);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
