use std::convert::TryFrom;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const LENGTH_FIELD_LEN: usize = 4;
/// Type byte plus correlation id.
const HEADER_LEN: usize = 1 + 8;
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Create = 0x01,
    Get = 0x02,
    Delete = 0x03,
    Enqueue = 0x04,
    Dequeue = 0x05,
    Ok = 0x06,
    Error = 0x07,
    Ping = 0x08,
    Pong = 0x09,
}

impl From<FrameType> for u8 {
    fn from(t: FrameType) -> Self {
        t as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameDecodeError;

    fn try_from(value: u8) -> Result<Self, FrameDecodeError> {
        match value {
            0x01 => Ok(FrameType::Create),
            0x02 => Ok(FrameType::Get),
            0x03 => Ok(FrameType::Delete),
            0x04 => Ok(FrameType::Enqueue),
            0x05 => Ok(FrameType::Dequeue),
            0x06 => Ok(FrameType::Ok),
            0x07 => Ok(FrameType::Error),
            0x08 => Ok(FrameType::Ping),
            0x09 => Ok(FrameType::Pong),
            other => Err(FrameDecodeError::UnknownFrameType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: FrameType,
    pub correlation_id: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: FrameType, correlation_id: u64, payload: Bytes) -> Self {
        Self {
            msg_type,
            correlation_id,
            payload,
        }
    }

    pub fn empty(msg_type: FrameType, correlation_id: u64) -> Self {
        Self::new(msg_type, correlation_id, Bytes::new())
    }
}

#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("invalid frame length: {0}")]
    InvalidLength(u32),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),

    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Error)]
pub enum FrameEncodeError {
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), FrameEncodeError> {
    let len = s.len();
    let len_u16 = u16::try_from(len).map_err(|_| FrameEncodeError::PayloadTooLarge(len))?;
    buf.put_u16(len_u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(slice: &mut &[u8], total: usize) -> Result<String, FrameDecodeError> {
    if slice.remaining() < 2 {
        return Err(FrameDecodeError::InvalidLength(total as u32));
    }
    let len = slice.get_u16() as usize;
    if slice.remaining() < len {
        return Err(FrameDecodeError::InvalidLength(total as u32));
    }
    let raw = slice.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| FrameDecodeError::InvalidUtf8)
}

/// CREATE / GET / DELETE / DEQUEUE request and the OK reply to CREATE / GET:
/// [u16 name_len][name_bytes]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePayload {
    pub name: String,
}

impl NamePayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::with_capacity(2 + self.name.len());
        put_str(&mut buf, &self.name)?;
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut slice = &payload[..];
        let name = get_str(&mut slice, payload.len())?;
        if slice.has_remaining() {
            return Err(FrameDecodeError::InvalidLength(payload.len() as u32));
        }
        Ok(Self { name })
    }
}

/// ENQUEUE request and the OK reply to DEQUEUE:
/// [u16 id_len][id_bytes][item_bytes...]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemPayload {
    pub queue: String,
    pub item: Bytes,
}

impl ItemPayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::with_capacity(2 + self.queue.len() + self.item.len());
        put_str(&mut buf, &self.queue)?;
        buf.put_slice(&self.item);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        let mut slice = &payload[..];
        let queue = get_str(&mut slice, payload.len())?;
        let consumed = payload.len() - slice.remaining();
        Ok(Self {
            queue,
            item: payload.slice(consumed..),
        })
    }
}

/// ERROR payload: [u16 code][u16 message_len][message_bytes]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
}

impl ErrorPayload {
    pub fn encode(&self) -> Result<Bytes, FrameEncodeError> {
        let mut buf = BytesMut::with_capacity(2 + 2 + self.message.len());
        buf.put_u16(self.code);
        put_str(&mut buf, &self.message)?;
        Ok(buf.freeze())
    }

    pub fn decode(payload: &Bytes) -> Result<Self, FrameDecodeError> {
        if payload.len() < 4 {
            return Err(FrameDecodeError::InvalidLength(payload.len() as u32));
        }

        let mut slice = &payload[..];
        let code = slice.get_u16();
        let message = get_str(&mut slice, payload.len())?;
        if slice.has_remaining() {
            return Err(FrameDecodeError::InvalidLength(payload.len() as u32));
        }

        Ok(Self { code, message })
    }
}

/// Encode a frame into the provided buffer.
#[inline(always)]
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameEncodeError> {
    let payload_len = frame.payload.len();
    let total_len = HEADER_LEN
        .checked_add(payload_len)
        .ok_or(FrameEncodeError::PayloadTooLarge(payload_len))?;

    if total_len > MAX_FRAME_SIZE as usize {
        return Err(FrameEncodeError::PayloadTooLarge(payload_len));
    }

    dst.reserve(LENGTH_FIELD_LEN + total_len);
    dst.put_u32(total_len as u32);
    dst.put_u8(frame.msg_type.into());
    dst.put_u64(frame.correlation_id);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Try to decode a single frame from the buffer.
///
/// Returns `Ok(None)` if there is not yet enough data to decode a full frame.
#[inline(always)]
pub fn try_decode_frame(src: &mut BytesMut) -> Result<Option<Frame>, FrameDecodeError> {
    if src.len() < LENGTH_FIELD_LEN {
        return Ok(None);
    }

    let mut length_bytes = &src[..LENGTH_FIELD_LEN];
    let frame_len = length_bytes.get_u32();

    if frame_len > MAX_FRAME_SIZE {
        return Err(FrameDecodeError::FrameTooLarge(frame_len));
    }

    let frame_len_usize = frame_len as usize;
    if frame_len_usize < HEADER_LEN {
        return Err(FrameDecodeError::InvalidLength(frame_len));
    }

    if src.len() < LENGTH_FIELD_LEN + frame_len_usize {
        return Ok(None);
    }

    let mut frame_bytes = src.split_to(LENGTH_FIELD_LEN + frame_len_usize);
    frame_bytes.advance(LENGTH_FIELD_LEN);

    let msg_type = FrameType::try_from(frame_bytes.get_u8())?;
    let correlation_id = frame_bytes.get_u64();
    let payload = frame_bytes.freeze();

    Ok(Some(Frame {
        msg_type,
        correlation_id,
        payload,
    }))
}
