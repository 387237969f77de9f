//! Client-session frame codec
//!
//! Clients talk to a play node over a single-part, length-prefixed frame:
//!
//! ```text
//! request:  i32 contentSize | u8 idLen | msgId | u16 msgSeq | u8 stageLen | stageId | payload
//! response: i32 contentSize | u8 idLen | msgId | u16 msgSeq | u8 stageLen | stageId | u16 errorCode | payload
//! ```
//!
//! All integers are little-endian and `contentSize` counts every byte after
//! itself. Any frame whose declared lengths run past the bytes available is a
//! protocol violation: the session is closed rather than resynchronised.

use crate::buffers::{BufferPool, Payload};
use crate::error::{CodecError, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// Length of the `contentSize` prefix
pub const SIZE_PREFIX_LEN: usize = 4;

/// Longest msg id or stage id that fits the u8 length prefix
pub const MAX_ID_LEN: usize = u8::MAX as usize;

/// Decoded client → server frame
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRequest {
    pub msg_id: String,
    pub msg_seq: u16,
    pub stage_id: String,
    pub payload: Payload,
}

/// Decoded server → client frame
#[derive(Debug, Clone, PartialEq)]
pub struct ClientResponse {
    pub msg_id: String,
    pub msg_seq: u16,
    pub stage_id: String,
    pub error_code: u16,
    pub payload: Payload,
}

/// Append a request frame to `dst`
pub fn encode_request(dst: &mut BytesMut, msg_id: &str, msg_seq: u16, stage_id: &str, payload: &[u8]) -> Result<()> {
    check_id("msg_id", msg_id)?;
    check_id("stage_id", stage_id)?;
    let content = 1 + msg_id.len() + 2 + 1 + stage_id.len() + payload.len();
    let content = i32::try_from(content).map_err(|_| CodecError::TooLarge {
        size: content,
        max: i32::MAX as usize,
    })?;

    dst.reserve(SIZE_PREFIX_LEN + content as usize);
    dst.put_i32_le(content);
    put_id(dst, msg_id);
    dst.put_u16_le(msg_seq);
    put_id(dst, stage_id);
    dst.put_slice(payload);
    Ok(())
}

/// Append a response frame to `dst`
pub fn encode_response(
    dst: &mut BytesMut,
    msg_id: &str,
    msg_seq: u16,
    stage_id: &str,
    error_code: u16,
    payload: &[u8],
) -> Result<()> {
    check_id("msg_id", msg_id)?;
    check_id("stage_id", stage_id)?;
    let content = 1 + msg_id.len() + 2 + 1 + stage_id.len() + 2 + payload.len();
    let content = i32::try_from(content).map_err(|_| CodecError::TooLarge {
        size: content,
        max: i32::MAX as usize,
    })?;

    dst.reserve(SIZE_PREFIX_LEN + content as usize);
    dst.put_i32_le(content);
    put_id(dst, msg_id);
    dst.put_u16_le(msg_seq);
    put_id(dst, stage_id);
    dst.put_u16_le(error_code);
    dst.put_slice(payload);
    Ok(())
}

fn check_id(field: &'static str, value: &str) -> Result<()> {
    if value.len() > MAX_ID_LEN {
        return Err(CodecError::FieldTooLong {
            field,
            len: value.len(),
            max: MAX_ID_LEN,
        });
    }
    Ok(())
}

fn put_id(dst: &mut BytesMut, value: &str) {
    dst.put_u8(value.len() as u8);
    dst.put_slice(value.as_bytes());
}

/// Incremental decoder for client-session frames
#[derive(Debug, Clone)]
pub struct ClientFrameDecoder {
    max_frame_size: usize,
    pool: Arc<BufferPool>,
}

impl ClientFrameDecoder {
    pub fn new(max_frame_size: usize, pool: Arc<BufferPool>) -> Self {
        Self { max_frame_size, pool }
    }

    /// Take one request frame off `src`; `Ok(None)` when incomplete
    pub fn decode_request(&self, src: &mut BytesMut) -> Result<Option<ClientRequest>> {
        let Some(mut content) = self.take_content(src)? else {
            return Ok(None);
        };
        let msg_id = read_id(&mut content, "msg_id")?;
        let msg_seq = read_u16(&mut content, "msg_seq")?;
        let stage_id = read_id(&mut content, "stage_id")?;
        let payload = self.payload(content);
        Ok(Some(ClientRequest {
            msg_id,
            msg_seq,
            stage_id,
            payload,
        }))
    }

    /// Take one response frame off `src`; `Ok(None)` when incomplete
    pub fn decode_response(&self, src: &mut BytesMut) -> Result<Option<ClientResponse>> {
        let Some(mut content) = self.take_content(src)? else {
            return Ok(None);
        };
        let msg_id = read_id(&mut content, "msg_id")?;
        let msg_seq = read_u16(&mut content, "msg_seq")?;
        let stage_id = read_id(&mut content, "stage_id")?;
        let error_code = read_u16(&mut content, "error_code")?;
        let payload = self.payload(content);
        Ok(Some(ClientResponse {
            msg_id,
            msg_seq,
            stage_id,
            error_code,
            payload,
        }))
    }

    fn take_content(&self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if src.len() < SIZE_PREFIX_LEN {
            return Ok(None);
        }
        let declared = LittleEndian::read_i32(&src[..SIZE_PREFIX_LEN]);
        if declared < 0 {
            return Err(CodecError::InvalidLength {
                field: "contentSize",
                value: i64::from(declared),
            });
        }
        let declared = declared as usize;
        if declared > self.max_frame_size {
            return Err(CodecError::TooLarge {
                size: declared,
                max: self.max_frame_size,
            });
        }
        if src.len() < SIZE_PREFIX_LEN + declared {
            return Ok(None);
        }
        src.advance(SIZE_PREFIX_LEN);
        Ok(Some(src.split_to(declared).freeze()))
    }

    fn payload(&self, content: Bytes) -> Payload {
        if content.is_empty() {
            Payload::Empty
        } else {
            Payload::Pooled(self.pool.rent_copy(&content))
        }
    }
}

fn read_u16(content: &mut Bytes, field: &'static str) -> Result<u16> {
    if content.remaining() < 2 {
        return Err(CodecError::truncated(2, content.remaining(), field));
    }
    Ok(content.get_u16_le())
}

fn read_id(content: &mut Bytes, field: &'static str) -> Result<String> {
    if content.remaining() < 1 {
        return Err(CodecError::truncated(1, 0, field));
    }
    let len = content.get_u8() as usize;
    if content.remaining() < len {
        return Err(CodecError::truncated(len, content.remaining(), field));
    }
    let raw = content.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8 { field })
}
