//! Mesh frame codec
//!
//! A mesh message is a multi-part message: identity, protobuf [`RouteHeader`],
//! payload. On TCP each message is carried as
//!
//! ```text
//! ┌────────────┬─────────────────────────────┬─────┬─────────────────────────────┐
//! │ part_count │ u32 LE len │ part 1 bytes   │ ... │ u32 LE len │ part N bytes   │
//! │ u8         │                             │     │                             │
//! └────────────┴─────────────────────────────┴─────┴─────────────────────────────┘
//! ```
//!
//! Framing and content are decoded in two steps. [`MultipartDecoder`] only
//! splits the byte stream into parts; a framing error means the stream can no
//! longer be trusted and the connection must be closed. [`Inbound::parse`]
//! interprets the parts; a content error only drops that one message.

use crate::buffers::{BufferPool, Payload};
use crate::error::{CodecError, Result};
use crate::packet::RoutePacket;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use std::sync::Arc;
use tracing::debug;
use types::RouteHeader;

const PART_LEN_SIZE: usize = 4;

/// Outbound mesh message ready to be written to a connection
#[derive(Debug)]
pub struct MeshFrame {
    pub identity: Bytes,
    /// Empty for a readiness probe
    pub header: Bytes,
    pub payload: Payload,
}

impl MeshFrame {
    /// Readiness probe announcing `identity`
    pub fn probe(identity: &str) -> Self {
        Self {
            identity: Bytes::copy_from_slice(identity.as_bytes()),
            header: Bytes::new(),
            payload: Payload::Empty,
        }
    }

    /// Encode a packet sent by `identity`.
    ///
    /// `payload_size` is overwritten with the real payload length so the header
    /// can never disagree with the payload it travels with.
    pub fn from_packet(identity: &str, packet: RoutePacket) -> Result<Self> {
        let RoutePacket { mut header, payload } = packet;
        if header.msg_id.is_empty() {
            return Err(CodecError::MissingField { field: "msg_id" });
        }
        header.payload_size = u32::try_from(payload.len()).map_err(|_| CodecError::TooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;

        Ok(Self {
            identity: Bytes::copy_from_slice(identity.as_bytes()),
            header: Bytes::from(header.encode_to_vec()),
            payload,
        })
    }

    pub fn is_probe(&self) -> bool {
        self.header.is_empty()
    }

    pub fn part_count(&self) -> u8 {
        if self.is_probe() {
            2
        } else {
            3
        }
    }

    /// Bytes this frame occupies on the wire
    pub fn encoded_len(&self) -> usize {
        let body = self.identity.len() + self.header.len();
        let parts = self.part_count() as usize;
        let payload = if self.is_probe() { 0 } else { self.payload.len() };
        1 + parts * PART_LEN_SIZE + body + payload
    }

    /// Append the TCP carriage of this frame to `dst`
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(self.part_count());
        put_part(dst, &self.identity);
        put_part(dst, &self.header);
        if !self.is_probe() {
            put_part(dst, self.payload.as_slice());
        }
    }
}

fn put_part(dst: &mut BytesMut, part: &[u8]) {
    dst.put_u32_le(part.len() as u32);
    dst.put_slice(part);
}

/// Raw multi-part message split off the byte stream
#[derive(Debug, Clone, PartialEq)]
pub struct Multipart {
    pub parts: Vec<Bytes>,
}

/// Splits a TCP byte stream into multi-part messages
#[derive(Debug, Clone)]
pub struct MultipartDecoder {
    max_part_size: usize,
    max_parts: u8,
}

impl MultipartDecoder {
    pub fn new(max_part_size: usize) -> Self {
        Self {
            max_part_size,
            max_parts: 8,
        }
    }

    /// Take one complete message off the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; nothing is consumed in that
    /// case. Errors are framing errors and poison the stream.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Multipart>> {
        if src.is_empty() {
            return Ok(None);
        }
        let count = src[0];
        if count == 0 || count > self.max_parts {
            return Err(CodecError::InvalidLength {
                field: "part_count",
                value: i64::from(count),
            });
        }

        // Walk the length prefixes before consuming anything.
        let mut offset = 1;
        let mut lengths = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if src.len() < offset + PART_LEN_SIZE {
                return Ok(None);
            }
            let len = LittleEndian::read_u32(&src[offset..offset + PART_LEN_SIZE]) as usize;
            if len > self.max_part_size {
                return Err(CodecError::TooLarge {
                    size: len,
                    max: self.max_part_size,
                });
            }
            offset += PART_LEN_SIZE;
            if src.len() < offset + len {
                return Ok(None);
            }
            offset += len;
            lengths.push(len);
        }

        let mut frame = src.split_to(offset).freeze();
        let _ = frame.split_to(1);
        let parts = lengths
            .into_iter()
            .map(|len| {
                let _ = frame.split_to(PART_LEN_SIZE);
                frame.split_to(len)
            })
            .collect();
        Ok(Some(Multipart { parts }))
    }
}

/// Interpreted inbound mesh message
#[derive(Debug)]
pub enum Inbound {
    /// Zero-length header: the sender is ready to receive
    Probe { identity: String },
    Packet { identity: String, packet: RoutePacket },
}

impl Inbound {
    /// Interpret the parts of a mesh message, copying the payload into `pool`.
    ///
    /// Never trusts `payload_size` beyond the bytes actually present: any
    /// disagreement rejects the message.
    pub fn parse(message: Multipart, pool: &Arc<BufferPool>) -> Result<Self> {
        let mut parts = message.parts.into_iter();
        let identity = parts.next().unwrap_or_default();
        if identity.is_empty() {
            return Err(CodecError::MissingField { field: "identity" });
        }
        let identity = std::str::from_utf8(&identity)
            .map_err(|_| CodecError::InvalidUtf8 { field: "identity" })?
            .to_string();

        let header_bytes = parts.next().unwrap_or_default();
        if header_bytes.is_empty() {
            return Ok(Inbound::Probe { identity });
        }
        let header = RouteHeader::decode(header_bytes).map_err(|e| CodecError::protobuf("RouteHeader", e))?;

        let payload_part = parts.next().ok_or(CodecError::PartCount {
            expected: "3",
            got: 2,
        })?;
        let extra = parts.count();
        if extra > 0 {
            debug!(identity = %identity, extra, "Discarding extra mesh frame parts");
        }

        let declared = header.payload_size as usize;
        if declared != payload_part.len() {
            return Err(CodecError::PayloadSizeMismatch {
                declared,
                actual: payload_part.len(),
            });
        }

        let payload = if payload_part.is_empty() {
            Payload::Empty
        } else {
            Payload::Pooled(pool.rent_copy(&payload_part))
        };
        Ok(Inbound::Packet {
            identity,
            packet: RoutePacket { header, payload },
        })
    }
}
