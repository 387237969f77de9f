//! Application packets and routed mesh packets
//!
//! [`Packet`] is what stage and actor hooks see: a message id plus payload.
//! [`RoutePacket`] is a packet together with the [`RouteHeader`] that moves it
//! across the mesh. Both own their payload; sending one moves it.

use crate::buffers::Payload;
use crate::error::{CodecError, Result};
use types::RouteHeader;

/// Message id + payload handed to application hooks
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Packet {
    msg_id: String,
    payload: Payload,
}

impl Packet {
    pub fn new(msg_id: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            msg_id: msg_id.into(),
            payload: payload.into(),
        }
    }

    pub fn empty(msg_id: impl Into<String>) -> Self {
        Self::new(msg_id, Payload::Empty)
    }

    /// Encode a protobuf message as the payload
    pub fn from_message<M: prost::Message>(msg_id: impl Into<String>, message: &M) -> Self {
        Self::new(msg_id, message.encode_to_vec())
    }

    /// Decode the payload as a protobuf message
    pub fn parse<M: prost::Message + Default>(&self) -> Result<M> {
        M::decode(self.payload.as_slice()).map_err(|e| CodecError::protobuf(std::any::type_name::<M>(), e))
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn data(&self) -> &[u8] {
        self.payload.as_slice()
    }

    pub fn into_parts(self) -> (String, Payload) {
        (self.msg_id, self.payload)
    }
}

/// A packet addressed on the mesh
#[derive(Debug)]
pub struct RoutePacket {
    pub header: RouteHeader,
    pub payload: Payload,
}

impl RoutePacket {
    pub fn new(header: RouteHeader, payload: impl Into<Payload>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Wrap an application packet; the header's msg id is taken from the packet
    pub fn from_packet(mut header: RouteHeader, packet: Packet) -> Self {
        let (msg_id, payload) = packet.into_parts();
        header.msg_id = msg_id;
        Self { header, payload }
    }

    /// Unwrap into the application view, consuming the header
    pub fn into_packet(self) -> Packet {
        Packet {
            msg_id: self.header.msg_id,
            payload: self.payload,
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_seq(&self) -> u16 {
        self.header.seq()
    }

    pub fn is_reply(&self) -> bool {
        self.header.is_reply
    }

    pub fn parse<M: prost::Message + Default>(&self) -> Result<M> {
        M::decode(self.payload.as_slice()).map_err(|e| CodecError::protobuf(std::any::type_name::<M>(), e))
    }
}
