//! Mesh protocol messages
//!
//! Both modules define protobuf messages with `prost` derives. Field numbers are
//! part of the wire contract between nodes and must never be renumbered.

pub mod header;
pub mod system;
