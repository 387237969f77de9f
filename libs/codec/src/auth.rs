//! Stage-type extraction for client connectors
//!
//! Connectors need the resolved stage type from an authentication reply but do
//! not want to link the full message schema. The stage type is always a
//! length-delimited field with tag 6; every other field is skipped with
//! prost's wire-level helpers.

use bytes::Buf;
use prost::encoding::{decode_key, decode_varint, skip_field, DecodeContext, WireType};

/// Field number of the stage type inside `AuthenticateRes`
pub const STAGE_TYPE_TAG: u32 = 6;

/// Read the stage type (tag 6) out of an authentication reply payload.
///
/// Returns `None` when the field is absent, not UTF-8, or the payload is
/// malformed before the field is reached.
pub fn extract_stage_type(payload: &[u8]) -> Option<String> {
    let mut buf = payload;
    while buf.has_remaining() {
        let (tag, wire_type) = decode_key(&mut buf).ok()?;
        if tag == STAGE_TYPE_TAG && wire_type == WireType::LengthDelimited {
            let len = usize::try_from(decode_varint(&mut buf).ok()?).ok()?;
            if len > buf.remaining() {
                return None;
            }
            return String::from_utf8(buf[..len].to_vec()).ok();
        }
        skip_field(wire_type, tag, &mut buf, DecodeContext::default()).ok()?;
    }
    None
}
