//! The `SocketData` message carried by the gRPC transports:
//!
//! ```text
//! message SocketData { bytes content = 1; }
//! ```

use bytes::Bytes;

use crate::codec::{read_varint, write_varint, MAX_VARINT_LEN};
use crate::error::FrameError;

/// Field 1, wire type 2 (length delimited).
pub const CONTENT_TAG: u8 = 0x0a;

const WIRE_VARINT: u64 = 0;
const WIRE_FIXED64: u64 = 1;
const WIRE_LEN: u64 = 2;
const WIRE_FIXED32: u64 = 5;

/// Bytes that precede `content_len` bytes of content in an encoded message.
pub struct Prefix {
    buf: [u8; 1 + MAX_VARINT_LEN],
    len: usize,
}

impl Prefix {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

pub fn encode_prefix(content_len: usize) -> Prefix {
    let mut buf = [0u8; 1 + MAX_VARINT_LEN];
    buf[0] = CONTENT_TAG;
    let n = write_varint(&mut buf[1..], content_len as u64);
    Prefix { buf, len: 1 + n }
}

pub fn encode(content: &[u8]) -> Bytes {
    let prefix = encode_prefix(content.len());
    let mut out = Vec::with_capacity(prefix.as_bytes().len() + content.len());
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(content);
    Bytes::from(out)
}

/// Extracts `content` from an encoded message without copying it.
///
/// Unknown fields are skipped; if the field repeats, the last one wins. A
/// message without the field decodes to empty content.
pub fn decode(msg: &Bytes) -> Result<Bytes, FrameError> {
    let mut content = Bytes::new();
    let mut pos = 0;
    while pos < msg.len() {
        let (key, n) = read_varint(&msg[pos..]);
        if n == 0 {
            return Err(FrameError::Envelope("truncated field key"));
        }
        pos += n;
        let field = key >> 3;
        match key & 0x7 {
            WIRE_VARINT => {
                let (_, n) = read_varint(&msg[pos..]);
                if n == 0 {
                    return Err(FrameError::Envelope("truncated varint field"));
                }
                pos += n;
            }
            WIRE_FIXED64 => pos = skip(msg.len(), pos, 8)?,
            WIRE_FIXED32 => pos = skip(msg.len(), pos, 4)?,
            WIRE_LEN => {
                let (len, n) = read_varint(&msg[pos..]);
                if n == 0 {
                    return Err(FrameError::Envelope("truncated length"));
                }
                let start = pos + n;
                let end = skip(msg.len(), start, len)?;
                if field == 1 {
                    content = msg.slice(start..end);
                }
                pos = end;
            }
            _ => return Err(FrameError::Envelope("unsupported wire type")),
        }
    }
    Ok(content)
}

fn skip(total: usize, pos: usize, len: u64) -> Result<usize, FrameError> {
    usize::try_from(len)
        .ok()
        .and_then(|len| pos.checked_add(len))
        .filter(|&end| end <= total)
        .ok_or(FrameError::Envelope("field runs past end of message"))
}
