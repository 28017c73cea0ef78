use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

/// Longest LEB128 encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Writes `value` as a LEB128 varint at the start of `buf` and returns the
/// number of bytes written.
///
/// # Panics
///
/// Panics if `buf` is shorter than the encoding; [`MAX_VARINT_LEN`] bytes
/// always suffice.
pub fn write_varint(buf: &mut [u8], mut value: u64) -> usize {
    let mut i = 0;
    while value >= 0x80 {
        buf[i] = (value as u8) | 0x80;
        value >>= 7;
        i += 1;
    }
    buf[i] = value as u8;
    i + 1
}

/// Decodes a LEB128 varint from the start of `buf`.
///
/// Returns the value and the number of bytes consumed. `(0, 0)` means the
/// input ended before a terminating byte, or the encoding ran past
/// [`MAX_VARINT_LEN`] bytes.
pub fn read_varint(buf: &[u8]) -> (u64, usize) {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u64::from(byte & 0x7f) << shift;
        if byte < 0x80 {
            return (value, i + 1);
        }
        shift += 7;
    }
    (0, 0)
}

/// Number of bytes `write_varint` needs for `value`.
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    (bits + 6) / 7
}

/// Writes `value` big-endian into the first two bytes of `buf`.
///
/// # Panics
///
/// Panics if `buf` is shorter than two bytes.
pub fn write_u16(buf: &mut [u8], value: u16) {
    buf[..2].copy_from_slice(&value.to_be_bytes());
}

/// Reads a big-endian `u16` from the first two bytes of `buf`.
///
/// # Panics
///
/// Panics if `buf` is shorter than two bytes.
pub fn read_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// A 128-bit identifier, usually written in UUID form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Identifier(pub [u8; 16]);

impl Identifier {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// Parses 32 hex digits, ignoring any `-` separators.
pub fn parse_identifier(s: &str) -> Result<Identifier, ParseError> {
    let digits: Vec<u8> = s.bytes().filter(|&b| b != b'-').collect();
    if digits.len() != 32 {
        return Err(ParseError::IdentifierLength(digits.len()));
    }

    let mut out = [0u8; 16];
    for (slot, pair) in out.iter_mut().zip(digits.chunks_exact(2)) {
        *slot = (hex_value(pair[0])? << 4) | hex_value(pair[1])?;
    }
    Ok(Identifier(out))
}

fn hex_value(digit: u8) -> Result<u8, ParseError> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        other => Err(ParseError::InvalidHex(char::from(other))),
    }
}

impl FromStr for Identifier {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_identifier(s)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic]
    fn read_u16_needs_two_bytes() {
        read_u16(&[0x01]);
    }

    #[test]
    fn varint_round_trip() {
        let samples = [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX - 1, u64::MAX];
        for value in samples {
            let mut buf = [0u8; MAX_VARINT_LEN];
            let n = write_varint(&mut buf, value);
            assert_eq!(n, varint_len(value), "length for {}", value);
            assert_eq!(read_varint(&buf[..n]), (value, n));
        }
    }

    #[test]
    fn varint_known_encodings() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        assert_eq!(write_varint(&mut buf, 300), 2);
        assert_eq!(&buf[..2], &[0xac, 0x02]);
        assert_eq!(write_varint(&mut buf, u64::MAX), MAX_VARINT_LEN);
    }

    #[test]
    fn varint_incomplete_input() {
        assert_eq!(read_varint(&[]), (0, 0));
        assert_eq!(read_varint(&[0x80, 0x80]), (0, 0));
        // Zero is a legitimate one-byte value.
        assert_eq!(read_varint(&[0x00]), (0, 1));
        // Trailing bytes are left for the caller.
        assert_eq!(read_varint(&[0x05, 0xff]), (5, 1));
    }

    #[test]
    fn varint_rejects_overlong() {
        let overlong = [0xffu8; 11];
        assert_eq!(read_varint(&overlong), (0, 0));
    }

    #[test]
    fn u16_is_big_endian() {
        let mut buf = [0u8; 2];
        write_u16(&mut buf, 0x01bb);
        assert_eq!(buf, [0x01, 0xbb]);
        assert_eq!(read_u16(&buf), 443);
    }

    #[test]
    fn identifier_with_and_without_dashes() {
        let dashed = parse_identifier("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let plain = parse_identifier("550e8400e29b41d4a716446655440000").unwrap();
        assert_eq!(dashed, plain);
        assert_eq!(
            dashed.0,
            [0x55, 0x0e, 0x84, 0x00, 0xe2, 0x9b, 0x41, 0xd4, 0xa7, 0x16, 0x44, 0x66, 0x55, 0x44, 0x00, 0x00]
        );
        assert_eq!(dashed.to_string(), "550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn identifier_is_case_insensitive() {
        let upper: Identifier = "550E8400E29B41D4A716446655440000".parse().unwrap();
        let lower: Identifier = "550e8400e29b41d4a716446655440000".parse().unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn identifier_errors() {
        assert_eq!(
            parse_identifier("550e8400e29b41d4a71644665544000"),
            Err(ParseError::IdentifierLength(31))
        );
        assert_eq!(
            parse_identifier("550e8400e29b41d4a71644665544000g"),
            Err(ParseError::InvalidHex('g'))
        );
    }
}
