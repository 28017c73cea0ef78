//! gRPC-Web binary framing.
//!
//! Format: `[flags: 1] [length: 4, big endian] [payload: length]`. Only bit 0
//! of the flags is defined (compressed). Zero-length frames are invalid.

use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;
use crate::pool::{BufferPool, PooledBuffer, SizeClass};

pub const HEADER_LEN: usize = 5;
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
pub const FLAG_COMPRESSED: u8 = 0x01;

pub const CONTENT_TYPE_GRPC_WEB: &str = "application/grpc-web+proto";
pub const CONTENT_TYPE_GRPC: &str = "application/grpc+proto";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub compressed: bool,
    pub len: usize,
}

impl FrameHeader {
    /// Validates a raw header. Oversized and zero lengths are rejected here,
    /// before any body byte is looked at.
    pub fn parse(raw: [u8; HEADER_LEN]) -> Result<Self, FrameError> {
        let len = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]) as usize;
        if len == 0 {
            return Err(FrameError::ZeroLength);
        }
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        Ok(Self {
            compressed: raw[0] & FLAG_COMPRESSED != 0,
            len,
        })
    }

    pub fn encode(&self) -> Result<[u8; HEADER_LEN], FrameError> {
        if self.len == 0 {
            return Err(FrameError::EmptyPayload);
        }
        if self.len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(self.len));
        }
        let mut raw = [0u8; HEADER_LEN];
        raw[0] = if self.compressed { FLAG_COMPRESSED } else { 0 };
        raw[1..].copy_from_slice(&(self.len as u32).to_be_bytes());
        Ok(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub compressed: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: Bytes) -> Self {
        Self {
            compressed: false,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        encode_frame(&self.payload, self.compressed)
    }

    /// Checks whether `src` holds a complete frame and returns its encoded
    /// length. `None` means more data is needed.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<Option<usize>, FrameError> {
        if src.remaining() < HEADER_LEN {
            return Ok(None);
        }

        let pos = src.position();
        let mut raw = [0u8; HEADER_LEN];
        src.copy_to_slice(&mut raw);
        src.set_position(pos);

        let header = FrameHeader::parse(raw)?;
        if src.remaining() < HEADER_LEN + header.len {
            return Ok(None);
        }
        Ok(Some(HEADER_LEN + header.len))
    }

    /// Parses one complete frame from the front of `src`.
    pub fn parse(src: &mut Bytes) -> Result<Frame, FrameError> {
        if src.len() < HEADER_LEN {
            return Err(FrameError::TruncatedHeader);
        }
        let mut raw = [0u8; HEADER_LEN];
        src.copy_to_slice(&mut raw);
        let header = FrameHeader::parse(raw)?;
        if src.len() < header.len {
            return Err(FrameError::TruncatedBody {
                expected: header.len,
                read: src.len(),
            });
        }
        let payload = src.split_to(header.len);
        if header.compressed {
            return Err(FrameError::UnsupportedCompression);
        }
        Ok(Frame {
            compressed: false,
            payload,
        })
    }
}

pub fn encode_frame(payload: &[u8], compressed: bool) -> Result<Bytes, FrameError> {
    let mut dst = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_frame_into(&mut dst, payload, compressed)?;
    Ok(dst.freeze())
}

pub fn encode_frame_into(dst: &mut BytesMut, payload: &[u8], compressed: bool) -> Result<(), FrameError> {
    let header = FrameHeader {
        compressed,
        len: payload.len(),
    }
    .encode()?;
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_slice(&header);
    dst.put_slice(payload);
    Ok(())
}

/// Incremental decode over an accumulation buffer. Complete frames are split
/// off the front of `buf`; `None` means more data is needed.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    let mut cursor = Cursor::new(&buf[..]);
    match Frame::check(&mut cursor)? {
        Some(len) => {
            let mut frame = buf.split_to(len).freeze();
            Frame::parse(&mut frame).map(Some)
        }
        None => Ok(None),
    }
}

enum Stage {
    Pooled(PooledBuffer<'static>),
    Heap(Vec<u8>),
    Shared(Bytes),
}

impl Stage {
    fn for_len(len: usize) -> Self {
        match SizeClass::fitting(len) {
            Some(class) => Stage::Pooled(BufferPool::global().checkout(class)),
            None => Stage::Heap(vec![0u8; len]),
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Stage::Pooled(buf) => &buf[..],
            Stage::Heap(buf) => &buf[..],
            Stage::Shared(buf) => &buf[..],
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Stage::Pooled(buf) => &mut buf[..],
            Stage::Heap(buf) => &mut buf[..],
            // Shared stages are created already filled.
            Stage::Shared(_) => &mut [],
        }
    }
}

/// Remainder of a frame that did not fit the caller's buffer.
struct Staged {
    buf: Stage,
    pos: usize,
    end: usize,
}

/// Reads frames from a byte stream.
///
/// [`FrameReader::read`] hands out payload bytes through buffers of any
/// size. A frame that fits is read straight into the caller's buffer;
/// otherwise it is staged and drained by later calls.
pub struct FrameReader<R> {
    inner: R,
    staged: Option<Staged>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, staged: None }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn has_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// Copies staged bytes into `buf`, returning how many were copied.
    pub fn drain_staged(&mut self, buf: &mut [u8]) -> usize {
        let Some(staged) = self.staged.as_mut() else {
            return 0;
        };
        let n = buf.len().min(staged.end - staged.pos);
        buf[..n].copy_from_slice(&staged.buf.as_slice()[staged.pos..staged.pos + n]);
        staged.pos += n;
        if staged.pos == staged.end {
            self.staged = None;
        }
        n
    }

    /// Stages already decoded bytes so later reads drain them first.
    pub fn stage_bytes(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        let end = bytes.len();
        self.staged = Some(Staged {
            buf: Stage::Shared(bytes),
            pos: 0,
            end,
        });
    }

    /// Reads the next `len` body bytes into the staging buffer.
    pub async fn stage_body(&mut self, len: usize) -> Result<(), FrameError> {
        let mut buf = Stage::for_len(len);
        self.read_body(&mut buf.as_mut_slice()[..len]).await?;
        self.staged = Some(Staged { buf, pos: 0, end: len });
        Ok(())
    }

    /// Reads one frame header. `None` is a clean end of stream at a frame
    /// boundary.
    pub async fn read_header(&mut self) -> Result<Option<FrameHeader>, FrameError> {
        let mut raw = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = self.inner.read(&mut raw[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(FrameError::TruncatedHeader);
            }
            filled += n;
        }
        FrameHeader::parse(raw).map(Some)
    }

    /// Fills `buf` from the current frame body.
    pub async fn read_body(&mut self, buf: &mut [u8]) -> Result<(), FrameError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(FrameError::TruncatedBody {
                    expected: buf.len(),
                    read: filled,
                });
            }
            filled += n;
        }
        Ok(())
    }

    /// Reads one whole frame payload. Any staged remainder is returned
    /// first, as if it were a frame of its own.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if let Some(staged) = self.staged.take() {
            return Ok(Some(Bytes::copy_from_slice(
                &staged.buf.as_slice()[staged.pos..staged.end],
            )));
        }
        let Some(header) = self.read_header().await? else {
            return Ok(None);
        };
        if header.compressed {
            return Err(FrameError::UnsupportedCompression);
        }
        let mut payload = BytesMut::zeroed(header.len);
        self.read_body(&mut payload).await?;
        Ok(Some(payload.freeze()))
    }

    /// Reads payload bytes into `buf`. `Ok(0)` means end of stream (or an
    /// empty `buf`).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, FrameError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.has_staged() {
            return Ok(self.drain_staged(buf));
        }
        let Some(header) = self.read_header().await? else {
            return Ok(0);
        };
        if header.compressed {
            return Err(FrameError::UnsupportedCompression);
        }
        if header.len <= buf.len() {
            self.read_body(&mut buf[..header.len]).await?;
            return Ok(header.len);
        }
        self.stage_body(header.len).await?;
        Ok(self.drain_staged(buf))
    }
}

/// Writes every payload handed to it as exactly one frame.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Writes `payload` as one frame. Empty payloads write nothing.
    pub async fn write(&mut self, payload: &[u8]) -> Result<usize, FrameError> {
        if payload.is_empty() {
            return Ok(0);
        }
        self.write_frame(payload).await?;
        Ok(payload.len())
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        self.write_frame_vectored(&[payload]).await
    }

    /// Writes one frame whose payload is the concatenation of `parts`.
    pub async fn write_frame_vectored(&mut self, parts: &[&[u8]]) -> Result<(), FrameError> {
        let len = parts.iter().map(|part| part.len()).sum();
        let header = FrameHeader {
            compressed: false,
            len,
        }
        .encode()?;
        self.inner.write_all(&header).await?;
        for part in parts {
            self.inner.write_all(part).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), FrameError> {
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(payloads: &[&[u8]]) -> Vec<u8> {
        let mut out = BytesMut::new();
        for payload in payloads {
            encode_frame_into(&mut out, payload, false).unwrap();
        }
        out.to_vec()
    }

    #[test]
    fn encode_layout() {
        let encoded = encode_frame(b"abc", false).unwrap();
        assert_eq!(&encoded[..], &[0, 0, 0, 0, 3, b'a', b'b', b'c']);
        let compressed = encode_frame(b"abc", true).unwrap();
        assert_eq!(compressed[0], FLAG_COMPRESSED);
    }

    #[test]
    fn encode_rejects_empty() {
        assert!(matches!(encode_frame(b"", false), Err(FrameError::EmptyPayload)));
        assert!(matches!(Frame::new(Bytes::new()).to_bytes(), Err(FrameError::EmptyPayload)));
    }

    #[test]
    fn decode_round_trip() {
        let payload = vec![0x5au8; 70_000];
        let mut buf = BytesMut::from(&encode_frame(&payload, false).unwrap()[..]);
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, Bytes::from(payload));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let encoded = encode_frame(b"hello", false).unwrap();
        let mut buf = BytesMut::from(&encoded[..3]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&encoded[3..7]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&encoded[7..]);
        buf.extend_from_slice(&encoded);
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap().payload, Bytes::from_static(b"hello"));
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap().payload, Bytes::from_static(b"hello"));
        assert!(decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_bad_headers() {
        let mut zero = BytesMut::from(&[0u8, 0, 0, 0, 0][..]);
        assert!(matches!(decode_frame(&mut zero), Err(FrameError::ZeroLength)));

        // Only the header is present; the limit is enforced without a body.
        let mut huge = BytesMut::from(&[0u8, 0x04, 0, 0, 1][..]);
        assert!(matches!(decode_frame(&mut huge), Err(FrameError::TooLarge(len)) if len == MAX_FRAME_LEN + 1));

        let mut compressed = BytesMut::from(&encode_frame(b"zz", true).unwrap()[..]);
        assert!(matches!(decode_frame(&mut compressed), Err(FrameError::UnsupportedCompression)));
    }

    #[test]
    fn parse_reports_truncation() {
        let mut short = Bytes::from_static(&[0, 0, 0]);
        assert!(matches!(Frame::parse(&mut short), Err(FrameError::TruncatedHeader)));
        let mut body = Bytes::from_static(&[0, 0, 0, 0, 4, 1, 2]);
        assert!(matches!(
            Frame::parse(&mut body),
            Err(FrameError::TruncatedBody { expected: 4, read: 2 })
        ));
    }

    #[tokio::test]
    async fn reader_reassembles_for_any_buffer_size() {
        let payloads: Vec<Vec<u8>> = vec![
            b"a".to_vec(),
            (0..=255u8).collect(),
            vec![7u8; 600],
            b"tail".to_vec(),
        ];
        let refs: Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();
        let wire = frames(&refs);
        let expected: Vec<u8> = payloads.concat();

        for size in [1usize, 2, 3, 5, 64, 255, 256, 1024] {
            let mut reader = FrameReader::new(&wire[..]);
            let mut out = Vec::new();
            let mut buf = vec![0u8; size];
            loop {
                let n = reader.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            assert_eq!(out, expected, "buffer size {}", size);
        }
    }

    #[tokio::test]
    async fn reader_keeps_frame_boundaries_when_buffer_is_large() {
        let wire = frames(&[b"first", b"second"]);
        let mut reader = FrameReader::new(&wire[..]);
        let mut buf = [0u8; 64];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"first");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 6);
        assert_eq!(&buf[..6], b"second");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn next_frame_returns_remainder_first() {
        let wire = frames(&[b"0123456789", b"next"]);
        let mut reader = FrameReader::new(&wire[..]);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), Bytes::from_static(b"456789"));
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), Bytes::from_static(b"next"));
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reader_errors() {
        let mut partial_header = FrameReader::new(&[0u8, 0, 0][..]);
        assert!(matches!(partial_header.next_frame().await, Err(FrameError::TruncatedHeader)));

        let mut partial_body = FrameReader::new(&[0u8, 0, 0, 0, 8, 1, 2, 3][..]);
        let mut buf = [0u8; 16];
        assert!(matches!(
            partial_body.read(&mut buf).await,
            Err(FrameError::TruncatedBody { expected: 8, read: 3 })
        ));

        let mut zero = FrameReader::new(&[0u8, 0, 0, 0, 0][..]);
        assert!(matches!(zero.read(&mut buf).await, Err(FrameError::ZeroLength)));

        let mut huge = FrameReader::new(&[0u8, 0xff, 0xff, 0xff, 0xff][..]);
        assert!(matches!(huge.next_frame().await, Err(FrameError::TooLarge(_))));

        let compressed = encode_frame(b"x", true).unwrap();
        let mut compressed = FrameReader::new(&compressed[..]);
        assert!(matches!(compressed.read(&mut buf).await, Err(FrameError::UnsupportedCompression)));
    }

    #[tokio::test]
    async fn writer_emits_one_frame_per_write() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        assert_eq!(writer.write(b"one").await.unwrap(), 3);
        assert_eq!(writer.write(b"").await.unwrap(), 0);
        writer.write_frame_vectored(&[b"tw", b"o"]).await.unwrap();
        assert!(matches!(writer.write_frame(b"").await, Err(FrameError::EmptyPayload)));
        writer.shutdown().await.unwrap();
        drop(writer);

        let mut reader = FrameReader::new(server);
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), Bytes::from_static(b"two"));
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn large_frames_are_staged_outside_the_pool_classes() {
        let payload = vec![3u8; SizeClass::Datagram.nominal() + 1];
        let wire = frames(&[&payload]);
        let mut reader = FrameReader::new(&wire[..]);
        let mut buf = vec![0u8; 1000];
        let mut total = 0;
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            assert!(buf[..n].iter().all(|&b| b == 3));
            total += n;
        }
        assert_eq!(total, payload.len());
    }
}
