//! Carrier for the gRPC-style transports: every message is a `SocketData`
//! envelope inside a length-prefixed frame.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use strata_wire::codec::{read_varint, MAX_VARINT_LEN};
use strata_wire::envelope::{self, CONTENT_TAG};
use strata_wire::{FrameError, FrameReader, FrameWriter, SizeClass};
use tokio::io::BufWriter;
use tokio::sync::Mutex as AsyncMutex;

use crate::io::{BoxedReader, BoxedWriter};
use crate::tunnel::{Carrier, H2Keepalive};
use crate::TunnelError;

pub(crate) enum Keepalive {
    Http2(H2Keepalive),
    /// The carrier keeps itself alive.
    Builtin,
}

pub(crate) struct FramedCarrier {
    reader: AsyncMutex<FrameReader<BoxedReader>>,
    writer: AsyncMutex<FrameWriter<BufWriter<BoxedWriter>>>,
    keepalive: Keepalive,
    on_shutdown: Option<Box<dyn Fn() + Send + Sync>>,
}

impl FramedCarrier {
    pub(crate) fn new(reader: BoxedReader, writer: BoxedWriter, keepalive: Keepalive) -> Self {
        Self {
            reader: AsyncMutex::new(FrameReader::new(reader)),
            // Header, envelope prefix and content leave as one chunk.
            writer: AsyncMutex::new(FrameWriter::new(BufWriter::with_capacity(
                SizeClass::Large.nominal(),
                writer,
            ))),
            keepalive,
            on_shutdown: None,
        }
    }

    /// Runs `hook` after the write side has been shut down.
    pub(crate) fn on_shutdown(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_shutdown = Some(Box::new(hook));
        self
    }
}

/// Reads the envelope key and length from the front of a frame body,
/// returning the bytes consumed and the content length when the body is a
/// plain content field.
async fn read_envelope_prefix(
    reader: &mut FrameReader<BoxedReader>,
    frame_len: usize,
    prefix: &mut [u8; 1 + MAX_VARINT_LEN],
) -> Result<(usize, Option<u64>), FrameError> {
    let mut used = 0;
    while used < prefix.len() && used < frame_len {
        reader.read_body(&mut prefix[used..used + 1]).await?;
        used += 1;
        if prefix[0] != CONTENT_TAG {
            return Ok((used, None));
        }
        if used >= 2 {
            let (len, n) = read_varint(&prefix[1..used]);
            if n > 0 {
                return Ok((used, Some(len)));
            }
        }
    }
    Ok((used, None))
}

#[async_trait]
impl Carrier for FramedCarrier {
    async fn send(&self, data: &[u8]) -> Result<(), TunnelError> {
        let prefix = envelope::encode_prefix(data.len());
        let mut writer = self.writer.lock().await;
        writer.write_frame_vectored(&[prefix.as_bytes(), data]).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut reader = self.reader.lock().await;
        loop {
            if reader.has_staged() {
                return Ok(reader.drain_staged(buf));
            }
            let Some(header) = reader.read_header().await? else {
                return Ok(0);
            };
            if header.compressed {
                return Err(FrameError::UnsupportedCompression.into());
            }

            let mut prefix = [0u8; 1 + MAX_VARINT_LEN];
            let (used, content_len) = read_envelope_prefix(&mut reader, header.len, &mut prefix).await?;
            match content_len {
                Some(len) if header.len.checked_sub(used).map(|rest| rest as u64) == Some(len) => {
                    let len = len as usize;
                    if len == 0 {
                        continue;
                    }
                    if len <= buf.len() {
                        reader.read_body(&mut buf[..len]).await?;
                        return Ok(len);
                    }
                    reader.stage_body(len).await?;
                }
                _ => {
                    // Not a lone content field; decode the whole message.
                    let mut msg = BytesMut::zeroed(header.len);
                    msg[..used].copy_from_slice(&prefix[..used]);
                    reader.read_body(&mut msg[used..]).await?;
                    let content = envelope::decode(&msg.freeze())?;
                    reader.stage_bytes(content);
                }
            }
        }
    }

    async fn recv_message(&self) -> Result<Option<Bytes>, TunnelError> {
        let mut reader = self.reader.lock().await;
        match reader.next_frame().await? {
            Some(frame) => Ok(Some(envelope::decode(&frame)?)),
            None => Ok(None),
        }
    }

    async fn ping(&self) -> Result<(), TunnelError> {
        match &self.keepalive {
            Keepalive::Http2(keepalive) => keepalive.ping().await,
            Keepalive::Builtin => Ok(()),
        }
    }

    fn keeps_alive(&self) -> bool {
        matches!(self.keepalive, Keepalive::Builtin)
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        if let Some(hook) = &self.on_shutdown {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{ChannelReader, ChannelWriter};
    use strata_wire::grpc_web::encode_frame;
    use tokio::sync::mpsc;

    struct Wire {
        carrier: FramedCarrier,
        to_carrier: mpsc::Sender<std::io::Result<Bytes>>,
        from_carrier: mpsc::Receiver<Bytes>,
    }

    fn wire() -> Wire {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(16);
        let carrier = FramedCarrier::new(
            Box::new(ChannelReader::new(in_rx)),
            Box::new(ChannelWriter::new(out_tx)),
            Keepalive::Builtin,
        );
        Wire {
            carrier,
            to_carrier: in_tx,
            from_carrier: out_rx,
        }
    }

    fn framed_envelope(content: &[u8]) -> Bytes {
        encode_frame(&envelope::encode(content), false).unwrap()
    }

    #[tokio::test]
    async fn send_writes_one_chunk_per_message() {
        let mut w = wire();
        w.carrier.send(b"hello").await.unwrap();
        let chunk = w.from_carrier.recv().await.unwrap();
        assert_eq!(chunk, framed_envelope(b"hello"));
    }

    #[tokio::test]
    async fn recv_reads_content_directly() {
        let w = wire();
        w.to_carrier.send(Ok(framed_envelope(b"abc"))).await.unwrap();
        w.to_carrier.send(Ok(framed_envelope(b"defgh"))).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(w.carrier.recv(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(w.carrier.recv(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"defgh");
    }

    #[tokio::test]
    async fn recv_stages_large_messages() {
        let w = wire();
        let content: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let encoded = framed_envelope(&content);
        // Deliver in awkward pieces.
        for piece in encoded.chunks(7) {
            w.to_carrier.send(Ok(Bytes::copy_from_slice(piece))).await.unwrap();
        }
        drop(w.to_carrier);

        let mut out = Vec::new();
        let mut buf = [0u8; 300];
        loop {
            let n = w.carrier.recv(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, content);
    }

    #[tokio::test]
    async fn recv_handles_foreign_envelopes() {
        let w = wire();
        // An unknown varint field before the content, then an empty message.
        let msg = b"\x10\x01\x0a\x03xyz";
        w.to_carrier.send(Ok(encode_frame(msg, false).unwrap())).await.unwrap();
        w.to_carrier.send(Ok(encode_frame(b"\x10\x01", false).unwrap())).await.unwrap();
        w.to_carrier.send(Ok(framed_envelope(b"end"))).await.unwrap();

        let mut buf = [0u8; 2];
        assert_eq!(w.carrier.recv(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf, b"xy");
        assert_eq!(w.carrier.recv(&mut buf).await.unwrap(), 1);
        assert_eq!(&buf[..1], b"z");
        assert_eq!(w.carrier.recv(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf, b"en");
    }

    #[tokio::test]
    async fn recv_message_and_errors() {
        let w = wire();
        w.to_carrier.send(Ok(framed_envelope(b"reply"))).await.unwrap();
        assert_eq!(w.carrier.recv_message().await.unwrap().unwrap(), Bytes::from_static(b"reply"));

        w.to_carrier.send(Ok(encode_frame(b"\x0a\x01x", true).unwrap())).await.unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(
            w.carrier.recv(&mut buf).await,
            Err(TunnelError::Frame(FrameError::UnsupportedCompression))
        ));
    }

    #[tokio::test]
    async fn oversized_content_length_is_a_frame_error() {
        let w = wire();
        // Content key followed by a ten-byte varint holding u64::MAX.
        let body = b"\x0a\xff\xff\xff\xff\xff\xff\xff\xff\xff\x01";
        w.to_carrier.send(Ok(encode_frame(body, false).unwrap())).await.unwrap();
        let mut buf = [0u8; 64];
        assert!(matches!(
            w.carrier.recv(&mut buf).await,
            Err(TunnelError::Frame(FrameError::Envelope(_)))
        ));
    }

    #[tokio::test]
    async fn shutdown_ends_the_write_side() {
        let mut w = wire();
        let hooked = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = hooked.clone();
        let carrier = w.carrier.on_shutdown(move || flag.store(true, std::sync::atomic::Ordering::SeqCst));
        carrier.shutdown().await;
        assert!(w.from_carrier.recv().await.is_none());
        assert!(hooked.load(std::sync::atomic::Ordering::SeqCst));
        assert!(carrier.keeps_alive());
    }
}
