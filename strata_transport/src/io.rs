//! Byte-stream adapters over HTTP/2 streams and in-process channels.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use h2::client::ResponseFuture;
use h2::{RecvStream, SendStream};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Largest DATA payload handed to h2 in one write.
const MAX_H2_CHUNK: usize = 16 * 1024;

pub(crate) trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub(crate) type BoxedIo = Box<dyn AsyncIo>;

/// Copies from `pending` into `buf`, keeping what does not fit.
fn copy_pending(pending: &mut Bytes, buf: &mut ReadBuf<'_>) {
    let n = pending.len().min(buf.remaining());
    buf.put_slice(&pending[..n]);
    pending.advance(n);
}

enum RecvState {
    Waiting(ResponseFuture),
    Body(RecvStream),
    Trailers(RecvStream),
    Done,
}

/// Read half of an HTTP/2 request: waits for the response headers on first
/// read, then yields the response body.
pub(crate) struct H2Reader {
    state: RecvState,
    pending: Bytes,
    /// Map a non-zero `grpc-status` to an error.
    grpc: bool,
}

impl H2Reader {
    pub(crate) fn new(response: ResponseFuture, grpc: bool) -> Self {
        Self {
            state: RecvState::Waiting(response),
            pending: Bytes::new(),
            grpc,
        }
    }

    /// Reader over a response whose headers were already checked.
    pub(crate) fn from_body(body: RecvStream, grpc: bool) -> Self {
        Self {
            state: RecvState::Body(body),
            pending: Bytes::new(),
            grpc,
        }
    }
}

fn grpc_status_error(headers: &http::HeaderMap) -> Option<io::Error> {
    let status = headers.get("grpc-status")?.to_str().unwrap_or("2");
    if status == "0" {
        return None;
    }
    let message = headers
        .get("grpc-message")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    Some(io::Error::other(format!("grpc status {}: {}", status, message)))
}

impl AsyncRead for H2Reader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if !this.pending.is_empty() {
            copy_pending(&mut this.pending, buf);
            return Poll::Ready(Ok(()));
        }

        loop {
            match &mut this.state {
                RecvState::Waiting(response) => {
                    let response = ready!(Pin::new(response).poll(cx)).map_err(io::Error::other)?;
                    if response.status() != StatusCode::OK {
                        this.state = RecvState::Done;
                        return Poll::Ready(Err(io::Error::other(format!(
                            "server answered with HTTP status {}",
                            response.status()
                        ))));
                    }
                    if this.grpc {
                        // A trailers-only response carries the status in the headers.
                        if let Some(err) = grpc_status_error(response.headers()) {
                            this.state = RecvState::Done;
                            return Poll::Ready(Err(err));
                        }
                    }
                    this.state = RecvState::Body(response.into_body());
                }
                RecvState::Body(body) => match ready!(body.poll_data(cx)) {
                    Some(Ok(data)) => {
                        let _ = body.flow_control().release_capacity(data.len());
                        this.pending = data;
                        copy_pending(&mut this.pending, buf);
                        return Poll::Ready(Ok(()));
                    }
                    Some(Err(e)) => {
                        this.state = RecvState::Done;
                        return Poll::Ready(Err(io::Error::other(e)));
                    }
                    None => {
                        if !this.grpc {
                            this.state = RecvState::Done;
                            return Poll::Ready(Ok(()));
                        }
                        if let RecvState::Body(body) = std::mem::replace(&mut this.state, RecvState::Done) {
                            this.state = RecvState::Trailers(body);
                        }
                    }
                },
                RecvState::Trailers(body) => {
                    let trailers = ready!(body.poll_trailers(cx));
                    this.state = RecvState::Done;
                    return match trailers {
                        Ok(Some(trailers)) => match grpc_status_error(&trailers) {
                            Some(err) => Poll::Ready(Err(err)),
                            None => Poll::Ready(Ok(())),
                        },
                        Err(e) => Poll::Ready(Err(io::Error::other(e))),
                        Ok(None) => Poll::Ready(Ok(())),
                    };
                }
                RecvState::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

/// Write half of an HTTP/2 request body.
pub(crate) struct H2Writer {
    send: SendStream<Bytes>,
    finished: bool,
}

impl H2Writer {
    pub(crate) fn new(send: SendStream<Bytes>) -> Self {
        Self { send, finished: false }
    }
}

impl AsyncWrite for H2Writer {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if self.finished {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "request body finished")));
        }

        let want = buf.len().min(MAX_H2_CHUNK);
        if self.send.capacity() == 0 {
            self.send.reserve_capacity(want);
            match ready!(self.send.poll_capacity(cx)) {
                Some(Ok(_)) => {}
                Some(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
                None => return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "HTTP/2 stream closed"))),
            }
        }

        let available = self.send.capacity();
        if available == 0 {
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        let n = want.min(available);
        self.send
            .send_data(Bytes::copy_from_slice(&buf[..n]), false)
            .map_err(io::Error::other)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.finished {
            self.finished = true;
            self.send.send_data(Bytes::new(), true).map_err(io::Error::other)?;
        }
        Poll::Ready(Ok(()))
    }
}

/// Reads chunks that a pump task pushes into a channel. The sender
/// dropping is end of stream.
pub(crate) struct ChannelReader {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    pending: Bytes,
}

impl ChannelReader {
    pub(crate) fn new(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
        }
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        while this.pending.is_empty() {
            match ready!(this.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => this.pending = chunk,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None => return Poll::Ready(Ok(())),
            }
        }
        copy_pending(&mut this.pending, buf);
        Poll::Ready(Ok(()))
    }
}

/// Forwards each write to a pump task as one chunk. Shutdown closes the
/// channel, which the pump takes as end of stream.
pub(crate) struct ChannelWriter {
    tx: PollSender<Bytes>,
}

impl ChannelWriter {
    pub(crate) fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx: PollSender::new(tx),
        }
    }
}

fn pump_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream pump stopped")
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(self.tx.poll_reserve(cx)).map_err(|_| pump_gone())?;
        self.tx
            .send_item(Bytes::copy_from_slice(buf))
            .map_err(|_| pump_gone())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn channel_reader_splits_chunks() {
        let (tx, rx) = mpsc::channel(4);
        let mut reader = ChannelReader::new(rx);
        tx.send(Ok(Bytes::from_static(b"hello world"))).await.unwrap();
        drop(tx);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"hell");
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"o world");
    }

    #[tokio::test]
    async fn channel_reader_surfaces_errors() {
        let (tx, rx) = mpsc::channel(4);
        let mut reader = ChannelReader::new(rx);
        tx.send(Err(io::Error::other("reset"))).await.unwrap();
        let mut buf = [0u8; 4];
        assert!(reader.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn channel_writer_forwards_and_closes() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut writer = ChannelWriter::new(tx);
        writer.write_all(b"abc").await.unwrap();
        writer.shutdown().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"abc"));
        assert!(rx.recv().await.is_none());
        assert!(writer.write_all(b"late").await.is_err());
    }
}
