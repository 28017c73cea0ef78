//! Tunnel bytes as binary WebSocket messages.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::header::USER_AGENT;
use http::HeaderValue;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

use crate::dial::connect_stream;
use crate::lifecycle::Lifecycle;
use crate::options::TransportOptions;
use crate::tls::ALPN_HTTP11;
use crate::tunnel::{Carrier, Tunnel};
use crate::{Transport, TunnelConnection, TunnelError};

/// Text message that ends the stream in either direction.
pub const CLOSE_MESSAGE: &str = "CLOSE";
/// Prefix of a text message reporting a server-side failure.
pub const ERROR_PREFIX: &str = "ERROR:";

pub struct WebSocketTransport {
    options: TransportOptions,
    name: String,
}

impl WebSocketTransport {
    pub fn new(options: TransportOptions) -> Self {
        let name = if options.server.use_tls { "WebSocket+TLS" } else { "WebSocket" };
        Self {
            options,
            name: name.to_string(),
        }
    }

    fn url(&self) -> String {
        let scheme = if self.options.server.use_tls { "wss" } else { "ws" };
        format!("{}://{}{}", scheme, self.options.authority(), self.options.server.path)
    }

    /// Runs the upgrade over an established stream.
    pub(crate) async fn upgrade<S>(&self, io: S) -> Result<Box<dyn TunnelConnection>, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut request = self.url().into_client_request()?;
        let user_agent = HeaderValue::from_str(&self.options.user_agent)
            .map_err(|e| TunnelError::Config(format!("user agent: {}", e)))?;
        request.headers_mut().insert(USER_AGENT, user_agent);

        let (ws, response) = tokio::time::timeout(
            self.options.handshake_timeout,
            tokio_tungstenite::client_async(request, io),
        )
        .await
        .map_err(|_| TunnelError::Timeout("websocket upgrade"))??;
        debug!("[{}] upgraded, server answered {}", self.name, response.status());

        Ok(Box::new(Tunnel::new(
            self.name.clone(),
            WsCarrier::new(ws),
            Arc::new(Lifecycle::new()),
            &self.options,
        )))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn dial(&self) -> Result<Box<dyn TunnelConnection>, TunnelError> {
        let io = connect_stream(&self.options, &[ALPN_HTTP11]).await?;
        let tunnel = self.upgrade(io).await?;
        info!("[{}] connected to {}", self.name, self.url());
        Ok(tunnel)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
    pending: Bytes,
    done: bool,
}

impl<S> WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Next non-empty payload; `None` at end of stream.
    async fn next_payload(&mut self) -> Result<Option<Bytes>, TunnelError> {
        while !self.done {
            let Some(msg) = self.stream.next().await else {
                self.done = true;
                break;
            };
            match msg? {
                Message::Binary(data) if !data.is_empty() => return Ok(Some(Bytes::from(data))),
                Message::Text(text) if text == CLOSE_MESSAGE => self.done = true,
                Message::Text(text) if text.starts_with(ERROR_PREFIX) => {
                    self.done = true;
                    return Err(TunnelError::Remote(text[ERROR_PREFIX.len()..].to_string()));
                }
                Message::Text(text) if !text.is_empty() => return Ok(Some(Bytes::from(text.into_bytes()))),
                Message::Close(_) => self.done = true,
                _ => {}
            }
        }
        Ok(None)
    }
}

struct WsCarrier<S> {
    sink: AsyncMutex<SplitSink<WebSocketStream<S>, Message>>,
    reader: AsyncMutex<WsReader<S>>,
}

impl<S> WsCarrier<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: AsyncMutex::new(sink),
            reader: AsyncMutex::new(WsReader {
                stream,
                pending: Bytes::new(),
                done: false,
            }),
        }
    }
}

#[async_trait]
impl<S> Carrier for WsCarrier<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&self, data: &[u8]) -> Result<(), TunnelError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(data.to_vec())).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        let mut reader = self.reader.lock().await;
        if reader.pending.is_empty() {
            match reader.next_payload().await? {
                Some(payload) => reader.pending = payload,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(reader.pending.len());
        buf[..n].copy_from_slice(&reader.pending[..n]);
        reader.pending.advance(n);
        Ok(n)
    }

    async fn recv_message(&self) -> Result<Option<Bytes>, TunnelError> {
        let mut reader = self.reader.lock().await;
        if !reader.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut reader.pending)));
        }
        reader.next_payload().await
    }

    async fn ping(&self) -> Result<(), TunnelError> {
        // A busy sink is carrying traffic already.
        let Ok(mut sink) = self.sink.try_lock() else {
            return Ok(());
        };
        sink.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    async fn shutdown(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Text(CLOSE_MESSAGE.to_string())).await;
        let _ = sink.close().await;
    }
}
