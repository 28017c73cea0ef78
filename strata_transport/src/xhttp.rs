//! Raw tunnel bytes in plain HTTP/2 request and response bodies.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use h2::RecvStream;
use http::header::{CONTENT_TYPE, USER_AGENT};
use http::{Method, Request, StatusCode};
use rand::Rng;
use strata_wire::{Identifier, SizeClass};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::http2::{H2Session, SessionCache};
use crate::io::{BoxedReader, BoxedWriter, H2Reader, H2Writer};
use crate::lifecycle::Lifecycle;
use crate::options::TransportOptions;
use crate::tunnel::{Carrier, H2Keepalive, Tunnel};
use crate::{Transport, TunnelConnection, TunnelError};

pub const DEFAULT_PATH: &str = "/xhttp";
pub const AUTH_HEADER: &str = "X-Auth-Token";
pub const DEFAULT_PADDING: RangeInclusive<usize> = 100..=1000;
const CONTENT_TYPE_RAW: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XhttpMode {
    /// Currently the same as `StreamOne`.
    #[default]
    Auto,
    /// One POST carries both directions.
    StreamOne,
    /// A long GET carries the download; every write is its own POST.
    StreamDown,
}

impl XhttpMode {
    fn resolve(self) -> XhttpMode {
        match self {
            XhttpMode::Auto => XhttpMode::StreamOne,
            mode => mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            XhttpMode::Auto => "auto",
            XhttpMode::StreamOne => "stream-one",
            XhttpMode::StreamDown => "stream-down",
        }
    }
}

impl FromStr for XhttpMode {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(XhttpMode::Auto),
            "stream-one" => Ok(XhttpMode::StreamOne),
            "stream-down" => Ok(XhttpMode::StreamDown),
            other => Err(TunnelError::Config(format!("unknown xhttp mode {:?}", other))),
        }
    }
}

impl fmt::Display for XhttpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the requests of one transport; cloned into stream-down carriers.
#[derive(Debug, Clone)]
struct Requests {
    /// `scheme://authority/path`, without a trailing slash.
    base: String,
    auth_token: String,
    user_agent: String,
    padding: Option<RangeInclusive<usize>>,
}

impl Requests {
    fn build(&self, method: Method, suffix: &str, padded: bool) -> Result<Request<()>, TunnelError> {
        let mut uri = format!("{}{}", self.base, suffix);
        if let Some(range) = self.padding.as_ref().filter(|_| padded) {
            let len = rand::thread_rng().gen_range(range.clone());
            if len > 0 {
                uri.push_str("?x_padding=");
                uri.extend(std::iter::repeat('X').take(len));
            }
        }
        Ok(Request::builder()
            .method(method)
            .uri(uri)
            .header(AUTH_HEADER, self.auth_token.as_str())
            .header(CONTENT_TYPE, CONTENT_TYPE_RAW)
            .header(USER_AGENT, self.user_agent.as_str())
            .body(())?)
    }
}

pub struct XhttpTransport {
    options: TransportOptions,
    mode: XhttpMode,
    requests: Requests,
    name: String,
    sessions: SessionCache,
}

impl XhttpTransport {
    pub fn new(options: TransportOptions, id: Identifier, mode: XhttpMode) -> Self {
        let mode = mode.resolve();
        let path = match options.server.path.trim_end_matches('/') {
            "" => DEFAULT_PATH,
            path => path,
        };
        let scheme = if options.server.use_tls { "https" } else { "http" };
        let requests = Requests {
            base: format!("{}://{}{}", scheme, options.authority(), path),
            auth_token: id.to_string(),
            user_agent: options.user_agent.clone(),
            padding: Some(DEFAULT_PADDING),
        };
        Self {
            options,
            mode,
            requests,
            name: format!("XHTTP({})", mode),
            sessions: SessionCache::default(),
        }
    }

    /// Length range of the `x_padding` query value; `None` disables it.
    pub fn with_padding(mut self, padding: Option<RangeInclusive<usize>>) -> Self {
        self.requests.padding = padding;
        self
    }

    pub fn mode(&self) -> XhttpMode {
        self.mode
    }

    pub(crate) async fn open_on(&self, session: H2Session) -> Result<Box<dyn TunnelConnection>, TunnelError> {
        let lifecycle = Arc::new(Lifecycle::new());
        if self.mode == XhttpMode::StreamDown {
            let session_id = format!("{:016x}", rand::random::<u64>());
            debug!("[{}] session {}", self.name, session_id);
            let carrier = StreamDownCarrier {
                session,
                requests: self.requests.clone(),
                session_id,
                next_seq: AsyncMutex::new(0),
                download: AsyncMutex::new(Download::default()),
            };
            return Ok(Box::new(Tunnel::new(self.name.clone(), carrier, lifecycle, &self.options)));
        }

        let (response, stream) = session.open(self.requests.build(Method::POST, "", false)?).await?;
        let carrier = StreamOneCarrier {
            reader: AsyncMutex::new(Box::new(H2Reader::new(response, false))),
            writer: AsyncMutex::new(Box::new(H2Writer::new(stream))),
            keepalive: session.keepalive(),
        };
        Ok(Box::new(Tunnel::new(self.name.clone(), carrier, lifecycle, &self.options)))
    }
}

#[async_trait]
impl Transport for XhttpTransport {
    async fn dial(&self) -> Result<Box<dyn TunnelConnection>, TunnelError> {
        let session = self.sessions.get(&self.options).await?;
        let tunnel = self.open_on(session).await?;
        info!("[{}] ready on {}", self.name, self.requests.base);
        Ok(tunnel)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

async fn read_chunk(reader: &mut BoxedReader) -> Result<Option<Bytes>, TunnelError> {
    let mut buf = BytesMut::zeroed(SizeClass::Large.nominal());
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    buf.truncate(n);
    Ok(Some(buf.freeze()))
}

struct StreamOneCarrier {
    reader: AsyncMutex<BoxedReader>,
    writer: AsyncMutex<BoxedWriter>,
    keepalive: H2Keepalive,
}

#[async_trait]
impl Carrier for StreamOneCarrier {
    async fn send(&self, data: &[u8]) -> Result<(), TunnelError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        Ok(self.reader.lock().await.read(buf).await?)
    }

    async fn recv_message(&self) -> Result<Option<Bytes>, TunnelError> {
        read_chunk(&mut *self.reader.lock().await).await
    }

    async fn ping(&self) -> Result<(), TunnelError> {
        self.keepalive.ping().await
    }

    async fn shutdown(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

#[derive(Default)]
struct Download {
    reader: Option<BoxedReader>,
    /// Body of the handshake POST, read before the download stream.
    reply: Bytes,
}

struct StreamDownCarrier {
    session: H2Session,
    requests: Requests,
    session_id: String,
    next_seq: AsyncMutex<u64>,
    download: AsyncMutex<Download>,
}

async fn collect_body(mut body: RecvStream) -> Result<Bytes, TunnelError> {
    let mut out = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        let _ = body.flow_control().release_capacity(chunk.len());
        out.extend_from_slice(&chunk);
    }
    Ok(out.freeze())
}

impl StreamDownCarrier {
    fn upload_request(&self, seq: u64) -> Result<Request<()>, TunnelError> {
        self.requests
            .build(Method::POST, &format!("/{}/{}", self.session_id, seq), true)
    }

    fn download_request(&self) -> Result<Request<()>, TunnelError> {
        self.requests.build(Method::GET, &format!("/{}", self.session_id), true)
    }

    async fn post(&self, seq: u64, data: &[u8]) -> Result<Bytes, TunnelError> {
        let response = self
            .session
            .send(self.upload_request(seq)?, Bytes::copy_from_slice(data))
            .await?
            .await?;
        if response.status() != StatusCode::OK {
            return Err(TunnelError::Status(response.status()));
        }
        collect_body(response.into_body()).await
    }
}

#[async_trait]
impl Carrier for StreamDownCarrier {
    async fn send(&self, data: &[u8]) -> Result<(), TunnelError> {
        let mut seq = self.next_seq.lock().await;
        let body = self.post(*seq, data).await?;
        if *seq == 0 {
            let response = self.session.send(self.download_request()?, Bytes::new()).await?.await?;
            if response.status() != StatusCode::OK {
                return Err(TunnelError::Status(response.status()));
            }
            let mut download = self.download.lock().await;
            download.reader = Some(Box::new(H2Reader::from_body(response.into_body(), false)));
            download.reply = body;
            debug!("stream-down session {} opened", self.session_id);
        }
        *seq += 1;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        let mut download = self.download.lock().await;
        if !download.reply.is_empty() {
            let n = buf.len().min(download.reply.len());
            buf[..n].copy_from_slice(&download.reply[..n]);
            download.reply.advance(n);
            return Ok(n);
        }
        match download.reader.as_mut() {
            Some(reader) => Ok(reader.read(buf).await?),
            None => Ok(0),
        }
    }

    async fn recv_message(&self) -> Result<Option<Bytes>, TunnelError> {
        let mut download = self.download.lock().await;
        if !download.reply.is_empty() {
            return Ok(Some(std::mem::take(&mut download.reply)));
        }
        match download.reader.as_mut() {
            Some(reader) => read_chunk(reader).await,
            None => Ok(None),
        }
    }

    /// Uploads are short requests; there is nothing to keep alive.
    fn keeps_alive(&self) -> bool {
        true
    }

    async fn shutdown(&self) {
        // Dropping the response stream resets the download.
        self.download.lock().await.reader = None;
    }
}
