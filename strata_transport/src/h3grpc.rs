//! gRPC-Web frames on an HTTP/3 request stream.

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use h3::client::RequestStream;
use http::header::{CONTENT_TYPE, USER_AGENT};
use http::{Method, Request, StatusCode};
use parking_lot::Mutex;
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{Endpoint, IdleTimeout, TransportConfig, VarInt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::framed::{FramedCarrier, Keepalive};
use crate::io::{ChannelReader, ChannelWriter};
use crate::lifecycle::Lifecycle;
use crate::options::TransportOptions;
use crate::tls::ALPN_H3;
use crate::tunnel::Tunnel;
use crate::{Transport, TunnelConnection, TunnelError};

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
pub const DEFAULT_PATH: &str = "/";
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const PUMP_DEPTH: usize = 32;

type SendHalf = RequestStream<h3_quinn::SendStream<Bytes>, Bytes>;
type RecvHalf = RequestStream<h3_quinn::RecvStream, Bytes>;

pub struct H3GrpcTransport {
    options: TransportOptions,
    path: String,
    content_type: String,
    keep_alive: Duration,
    idle_timeout: Duration,
    /// One UDP socket per address family, shared by every tunnel.
    endpoints: Mutex<[Option<Endpoint>; 2]>,
}

impl H3GrpcTransport {
    pub fn new(options: TransportOptions) -> Self {
        let path = match options.server.path.as_str() {
            "" => DEFAULT_PATH.to_string(),
            path => path.to_string(),
        };
        Self {
            options,
            path,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            keep_alive: KEEP_ALIVE_INTERVAL,
            idle_timeout: IDLE_TIMEOUT,
            endpoints: Mutex::new([None, None]),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    fn client_config(&self) -> Result<quinn::ClientConfig, TunnelError> {
        let tls = self.options.tls_config(&[ALPN_H3])?;
        let quic = QuicClientConfig::try_from(tls).map_err(|e| TunnelError::Config(e.to_string()))?;
        let mut transport = TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive));
        transport.max_idle_timeout(Some(
            IdleTimeout::try_from(self.idle_timeout).map_err(|e| TunnelError::Config(e.to_string()))?,
        ));
        let mut config = quinn::ClientConfig::new(Arc::new(quic));
        config.transport_config(Arc::new(transport));
        Ok(config)
    }

    fn endpoint(&self, remote: SocketAddr) -> Result<Endpoint, TunnelError> {
        let (slot, bind): (usize, SocketAddr) = if remote.is_ipv4() {
            (0, (std::net::Ipv4Addr::UNSPECIFIED, 0).into())
        } else {
            (1, (std::net::Ipv6Addr::UNSPECIFIED, 0).into())
        };
        let mut endpoints = self.endpoints.lock();
        if let Some(endpoint) = &endpoints[slot] {
            return Ok(endpoint.clone());
        }
        let endpoint = Endpoint::client(bind)?;
        endpoints[slot] = Some(endpoint.clone());
        Ok(endpoint)
    }

    fn request(&self) -> Result<Request<()>, TunnelError> {
        Ok(Request::builder()
            .method(Method::POST)
            .uri(format!("https://{}{}", self.options.authority(), self.path))
            .header(CONTENT_TYPE, self.content_type.as_str())
            .header(USER_AGENT, self.options.user_agent.as_str())
            .body(())?)
    }

    async fn open_stream(&self, lifecycle: &Lifecycle) -> Result<(quinn::Connection, SendHalf, RecvHalf), TunnelError> {
        let addr = self.options.resolve().await?;
        let connecting = self
            .endpoint(addr)?
            .connect_with(self.client_config()?, addr, self.options.server_name())?;
        let conn = tokio::time::timeout(self.options.dial_timeout, connecting)
            .await
            .map_err(|_| TunnelError::Timeout("quic dial"))??;
        debug!("quic connected to {} ({})", addr, self.options.server_name());

        let (mut driver, send_request) = tokio::time::timeout(
            self.options.handshake_timeout,
            h3::client::new(h3_quinn::Connection::new(conn.clone())),
        )
        .await
        .map_err(|_| TunnelError::Timeout("http3 handshake"))?
        .map_err(TunnelError::http3)?;

        // The driver task owns a request handle so the connection outlives
        // the request stream setup.
        let token = lifecycle.token().clone();
        let held = send_request.clone();
        tokio::spawn(async move {
            let _held = held;
            tokio::select! {
                e = poll_fn(|cx| driver.poll_close(cx)) => {
                    if !e.is_h3_no_error() {
                        debug!("http3 connection ended: {}", e);
                    }
                }
                _ = token.cancelled() => {}
            }
        });

        let mut send_request = send_request;
        let stream = send_request
            .send_request(self.request()?)
            .await
            .map_err(TunnelError::http3)?;
        let (send, recv) = stream.split();
        Ok((conn, send, recv))
    }

    fn tunnel(
        &self,
        lifecycle: Arc<Lifecycle>,
        downstream: mpsc::Receiver<io::Result<Bytes>>,
        upstream: mpsc::Sender<Bytes>,
        conn: Option<quinn::Connection>,
    ) -> Box<dyn TunnelConnection> {
        let carrier = FramedCarrier::new(
            Box::new(ChannelReader::new(downstream)),
            Box::new(ChannelWriter::new(upstream)),
            Keepalive::Builtin,
        )
        .on_shutdown(move || {
            if let Some(conn) = &conn {
                conn.close(VarInt::from_u32(0), b"closed");
            }
        });
        Box::new(Tunnel::new(self.name(), carrier, lifecycle, &self.options))
    }
}

async fn pump_up(mut send: SendHalf, mut upstream: mpsc::Receiver<Bytes>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            chunk = upstream.recv() => match chunk {
                Some(chunk) => {
                    if let Err(e) = send.send_data(chunk).await {
                        warn!("http3 upload failed: {}", e);
                        break;
                    }
                }
                None => {
                    let _ = send.finish().await;
                    break;
                }
            }
        }
    }
    debug!("http3 upload pump stopped");
}

async fn pump_down(mut recv: RecvHalf, downstream: mpsc::Sender<io::Result<Bytes>>, token: CancellationToken) {
    let result = tokio::select! {
        _ = token.cancelled() => Ok(()),
        res = forward_response(&mut recv, &downstream) => res,
    };
    if let Err(e) = result {
        let _ = downstream.send(Err(io::Error::other(e.to_string()))).await;
    }
    debug!("http3 download pump stopped");
}

async fn forward_response(recv: &mut RecvHalf, downstream: &mpsc::Sender<io::Result<Bytes>>) -> Result<(), TunnelError> {
    let response = recv.recv_response().await.map_err(TunnelError::http3)?;
    if response.status() != StatusCode::OK {
        return Err(TunnelError::Status(response.status()));
    }
    while let Some(mut chunk) = recv.recv_data().await.map_err(TunnelError::http3)? {
        let bytes = chunk.copy_to_bytes(chunk.remaining());
        if downstream.send(Ok(bytes)).await.is_err() {
            break;
        }
    }
    Ok(())
}

#[async_trait]
impl Transport for H3GrpcTransport {
    async fn dial(&self) -> Result<Box<dyn TunnelConnection>, TunnelError> {
        let lifecycle = Arc::new(Lifecycle::new());
        let (conn, send, recv) = self.open_stream(&lifecycle).await?;

        let (up_tx, up_rx) = mpsc::channel(PUMP_DEPTH);
        let (down_tx, down_rx) = mpsc::channel(PUMP_DEPTH);
        tokio::spawn(pump_up(send, up_rx, lifecycle.token().clone()));
        tokio::spawn(pump_down(recv, down_tx, lifecycle.token().clone()));

        info!("[{}] request stream open to {}{}", self.name(), self.options.authority(), self.path);
        Ok(self.tunnel(lifecycle, down_rx, up_tx, Some(conn)))
    }

    fn name(&self) -> &str {
        "H3-gRPC-Web"
    }
}
