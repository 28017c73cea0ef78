//! Shared HTTP/2 client sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use h2::client::{ResponseFuture, SendRequest};
use h2::SendStream;
use http::Request;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::dial::connect_stream;
use crate::io::BoxedIo;
use crate::options::TransportOptions;
use crate::tls::ALPN_H2;
use crate::tunnel::H2Keepalive;
use crate::TunnelError;

const STREAM_WINDOW: u32 = 4 * 1024 * 1024;
const CONNECTION_WINDOW: u32 = 16 * 1024 * 1024;

/// One HTTP/2 connection. Requests opened on it become independent streams.
#[derive(Clone)]
pub(crate) struct H2Session {
    send_request: SendRequest<Bytes>,
    keepalive: H2Keepalive,
    alive: Arc<AtomicBool>,
}

impl H2Session {
    /// Runs the client preface over `io` and spawns the connection driver.
    pub(crate) async fn handshake(io: BoxedIo) -> Result<Self, TunnelError> {
        let (send_request, mut connection) = h2::client::Builder::new()
            .initial_window_size(STREAM_WINDOW)
            .initial_connection_window_size(CONNECTION_WINDOW)
            .handshake::<_, Bytes>(io)
            .await?;
        let keepalive = H2Keepalive::new(connection.ping_pong());
        let alive = Arc::new(AtomicBool::new(true));

        let driver_alive = alive.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("http2 connection ended: {}", e);
            }
            driver_alive.store(false, Ordering::Release);
        });

        Ok(Self {
            send_request,
            keepalive,
            alive,
        })
    }

    pub(crate) async fn connect(options: &TransportOptions) -> Result<Self, TunnelError> {
        let io = connect_stream(options, &[ALPN_H2]).await?;
        tokio::time::timeout(options.handshake_timeout, Self::handshake(io))
            .await
            .map_err(|_| TunnelError::Timeout("http2 handshake"))?
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn keepalive(&self) -> H2Keepalive {
        self.keepalive.clone()
    }

    /// Opens a request stream whose body stays open for writing.
    pub(crate) async fn open(&self, request: Request<()>) -> Result<(ResponseFuture, SendStream<Bytes>), TunnelError> {
        let mut send_request = self.send_request.clone().ready().await?;
        Ok(send_request.send_request(request, false)?)
    }

    /// Sends a request with a complete body.
    pub(crate) async fn send(&self, request: Request<()>, body: Bytes) -> Result<ResponseFuture, TunnelError> {
        let mut send_request = self.send_request.clone().ready().await?;
        if body.is_empty() {
            let (response, _) = send_request.send_request(request, true)?;
            return Ok(response);
        }
        let (response, mut stream) = send_request.send_request(request, false)?;
        stream.send_data(body, true)?;
        Ok(response)
    }
}

/// Keeps one live session per transport so tunnels share a connection.
#[derive(Default)]
pub(crate) struct SessionCache {
    session: AsyncMutex<Option<H2Session>>,
}

impl SessionCache {
    pub(crate) async fn get(&self, options: &TransportOptions) -> Result<H2Session, TunnelError> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.is_alive() {
                return Ok(session.clone());
            }
            warn!("http2 session to {} went away, redialling", options.authority());
        }
        let session = H2Session::connect(options).await?;
        *slot = Some(session.clone());
        Ok(session)
    }
}
