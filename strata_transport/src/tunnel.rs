use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use strata_wire::TargetAddr;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handshake::Handshake;
use crate::heartbeat::{self, Pinger};
use crate::lifecycle::Lifecycle;
use crate::options::TransportOptions;
use crate::{ConnectionState, TunnelConnection, TunnelError};

/// How long `close` waits for the carrier to say goodbye.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// The byte-moving half of a tunnel. Lifecycle, handshake and heartbeat
/// scheduling live in [`Tunnel`]; a carrier only talks to its wire.
#[async_trait]
pub(crate) trait Carrier: Send + Sync + 'static {
    /// Sends one message.
    async fn send(&self, data: &[u8]) -> Result<(), TunnelError>;

    /// Reads payload bytes; `Ok(0)` is end of stream.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TunnelError>;

    /// Reads one whole message, for handshake replies.
    async fn recv_message(&self) -> Result<Option<Bytes>, TunnelError>;

    async fn ping(&self) -> Result<(), TunnelError> {
        Ok(())
    }

    /// The carrier keeps itself alive (e.g. QUIC keep-alive).
    fn keeps_alive(&self) -> bool {
        false
    }

    /// Best-effort goodbye on the wire. In-flight operations have already
    /// been cancelled when this runs.
    async fn shutdown(&self);
}

/// HTTP/2 PING on a shared connection. The handle can only be used by one
/// caller at a time; a busy handle means a ping is already in flight.
#[derive(Clone, Default)]
pub(crate) struct H2Keepalive(pub(crate) Arc<AsyncMutex<Option<h2::PingPong>>>);

impl H2Keepalive {
    pub(crate) fn new(ping_pong: Option<h2::PingPong>) -> Self {
        Self(Arc::new(AsyncMutex::new(ping_pong)))
    }

    pub(crate) async fn ping(&self) -> Result<(), TunnelError> {
        let Ok(mut guard) = self.0.try_lock() else {
            return Ok(());
        };
        if let Some(ping_pong) = guard.as_mut() {
            ping_pong.ping(h2::Ping::opaque()).await?;
        }
        Ok(())
    }
}

pub(crate) struct Tunnel<C> {
    name: String,
    carrier: Arc<C>,
    lifecycle: Arc<Lifecycle>,
    handshake: Arc<dyn Handshake>,
    handshake_timeout: Duration,
}

impl<C: Carrier> Tunnel<C> {
    pub(crate) fn new(name: impl Into<String>, carrier: C, lifecycle: Arc<Lifecycle>, options: &TransportOptions) -> Self {
        Self::with_handshake(name, carrier, lifecycle, options.handshake.clone(), options.handshake_timeout)
    }

    pub(crate) fn with_handshake(
        name: impl Into<String>,
        carrier: C,
        lifecycle: Arc<Lifecycle>,
        handshake: Arc<dyn Handshake>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            carrier: Arc::new(carrier),
            lifecycle,
            handshake,
            handshake_timeout,
        }
    }

    async fn open(&self, target: &str, initial_data: &[u8]) -> Result<(), TunnelError> {
        let target = TargetAddr::parse(target)?;
        let request = self.handshake.request(&target, initial_data)?;
        self.carrier.send(&request.payload).await?;

        if self.handshake.expects_response() {
            let reply = self
                .carrier
                .recv_message()
                .await?
                .ok_or_else(|| TunnelError::Handshake("connection closed before reply".to_string()))?;
            self.handshake.verify_response(&reply)?;
        }

        if !request.early_data_sent && !initial_data.is_empty() {
            self.carrier.send(initial_data).await?;
        }
        debug!(
            "[{}] {} handshake sent for {} ({} early bytes)",
            self.name,
            self.handshake.name(),
            target,
            initial_data.len()
        );
        Ok(())
    }
}

struct CarrierPinger<C>(Arc<C>);

#[async_trait]
impl<C: Carrier> Pinger for CarrierPinger<C> {
    async fn ping(&self) -> Result<(), TunnelError> {
        self.0.ping().await
    }
}

#[async_trait]
impl<C: Carrier> TunnelConnection for Tunnel<C> {
    async fn connect(&self, target: &str, initial_data: &[u8]) -> Result<(), TunnelError> {
        self.lifecycle.begin_connect()?;
        let result = self
            .lifecycle
            .guard_timeout(self.handshake_timeout, "handshake", self.open(target, initial_data))
            .await;
        if let Err(e) = &result {
            warn!("[{}] connect to {} failed: {}", self.name, target, e);
            self.carrier.shutdown().await;
        }
        self.lifecycle.finish_connect(result)?;
        info!("[{}] tunnel to {} established", self.name, target);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        self.lifecycle.ensure_connected()?;
        self.lifecycle.guard(self.carrier.recv(buf)).await
    }

    async fn write(&self, data: &[u8]) -> Result<(), TunnelError> {
        self.lifecycle.ensure_connected()?;
        if data.is_empty() {
            return Ok(());
        }
        self.lifecycle.guard(self.carrier.send(data)).await
    }

    async fn close(&self) -> Result<(), TunnelError> {
        if !self.lifecycle.begin_close() {
            return Ok(());
        }
        if tokio::time::timeout(CLOSE_GRACE, self.carrier.shutdown()).await.is_err() {
            debug!("[{}] carrier shutdown timed out", self.name);
        }
        self.lifecycle.finish_close();
        Ok(())
    }

    fn start_ping(&self, interval: Duration) -> CancellationToken {
        if self.carrier.keeps_alive() {
            return heartbeat::stopped_token();
        }
        heartbeat::spawn_heartbeat(self.lifecycle.clone(), interval, CarrierPinger(self.carrier.clone()))
    }

    fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    fn transport_name(&self) -> &str {
        &self.name
    }
}

impl<C> Drop for Tunnel<C> {
    fn drop(&mut self) {
        // Stops pump tasks and heartbeats tied to this tunnel.
        self.lifecycle.token().cancel();
    }
}
