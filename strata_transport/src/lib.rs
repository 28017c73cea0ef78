use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use error::TunnelError;
pub use handshake::{ConnectRequest, Handshake, PreambleHandshake};
pub use options::TransportOptions;

/// Lifecycle of a tunnel connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// One data-plane link to the remote proxy, whatever carries it.
///
/// Read and write may run concurrently from different tasks; concurrent
/// reads are serialised internally.
#[async_trait]
pub trait TunnelConnection: Send + Sync {
    /// Opens the tunnel to `target` (`host:port`). `initial_data` rides
    /// along with the handshake when the protocol allows it.
    async fn connect(&self, target: &str, initial_data: &[u8]) -> Result<(), TunnelError>;

    /// `Ok(0)` is a clean end of stream.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError>;

    async fn write(&self, data: &[u8]) -> Result<(), TunnelError>;

    /// Idempotent. Unblocks in-flight reads and writes.
    async fn close(&self) -> Result<(), TunnelError>;

    /// Starts a periodic keep-alive. Cancel the returned token to stop it.
    fn start_ping(&self, interval: Duration) -> CancellationToken;

    fn state(&self) -> ConnectionState;

    fn transport_name(&self) -> &str;
}

/// A way of reaching the server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes the carrier and returns an idle tunnel on it.
    async fn dial(&self) -> Result<Box<dyn TunnelConnection>, TunnelError>;

    /// Human readable name, e.g. "WebSocket+TLS".
    fn name(&self) -> &str;
}

mod dial;
mod error;
mod framed;
pub mod grpc;
pub mod h3grpc;
pub mod handshake;
mod heartbeat;
mod http2;
mod io;
mod lifecycle;
pub mod options;
pub mod tls;
mod tunnel;
pub mod websocket;
pub mod xhttp;

pub use grpc::GrpcTransport;
pub use h3grpc::H3GrpcTransport;
pub use websocket::WebSocketTransport;
pub use xhttp::{XhttpMode, XhttpTransport};
