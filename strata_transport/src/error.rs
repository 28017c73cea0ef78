use std::io;

use strata_wire::{FrameError, ParseError};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::ConnectionState;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid address: {0}")]
    Parse(#[from] ParseError),
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("http/2 error: {0}")]
    Http2(#[from] h2::Error),
    #[error("http/3 error: {0}")]
    Http3(String),
    #[error("quic connect error: {0}")]
    QuicConnect(#[from] quinn::ConnectError),
    #[error("quic connection error: {0}")]
    QuicConnection(#[from] quinn::ConnectionError),
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("server answered with HTTP status {0}")]
    Status(http::StatusCode),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("operation needs a connected tunnel, state is {0:?}")]
    InvalidState(ConnectionState),
    #[error("connection closed")]
    Closed,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TunnelError {
    pub(crate) fn http3(err: impl std::fmt::Display) -> Self {
        TunnelError::Http3(err.to_string())
    }
}

impl From<http::Error> for TunnelError {
    fn from(err: http::Error) -> Self {
        TunnelError::Config(err.to_string())
    }
}
