use tokio::net::TcpStream;
use tracing::debug;

use crate::io::BoxedIo;
use crate::options::TransportOptions;
use crate::{tls, TunnelError};

pub(crate) async fn connect_tcp(options: &TransportOptions) -> Result<TcpStream, TunnelError> {
    let addr = options.resolve().await?;
    let stream = tokio::time::timeout(options.dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TunnelError::Timeout("tcp dial"))??;
    stream.set_nodelay(true)?;
    debug!("tcp connected to {} ({})", addr, options.server.host);
    Ok(stream)
}

/// TCP, wrapped in TLS when the server address asks for it.
pub(crate) async fn connect_stream(options: &TransportOptions, alpn: &[&[u8]]) -> Result<BoxedIo, TunnelError> {
    let stream = connect_tcp(options).await?;
    if !options.server.use_tls {
        return Ok(Box::new(stream));
    }

    let config = options.tls_config(alpn)?;
    let tls = tokio::time::timeout(options.dial_timeout, tls::connect(stream, config, options.server_name()))
        .await
        .map_err(|_| TunnelError::Timeout("tls handshake"))??;
    let negotiated = tls.get_ref().1.alpn_protocol().map(|p| String::from_utf8_lossy(p).into_owned());
    debug!("tls established with {} (alpn {:?})", options.server_name(), negotiated);
    Ok(Box::new(tls))
}
