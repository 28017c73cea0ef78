use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::TunnelError;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";
pub const ALPN_H3: &[u8] = b"h3";

/// Client config trusting the webpki roots, on the ring provider.
pub fn default_client_config() -> Result<ClientConfig, TunnelError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

/// Copy of `base` advertising exactly `alpn`.
pub(crate) fn with_alpn(base: &ClientConfig, alpn: &[&[u8]]) -> ClientConfig {
    let mut config = base.clone();
    config.alpn_protocols = alpn.iter().map(|proto| proto.to_vec()).collect();
    config
}

pub(crate) fn server_name(sni: &str) -> Result<ServerName<'static>, TunnelError> {
    ServerName::try_from(sni.to_string())
        .map_err(|e| TunnelError::Config(format!("invalid server name {:?}: {}", sni, e)))
}

pub(crate) async fn connect(
    stream: TcpStream,
    config: ClientConfig,
    sni: &str,
) -> Result<TlsStream<TcpStream>, TunnelError> {
    let connector = TlsConnector::from(Arc::new(config));
    let tls = connector.connect(server_name(sni)?, stream).await?;
    Ok(tls)
}
