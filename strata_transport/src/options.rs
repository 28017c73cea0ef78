use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use strata_wire::ParsedAddress;

use crate::handshake::Handshake;
use crate::tls;
use crate::TunnelError;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_USER_AGENT: &str = concat!("strata/", env!("CARGO_PKG_VERSION"));

/// Settings every transport shares.
#[derive(Clone)]
pub struct TransportOptions {
    pub server: ParsedAddress,
    /// Dial this address instead of resolving the server host.
    pub server_ip: Option<IpAddr>,
    /// TLS server name and `Host`; defaults to the server host.
    pub sni: Option<String>,
    pub user_agent: String,
    pub handshake: Arc<dyn Handshake>,
    /// Base TLS settings; ALPN is filled in per transport.
    pub tls: Option<Arc<ClientConfig>>,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl TransportOptions {
    pub fn new(server: ParsedAddress, handshake: Arc<dyn Handshake>) -> Self {
        Self {
            server,
            server_ip: None,
            sni: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            handshake,
            tls: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn server_name(&self) -> &str {
        self.sni.as_deref().unwrap_or(&self.server.host)
    }

    pub fn port(&self) -> Result<u16, TunnelError> {
        Ok(self.server.port_number()?)
    }

    /// `host[:port]` as sent in `Host` / `:authority`.
    pub fn authority(&self) -> String {
        let host = self.server_name();
        let default = self.server.scheme.default_port().to_string();
        match (host.contains(':'), self.server.port == default) {
            (true, true) => format!("[{}]", host),
            (true, false) => format!("[{}]:{}", host, self.server.port),
            (false, true) => host.to_string(),
            (false, false) => format!("{}:{}", host, self.server.port),
        }
    }

    pub(crate) fn tls_config(&self, alpn: &[&[u8]]) -> Result<ClientConfig, TunnelError> {
        match &self.tls {
            Some(base) => Ok(tls::with_alpn(base, alpn)),
            None => Ok(tls::with_alpn(&tls::default_client_config()?, alpn)),
        }
    }

    pub(crate) async fn resolve(&self) -> Result<SocketAddr, TunnelError> {
        let port = self.port()?;
        if let Some(ip) = self.server_ip {
            return Ok(SocketAddr::new(ip, port));
        }
        let host = self.server.host.as_str();
        tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| TunnelError::Dial(format!("no addresses for {}", host)))
    }
}

impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptions")
            .field("server", &self.server.raw)
            .field("server_ip", &self.server_ip)
            .field("sni", &self.sni)
            .field("handshake", &self.handshake.name())
            .field("dial_timeout", &self.dial_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::PreambleHandshake;
    use strata_wire::{parse_address, Identifier};

    fn options(raw: &str) -> TransportOptions {
        TransportOptions::new(parse_address(raw), Arc::new(PreambleHandshake::new(Identifier::default())))
    }

    #[test]
    fn authority_omits_default_port() {
        assert_eq!(options("wss://example.com/ws").authority(), "example.com");
        assert_eq!(options("wss://example.com:8443/ws").authority(), "example.com:8443");
        assert_eq!(options("ws://[::1]:8080").authority(), "[::1]:8080");

        let mut fronted = options("wss://203.0.113.9:443");
        fronted.sni = Some("cdn.example.com".into());
        assert_eq!(fronted.server_name(), "cdn.example.com");
        assert_eq!(fronted.authority(), "cdn.example.com");
    }

    #[tokio::test]
    async fn server_ip_skips_resolution() {
        let mut opts = options("wss://does-not-resolve.invalid:9443");
        opts.server_ip = Some("127.0.0.1".parse().unwrap());
        assert_eq!(opts.resolve().await.unwrap(), "127.0.0.1:9443".parse().unwrap());
    }
}
