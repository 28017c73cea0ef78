use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use strata_transport::{
    GrpcTransport, H3GrpcTransport, PreambleHandshake, Transport, TransportOptions, TunnelConnection, TunnelError,
    WebSocketTransport, XhttpMode, XhttpTransport,
};
use strata_wire::{parse_address_strict, parse_identifier};
use tracing::info;

pub use selection::{TransportKind, TransportSelection};

/// Builds the transport a selection names and dials through it.
pub struct TransportFactory {
    selection: TransportSelection,
    transport: Box<dyn Transport>,
}

impl TransportFactory {
    pub fn new(selection: TransportSelection) -> Result<Self, TunnelError> {
        let id = parse_identifier(&selection.id)?;
        let mut server = parse_address_strict(&selection.server)?;
        if let Some(path) = selection.path.as_deref().filter(|p| !p.is_empty()) {
            server.path = if path.starts_with('/') { path.to_string() } else { format!("/{}", path) };
        }
        if selection.dial_timeout_secs == 0 || selection.handshake_timeout_secs == 0 {
            return Err(TunnelError::Config("timeouts must be at least one second".to_string()));
        }

        let mut options = TransportOptions::new(server, Arc::new(PreambleHandshake::new(id)));
        options.server_ip = selection.server_ip;
        options.sni = selection.sni.clone().filter(|s| !s.is_empty());
        if let Some(user_agent) = selection.user_agent.clone() {
            options.user_agent = user_agent;
        }
        options.dial_timeout = Duration::from_secs(selection.dial_timeout_secs);
        options.handshake_timeout = Duration::from_secs(selection.handshake_timeout_secs);

        let transport: Box<dyn Transport> = match selection.kind {
            TransportKind::WebSocket => Box::new(WebSocketTransport::new(options)),
            TransportKind::Grpc => {
                let mut grpc = GrpcTransport::new(options);
                if let Some(service) = &selection.service_name {
                    grpc = grpc.with_service_name(service.as_str());
                }
                Box::new(grpc)
            }
            TransportKind::H3Grpc => {
                let mut h3 = H3GrpcTransport::new(options);
                if let Some(content_type) = &selection.content_type {
                    h3 = h3.with_content_type(content_type.as_str());
                }
                Box::new(h3)
            }
            TransportKind::Xhttp => {
                let mode: XhttpMode = selection.xhttp_mode.parse()?;
                let padding = match selection.padding {
                    Some((min, max)) if min > max => {
                        return Err(TunnelError::Config(format!("padding range {}-{} is empty", min, max)));
                    }
                    Some((min, max)) => Some(min..=max),
                    None => None,
                };
                Box::new(XhttpTransport::new(options, id, mode).with_padding(padding))
            }
        };
        info!("transport {} selected for {}", transport.name(), selection.server);

        Ok(Self { selection, transport })
    }

    pub fn selection(&self) -> &TransportSelection {
        &self.selection
    }

    /// Interval for [`TunnelConnection::start_ping`]; zero disables it.
    pub fn heartbeat(&self) -> Duration {
        self.selection.heartbeat()
    }
}

#[async_trait]
impl Transport for TransportFactory {
    async fn dial(&self) -> Result<Box<dyn TunnelConnection>, TunnelError> {
        self.transport.dial().await
    }

    fn name(&self) -> &str {
        self.transport.name()
    }
}

pub mod selection;

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "550e8400-e29b-41d4-a716-446655440000";

    fn selection(kind: TransportKind, server: &str) -> TransportSelection {
        TransportSelection {
            kind,
            server: server.to_string(),
            id: ID.to_string(),
            ..TransportSelection::default()
        }
    }

    #[test]
    fn names_follow_the_selection() {
        let cases = [
            (TransportKind::WebSocket, "wss://edge.example.com/ws", "WebSocket+TLS"),
            (TransportKind::WebSocket, "ws://edge.example.com/ws", "WebSocket"),
            (TransportKind::Grpc, "grpcs://edge.example.com", "gRPC+TLS"),
            (TransportKind::Grpc, "grpc://edge.example.com:8080", "gRPC"),
            (TransportKind::H3Grpc, "https://edge.example.com", "H3-gRPC-Web"),
            (TransportKind::Xhttp, "https://edge.example.com", "XHTTP(stream-one)"),
        ];
        for (kind, server, name) in cases {
            let factory = TransportFactory::new(selection(kind, server)).unwrap();
            assert_eq!(factory.name(), name, "{}", server);
        }

        let mut down = selection(TransportKind::Xhttp, "https://edge.example.com");
        down.xhttp_mode = "stream-down".into();
        assert_eq!(TransportFactory::new(down).unwrap().name(), "XHTTP(stream-down)");
    }

    #[test]
    fn invalid_selections_are_rejected() {
        let mut bad_id = selection(TransportKind::WebSocket, "wss://edge.example.com");
        bad_id.id = "1234".into();
        assert!(matches!(TransportFactory::new(bad_id), Err(TunnelError::Parse(_))));

        let bad_scheme = selection(TransportKind::WebSocket, "ftp://edge.example.com");
        assert!(matches!(TransportFactory::new(bad_scheme), Err(TunnelError::Parse(_))));

        let mut bad_mode = selection(TransportKind::Xhttp, "https://edge.example.com");
        bad_mode.xhttp_mode = "packet-up".into();
        assert!(matches!(TransportFactory::new(bad_mode), Err(TunnelError::Config(_))));

        let mut bad_padding = selection(TransportKind::Xhttp, "https://edge.example.com");
        bad_padding.padding = Some((10, 5));
        assert!(TransportFactory::new(bad_padding).is_err());

        let mut no_timeout = selection(TransportKind::Grpc, "grpc://edge.example.com");
        no_timeout.dial_timeout_secs = 0;
        assert!(TransportFactory::new(no_timeout).is_err());
    }

    #[tokio::test]
    async fn dial_reports_refused_connections() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut sel = selection(TransportKind::WebSocket, &format!("ws://127.0.0.1:{}/", addr.port()));
        sel.dial_timeout_secs = 2;
        let factory = TransportFactory::new(sel).unwrap();
        assert!(factory.dial().await.is_err());
    }
}
