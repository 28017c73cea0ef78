//! Bidirectional gRPC stream over HTTP/2.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::{CONTENT_TYPE, USER_AGENT};
use http::{Method, Request};
use strata_wire::grpc_web::CONTENT_TYPE_GRPC;
use tracing::debug;

use crate::framed::{FramedCarrier, Keepalive};
use crate::http2::{H2Session, SessionCache};
use crate::io::{H2Reader, H2Writer};
use crate::lifecycle::Lifecycle;
use crate::options::TransportOptions;
use crate::tunnel::Tunnel;
use crate::{Transport, TunnelConnection, TunnelError};

pub const DEFAULT_SERVICE_NAME: &str = "ProxyService";

pub struct GrpcTransport {
    options: TransportOptions,
    service_name: String,
    name: String,
    sessions: SessionCache,
}

impl GrpcTransport {
    pub fn new(options: TransportOptions) -> Self {
        let name = if options.server.use_tls { "gRPC+TLS" } else { "gRPC" };
        Self {
            options,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            name: name.to_string(),
            sessions: SessionCache::default(),
        }
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    fn request(&self) -> Result<Request<()>, TunnelError> {
        let scheme = if self.options.server.use_tls { "https" } else { "http" };
        let uri = format!(
            "{}://{}/{}/Tunnel",
            scheme,
            self.options.authority(),
            self.service_name.trim_matches('/')
        );
        Ok(Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, CONTENT_TYPE_GRPC)
            .header("te", "trailers")
            .header(USER_AGENT, self.options.user_agent.as_str())
            .body(())?)
    }

    pub(crate) async fn open_on(&self, session: &H2Session) -> Result<Box<dyn TunnelConnection>, TunnelError> {
        let (response, stream) = session.open(self.request()?).await?;
        let carrier = FramedCarrier::new(
            Box::new(H2Reader::new(response, true)),
            Box::new(H2Writer::new(stream)),
            Keepalive::Http2(session.keepalive()),
        );
        debug!("[{}] stream opened to {}", self.name, self.options.authority());
        Ok(Box::new(Tunnel::new(
            self.name.clone(),
            carrier,
            Arc::new(Lifecycle::new()),
            &self.options,
        )))
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn dial(&self) -> Result<Box<dyn TunnelConnection>, TunnelError> {
        let session = self.sessions.get(&self.options).await?;
        self.open_on(&session).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http2::tests::{ok, session_pair};
    use crate::tunnel::tests::test_handshake;
    use crate::ConnectionState;
    use bytes::Bytes;
    use http::HeaderMap;
    use strata_wire::{envelope, encode_frame, parse_address, Identifier, TargetAddr};

    fn transport() -> GrpcTransport {
        let options = TransportOptions::new(parse_address("grpc://proxy.example.com:8080"), test_handshake());
        GrpcTransport::new(options)
    }

    fn framed(content: &[u8]) -> Bytes {
        encode_frame(&envelope::encode(content), false).unwrap()
    }

    #[test]
    fn names_follow_tls() {
        assert_eq!(transport().name(), "gRPC");
        let options = TransportOptions::new(parse_address("grpcs://proxy.example.com"), test_handshake());
        assert_eq!(GrpcTransport::new(options).name(), "gRPC+TLS");
    }

    #[tokio::test]
    async fn tunnel_round_trip_over_h2() {
        let transport = transport().with_service_name("Custom");
        let (session, mut server) = session_pair().await;
        let tunnel = transport.open_on(&session).await.unwrap();
        assert_eq!(tunnel.state(), ConnectionState::Idle);

        tunnel.connect("example.org:443", b"GET /").await.unwrap();

        let mut exchange = server.recv().await.unwrap();
        assert_eq!(exchange.request.uri().path(), "/Custom/Tunnel");
        assert_eq!(exchange.request.headers()[CONTENT_TYPE], CONTENT_TYPE_GRPC);
        assert_eq!(exchange.request.headers()["te"], "trailers");

        // First message: identifier, target, early data.
        let body = exchange.request.body_mut();
        let chunk = body.data().await.unwrap().unwrap();
        let mut reader = strata_wire::FrameReader::new(&chunk[..]);
        let message = reader.next_frame().await.unwrap().unwrap();
        let content = envelope::decode(&message).unwrap();
        let id: Identifier = "550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
        assert_eq!(&content[..16], id.as_bytes());
        let (target, used) = TargetAddr::decode(&content[16..]).unwrap();
        assert_eq!(target, TargetAddr::Domain("example.org".into(), 443));
        assert_eq!(&content[16 + used..], b"GET /");

        let mut send = exchange.respond.send_response(ok(), false).unwrap();
        send.send_data(framed(b"HTTP/1.1 200"), false).unwrap();
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", "0".parse().unwrap());
        send.send_trailers(trailers).unwrap();

        let mut buf = [0u8; 64];
        let n = tunnel.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"HTTP/1.1 200");
        assert_eq!(tunnel.read(&mut buf).await.unwrap(), 0);

        tunnel.close().await.unwrap();
        assert_eq!(tunnel.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn grpc_error_status_fails_the_read() {
        let (session, mut server) = session_pair().await;
        let tunnel = transport().open_on(&session).await.unwrap();
        tunnel.connect("10.1.2.3:22", b"").await.unwrap();

        let mut exchange = server.recv().await.unwrap();
        let response = http::Response::builder()
            .status(200)
            .header("grpc-status", "7")
            .header("grpc-message", "denied")
            .body(())
            .unwrap();
        exchange.respond.send_response(response, true).unwrap();

        let mut buf = [0u8; 16];
        let err = tunnel.read(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("denied"), "{}", err);
    }
}
