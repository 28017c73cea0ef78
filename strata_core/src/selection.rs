use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_transport::TunnelError;

pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    #[serde(alias = "ws")]
    WebSocket,
    Grpc,
    #[serde(alias = "h3")]
    H3Grpc,
    Xhttp,
}

impl FromStr for TransportKind {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            "grpc" => Ok(TransportKind::Grpc),
            "h3grpc" | "h3" => Ok(TransportKind::H3Grpc),
            "xhttp" => Ok(TransportKind::Xhttp),
            other => Err(TunnelError::Config(format!("unknown transport {:?}", other))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::Grpc => "grpc",
            TransportKind::H3Grpc => "h3grpc",
            TransportKind::Xhttp => "xhttp",
        })
    }
}

/// Everything needed to pick and configure a transport.
///
/// Missing fields take their defaults, so a minimal selection only names
/// the server and the identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSelection {
    pub kind: TransportKind,
    /// Server address, e.g. `wss://edge.example.com/tunnel`.
    pub server: String,
    pub server_ip: Option<IpAddr>,
    pub sni: Option<String>,
    pub user_agent: Option<String>,
    /// 32 hex digits, dashes allowed.
    pub id: String,
    /// Overrides the path of `server`.
    pub path: Option<String>,
    /// gRPC service name.
    pub service_name: Option<String>,
    /// HTTP/3 request content type.
    pub content_type: Option<String>,
    pub xhttp_mode: String,
    /// Inclusive length range of XHTTP query padding; `None` disables it.
    pub padding: Option<(usize, usize)>,
    pub dial_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Zero disables the heartbeat.
    pub heartbeat_secs: u64,
}

impl Default for TransportSelection {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            server: String::new(),
            server_ip: None,
            sni: None,
            user_agent: None,
            id: String::new(),
            path: None,
            service_name: None,
            content_type: None,
            xhttp_mode: "auto".to_string(),
            padding: Some((100, 1000)),
            dial_timeout_secs: DEFAULT_TIMEOUT_SECS,
            handshake_timeout_secs: DEFAULT_TIMEOUT_SECS,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T, TunnelError> {
    value
        .trim()
        .parse()
        .map_err(|_| TunnelError::Config(format!("{} has an invalid value {:?}", name, value)))
}

/// `min-max`, a single length, or `off`.
fn parse_padding(value: &str) -> Result<Option<(usize, usize)>, TunnelError> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("off") || value == "0" {
        return Ok(None);
    }
    let (min, max) = match value.split_once('-') {
        Some((min, max)) => (parse_var("STRATA_PADDING", min)?, parse_var("STRATA_PADDING", max)?),
        None => {
            let len = parse_var("STRATA_PADDING", value)?;
            (len, len)
        }
    };
    Ok(Some((min, max)))
}

impl TransportSelection {
    /// Reads `STRATA_*` variables from the process environment.
    pub fn from_env() -> Result<Self, TunnelError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Builds a selection from a variable lookup; unset variables keep
    /// their defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, TunnelError> {
        let mut selection = Self::default();
        if let Some(kind) = var("STRATA_TRANSPORT") {
            selection.kind = kind.parse()?;
        }
        if let Some(server) = var("STRATA_SERVER") {
            selection.server = server;
        }
        if let Some(ip) = var("STRATA_SERVER_IP") {
            selection.server_ip = Some(parse_var("STRATA_SERVER_IP", &ip)?);
        }
        if let Some(id) = var("STRATA_ID") {
            selection.id = id;
        }
        selection.sni = var("STRATA_SNI");
        selection.user_agent = var("STRATA_USER_AGENT");
        selection.path = var("STRATA_PATH");
        selection.service_name = var("STRATA_SERVICE_NAME");
        selection.content_type = var("STRATA_CONTENT_TYPE");
        if let Some(mode) = var("STRATA_XHTTP_MODE") {
            selection.xhttp_mode = mode;
        }
        if let Some(padding) = var("STRATA_PADDING") {
            selection.padding = parse_padding(&padding)?;
        }
        if let Some(secs) = var("STRATA_DIAL_TIMEOUT") {
            selection.dial_timeout_secs = parse_var("STRATA_DIAL_TIMEOUT", &secs)?;
        }
        if let Some(secs) = var("STRATA_HANDSHAKE_TIMEOUT") {
            selection.handshake_timeout_secs = parse_var("STRATA_HANDSHAKE_TIMEOUT", &secs)?;
        }
        if let Some(secs) = var("STRATA_HEARTBEAT") {
            selection.heartbeat_secs = parse_var("STRATA_HEARTBEAT", &secs)?;
        }
        Ok(selection)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn json_fills_in_defaults() {
        let selection: TransportSelection = serde_json::from_str(
            r#"{"kind": "xhttp", "server": "https://cdn.example.com", "id": "0123456789abcdef0123456789abcdef"}"#,
        )
        .unwrap();
        assert_eq!(selection.kind, TransportKind::Xhttp);
        assert_eq!(selection.xhttp_mode, "auto");
        assert_eq!(selection.padding, Some((100, 1000)));
        assert_eq!(selection.dial_timeout_secs, 10);
        assert_eq!(selection.heartbeat(), Duration::from_secs(30));

        let aliased: TransportSelection = serde_json::from_str(r#"{"kind": "h3"}"#).unwrap();
        assert_eq!(aliased.kind, TransportKind::H3Grpc);
    }

    #[test]
    fn environment_overrides() {
        let vars: HashMap<&str, &str> = [
            ("STRATA_TRANSPORT", "grpc"),
            ("STRATA_SERVER", "grpcs://proxy.example.com"),
            ("STRATA_SERVER_IP", "192.0.2.7"),
            ("STRATA_SERVICE_NAME", "Tun"),
            ("STRATA_PADDING", "16-64"),
            ("STRATA_HEARTBEAT", "0"),
        ]
        .into_iter()
        .collect();
        let selection = TransportSelection::from_vars(|name| vars.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(selection.kind, TransportKind::Grpc);
        assert_eq!(selection.server_ip, Some("192.0.2.7".parse().unwrap()));
        assert_eq!(selection.service_name.as_deref(), Some("Tun"));
        assert_eq!(selection.padding, Some((16, 64)));
        assert_eq!(selection.heartbeat_secs, 0);
        assert_eq!(selection.dial_timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn bad_environment_values_are_rejected() {
        let bad = |name: &'static str, value: &'static str| {
            TransportSelection::from_vars(move |n| (n == name).then(|| value.to_string()))
        };
        assert!(bad("STRATA_TRANSPORT", "carrier-pigeon").is_err());
        assert!(bad("STRATA_HEARTBEAT", "soon").is_err());
        assert!(bad("STRATA_SERVER_IP", "not-an-ip").is_err());
        assert_eq!(bad("STRATA_PADDING", "off").unwrap().padding, None);
    }
}
