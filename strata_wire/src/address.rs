use std::fmt;

use crate::error::ParseError;

/// URL schemes understood by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Ws,
    Wss,
    Grpc,
    Grpcs,
    Http,
    Https,
}

impl Scheme {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ws" => Some(Scheme::Ws),
            "wss" => Some(Scheme::Wss),
            "grpc" => Some(Scheme::Grpc),
            "grpcs" => Some(Scheme::Grpcs),
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
            Scheme::Grpc => "grpc",
            Scheme::Grpcs => "grpcs",
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self, Scheme::Wss | Scheme::Grpcs | Scheme::Https)
    }

    /// Port used when the address does not carry one.
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Ws | Scheme::Http => 80,
            _ => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A server address split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    pub scheme: Scheme,
    pub host: String,
    /// Never empty.
    pub port: String,
    /// Never empty, always starts with `/`.
    pub path: String,
    pub use_tls: bool,
    pub raw: String,
}

impl ParsedAddress {
    pub fn port_number(&self) -> Result<u16, ParseError> {
        self.port
            .parse::<u16>()
            .map_err(|_| ParseError::InvalidPort(self.port.clone()))
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

struct Parts<'a> {
    scheme: Option<String>,
    host_port: &'a str,
    path: &'a str,
}

fn split_parts(raw: &str) -> Parts<'_> {
    let (scheme, rest) = match raw.find("://") {
        Some(idx) => (Some(raw[..idx].to_ascii_lowercase()), &raw[idx + 3..]),
        None => (None, raw),
    };
    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    Parts { scheme, host_port, path }
}

/// Splits `host:port`. Bracketed IPv6 hosts are unwrapped. Returns `None`
/// when there is no port or the input is ambiguous (a bare IPv6 literal).
pub fn split_host_port(s: &str) -> Option<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest.find(']')?;
        let port = rest[end + 1..].strip_prefix(':')?;
        return Some((&rest[..end], port));
    }
    let idx = s.rfind(':')?;
    let host = &s[..idx];
    if host.contains(':') {
        return None;
    }
    Some((host, &s[idx + 1..]))
}

/// Parses `[scheme://]host[:port][/path]`.
///
/// Never fails: a missing or unknown scheme becomes `wss`, a missing port
/// takes the scheme default and a missing path becomes `/`.
pub fn parse_address(raw: &str) -> ParsedAddress {
    let parts = split_parts(raw);
    let scheme = parts
        .scheme
        .as_deref()
        .and_then(Scheme::from_name)
        .unwrap_or(Scheme::Wss);

    let (host, port) = match split_host_port(parts.host_port) {
        Some((host, port)) if !port.is_empty() => (host.to_string(), port.to_string()),
        Some((host, _)) => (host.to_string(), default_port_for(parts.scheme.as_deref())),
        None => (parts.host_port.to_string(), default_port_for(parts.scheme.as_deref())),
    };

    ParsedAddress {
        scheme,
        host,
        port,
        path: parts.path.to_string(),
        use_tls: scheme.uses_tls(),
        raw: raw.to_string(),
    }
}

fn default_port_for(scheme: Option<&str>) -> String {
    scheme
        .and_then(Scheme::from_name)
        .map(|s| s.default_port())
        .unwrap_or(443)
        .to_string()
}

/// Like [`parse_address`], but rejects unknown schemes, empty hosts and
/// ports that are not a non-zero `u16`.
pub fn parse_address_strict(raw: &str) -> Result<ParsedAddress, ParseError> {
    let parts = split_parts(raw.trim());
    if let Some(name) = parts.scheme.as_deref() {
        if Scheme::from_name(name).is_none() {
            return Err(ParseError::UnknownScheme(name.to_string()));
        }
    }
    if parts.host_port.contains(':') && split_host_port(parts.host_port).is_none() {
        return Err(ParseError::InvalidPort(parts.host_port.to_string()));
    }

    let parsed = parse_address(raw.trim());
    if parsed.host.is_empty() {
        return Err(ParseError::EmptyHost(raw.to_string()));
    }
    match parsed.port_number() {
        Ok(0) | Err(_) => Err(ParseError::InvalidPort(parsed.port)),
        Ok(_) => Ok(parsed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_wss_address() {
        let addr = parse_address("wss://example.com:443/ws");
        assert_eq!(addr.scheme, Scheme::Wss);
        assert_eq!(addr.host, "example.com");
        assert_eq!(addr.port, "443");
        assert_eq!(addr.path, "/ws");
        assert!(addr.use_tls);
        assert_eq!(addr.raw, "wss://example.com:443/ws");
    }

    #[test]
    fn missing_scheme_defaults_to_wss() {
        let addr = parse_address("example.com:443");
        assert_eq!(addr.scheme, Scheme::Wss);
        assert_eq!(addr.port, "443");
        assert_eq!(addr.path, "/");
        assert!(addr.use_tls);
    }

    #[test]
    fn grpc_without_port() {
        let addr = parse_address("grpc://example.com/Service");
        assert_eq!(addr.scheme, Scheme::Grpc);
        assert_eq!(addr.host, "example.com");
        assert_eq!(addr.port, "443");
        assert_eq!(addr.path, "/Service");
        assert!(!addr.use_tls);
    }

    #[test]
    fn bare_host() {
        let addr = parse_address("example.com");
        assert_eq!(addr.host, "example.com");
        assert_eq!(addr.port, "443");
        assert_eq!(addr.path, "/");
    }

    #[test]
    fn plaintext_schemes_default_to_port_80() {
        assert_eq!(parse_address("ws://example.com").port, "80");
        assert_eq!(parse_address("HTTP://example.com/x").port, "80");
        assert_eq!(parse_address("HTTP://example.com/x").scheme, Scheme::Http);
        assert_eq!(parse_address("https://example.com").port, "443");
    }

    #[test]
    fn unknown_scheme_is_tolerated() {
        let addr = parse_address("quic://example.com");
        assert_eq!(addr.scheme, Scheme::Wss);
        assert_eq!(addr.port, "443");
        assert!(addr.use_tls);
    }

    #[test]
    fn ipv6_hosts() {
        let addr = parse_address("wss://[2001:db8::1]:8443/tunnel");
        assert_eq!(addr.host, "2001:db8::1");
        assert_eq!(addr.port, "8443");
        assert_eq!(addr.authority(), "[2001:db8::1]:8443");

        let bare = parse_address("2001:db8::1");
        assert_eq!(bare.host, "2001:db8::1");
        assert_eq!(bare.port, "443");
    }

    #[test]
    fn empty_port_falls_back_to_default() {
        assert_eq!(parse_address("ws://example.com:/a").port, "80");
    }

    #[test]
    fn strict_accepts_well_formed() {
        let addr = parse_address_strict("grpcs://edge.example.net:8443/Proxy").unwrap();
        assert_eq!(addr.port_number().unwrap(), 8443);
        assert!(addr.use_tls);
    }

    #[test]
    fn strict_rejections() {
        assert_eq!(
            parse_address_strict("quic://example.com"),
            Err(ParseError::UnknownScheme("quic".to_string()))
        );
        assert!(matches!(parse_address_strict("wss://:443/"), Err(ParseError::EmptyHost(_))));
        assert!(matches!(parse_address_strict("wss://example.com:http"), Err(ParseError::InvalidPort(_))));
        assert!(matches!(parse_address_strict("wss://example.com:0"), Err(ParseError::InvalidPort(_))));
        assert!(matches!(parse_address_strict("2001:db8::1"), Err(ParseError::InvalidPort(_))));
    }
}
