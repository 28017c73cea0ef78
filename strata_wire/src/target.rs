use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};

use crate::address::split_host_port;
use crate::codec::{read_u16, write_u16};
use crate::error::ParseError;

pub const ADDR_TYPE_IPV4: u8 = 0x01;
pub const ADDR_TYPE_DOMAIN: u8 = 0x02;
pub const ADDR_TYPE_IPV6: u8 = 0x03;

/// Destination the remote end should connect to on our behalf.
///
/// Encoded as `[type:1][len:1][addr:len][port:2 BE]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// Parses `host:port`; bracketed IPv6 literals are accepted.
    pub fn parse(target: &str) -> Result<Self, ParseError> {
        let (host, port) =
            split_host_port(target).ok_or_else(|| ParseError::InvalidTarget(target.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ParseError::InvalidPort(port.to_string()))?;
        if host.is_empty() {
            return Err(ParseError::InvalidTarget(target.to_string()));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(TargetAddr::Ip(SocketAddr::new(ip, port)));
        }
        if host.len() > u8::MAX as usize {
            return Err(ParseError::InvalidTarget(format!("domain too long: {} bytes", host.len())));
        }
        Ok(TargetAddr::Domain(host.to_string(), port))
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    pub fn encoded_len(&self) -> usize {
        let addr_len = match self {
            TargetAddr::Ip(SocketAddr::V4(_)) => 4,
            TargetAddr::Ip(SocketAddr::V6(_)) => 16,
            TargetAddr::Domain(host, _) => host.len(),
        };
        2 + addr_len + 2
    }

    pub fn encode_into(&self, dst: &mut BytesMut) {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                dst.put_u8(ADDR_TYPE_IPV4);
                dst.put_u8(4);
                dst.put_slice(&addr.ip().octets());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                dst.put_u8(ADDR_TYPE_IPV6);
                dst.put_u8(16);
                dst.put_slice(&addr.ip().octets());
            }
            TargetAddr::Domain(host, _) => {
                dst.put_u8(ADDR_TYPE_DOMAIN);
                dst.put_u8(host.len() as u8);
                dst.put_slice(host.as_bytes());
            }
        }
        let mut port = [0u8; 2];
        write_u16(&mut port, self.port());
        dst.put_slice(&port);
    }

    /// Decodes one address from the front of `src`, returning it and the
    /// number of bytes used.
    pub fn decode(src: &[u8]) -> Result<(Self, usize), ParseError> {
        if src.len() < 2 {
            return Err(ParseError::TruncatedTarget);
        }
        let kind = src[0];
        let len = src[1] as usize;
        let total = 2 + len + 2;
        if src.len() < total {
            return Err(ParseError::TruncatedTarget);
        }
        let raw = &src[2..2 + len];
        let port = read_u16(&src[2 + len..total]);

        let addr = match kind {
            ADDR_TYPE_IPV4 => {
                let octets: [u8; 4] = raw
                    .try_into()
                    .map_err(|_| ParseError::InvalidTarget(format!("ipv4 length {}", len)))?;
                TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            ADDR_TYPE_IPV6 => {
                let octets: [u8; 16] = raw
                    .try_into()
                    .map_err(|_| ParseError::InvalidTarget(format!("ipv6 length {}", len)))?;
                TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            ADDR_TYPE_DOMAIN => {
                let host = std::str::from_utf8(raw)
                    .map_err(|_| ParseError::InvalidTarget("domain is not utf-8".to_string()))?;
                TargetAddr::Domain(host.to_string(), port)
            }
            other => return Err(ParseError::UnknownAddressType(other)),
        };
        Ok((addr, total))
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}
