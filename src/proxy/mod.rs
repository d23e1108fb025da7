//! SOCKS5 front-end
//!
//! Provides:
//! - SOCKS5 wire handling (greeting, request, reply)
//! - SOCKS5 server generic over its egress connector

pub mod socks5;

pub use socks5::{Command, Reply, Request, Socks5Server};

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

use crate::transport::ConnectError;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectError),
}

/// What to do with BIND and UDP ASSOCIATE requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandPolicy {
    /// Answer "command not supported"
    #[default]
    Reject,
    /// Treat the request as CONNECT
    Connect,
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// `0.0.0.0:0`, used as the bound address when none is known
    pub fn unspecified() -> Self {
        Address::Ipv4([0; 4], 0)
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Host part without the port (IPv6 without brackets)
    pub fn host(&self) -> String {
        match self {
            Address::Ipv4(ip, _) => Ipv4Addr::from(*ip).to_string(),
            Address::Ipv6(ip, _) => Ipv6Addr::from(*ip).to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Socket address, for literal IP targets only
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::Ipv4(ip, port) => Some(SocketAddr::new(IpAddr::from(*ip), *port)),
            Address::Ipv6(ip, port) => Some(SocketAddr::new(IpAddr::from(*ip), *port)),
            Address::Domain(..) => None,
        }
    }

    /// Parse `host:port`, `a.b.c.d:port` or `[v6]:port`
    pub fn parse_host_port(s: &str) -> Result<Self, ProxyError> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::InvalidAddress(format!("missing port: {}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ProxyError::InvalidAddress(format!("invalid port: {}", s)))?;

        if host.is_empty() || host.len() > 255 || host.contains(['[', ']', ':']) {
            return Err(ProxyError::InvalidAddress(format!("invalid host: {}", s)));
        }

        Ok(Address::Domain(host.to_string(), port))
    }

    /// SOCKS5 address type byte
    pub fn atyp(&self) -> u8 {
        match self {
            Address::Ipv4(..) => socks5::ATYP_IPV4,
            Address::Domain(..) => socks5::ATYP_DOMAIN,
            Address::Ipv6(..) => socks5::ATYP_IPV6,
        }
    }

    /// Append `atyp, address, port(be16)` in SOCKS5 wire form
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.atyp());
        match self {
            Address::Ipv4(ip, _) => buf.extend_from_slice(ip),
            Address::Ipv6(ip, _) => buf.extend_from_slice(ip),
            Address::Domain(domain, _) => {
                let bytes = &domain.as_bytes()[..domain.len().min(255)];
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::Ipv4(v4.ip().octets(), v4.port()),
            SocketAddr::V6(v6) => Address::Ipv6(v6.ip().octets(), v6.port()),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv6(..) => write!(f, "[{}]:{}", self.host(), self.port()),
            _ => write!(f, "{}:{}", self.host(), self.port()),
        }
    }
}
