//! Local proxy front end
//!
//! A minimal SOCKS5 server that hands every accepted CONNECT socket
//! to the carrier client, which multiplexes it through the tunnel.

mod socks5;

pub use socks5::Socks5Server;

use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("No acceptable authentication method")]
    NoAcceptableAuth,

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),
}

/// Target address requested by a SOCKS client
#[derive(Debug, Clone)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip, port) => {
                write!(f, "{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
            }
            Address::Ipv6(ip, port) => {
                write!(f, "[{}]:{}", std::net::Ipv6Addr::from(*ip), port)
            }
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        assert_eq!(Address::Ipv4([10, 0, 0, 1], 443).to_string(), "10.0.0.1:443");
        assert_eq!(
            Address::Domain("example.com".into(), 80).to_string(),
            "example.com:80"
        );
        let localhost6 = Address::Ipv6(
            std::net::Ipv6Addr::LOCALHOST.octets(),
            8080,
        );
        assert_eq!(localhost6.to_string(), "[::1]:8080");
    }
}
