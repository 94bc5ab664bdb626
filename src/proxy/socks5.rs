//! SOCKS5 server (RFC 1928)
//!
//! Deliberately small: no authentication (the listener binds to
//! localhost only) and CONNECT is the only supported command. The
//! accepted socket is handed straight to the carrier client, which
//! owns it from then on.

use super::{Address, ProxyError};
use crate::router::{Client, Endpoint};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

const SOCKS_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// SOCKS5 proxy server feeding the tunnel
pub struct Socks5Server {
    listener: TcpListener,
}

impl Socks5Server {
    /// Bind the listener
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 server listening on {}", addr);
        Ok(Self { listener })
    }

    /// The address the listener actually bound
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, handing each negotiated socket to
    /// `client`
    pub async fn run(&self, client: Arc<dyn Client>) -> Result<(), ProxyError> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("New SOCKS5 connection from {}", peer_addr);

            let client = client.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, client).await {
                    debug!("SOCKS5 connection error: {}", e);
                }
            });
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    client: Arc<dyn Client>,
) -> Result<(), ProxyError> {
    let mut buf = [0u8; 260];

    // Greeting: version, method count, methods
    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }
    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;

    if !buf[..nmethods].contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(ProxyError::NoAcceptableAuth);
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: version, command, reserved, address type
    stream.read_exact(&mut buf[..4]).await?;
    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }
    let command = buf[1];
    let addr_type = buf[3];

    let address = match addr_type {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            Address::Ipv4(ip, u16::from_be_bytes(port))
        }
        ATYP_DOMAIN => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = buf[0] as usize;
            stream.read_exact(&mut buf[..len]).await?;
            let domain = String::from_utf8_lossy(&buf[..len]).to_string();
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            Address::Domain(domain, u16::from_be_bytes(port))
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            Address::Ipv6(ip, u16::from_be_bytes(port))
        }
        other => return Err(ProxyError::UnsupportedAddressType(other)),
    };

    if command != CMD_CONNECT {
        stream
            .write_all(&make_reply(REPLY_COMMAND_NOT_SUPPORTED, &address))
            .await?;
        return Err(ProxyError::UnsupportedCommand(command));
    }

    debug!("SOCKS5 CONNECT to {}", address);

    // The far end dials the destination, so the local reply can
    // succeed immediately; a failed dial surfaces as a closed stream.
    stream
        .write_all(&make_reply(REPLY_SUCCEEDED, &address))
        .await?;

    if let Err(e) = client
        .handle_connection(Endpoint::new("tcp", address.to_string()), stream)
        .await
    {
        error!("Failed to hand {} to the tunnel: {}", address, e);
    }
    Ok(())
}

fn make_reply(reply: u8, addr: &Address) -> Vec<u8> {
    let mut buf = vec![SOCKS_VERSION, reply, 0x00];

    match addr {
        Address::Ipv4(ip, port) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(ip);
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Ipv6(ip, port) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(ip);
            buf.extend_from_slice(&port.to_be_bytes());
        }
        Address::Domain(domain, port) => {
            buf.push(ATYP_DOMAIN);
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
            buf.extend_from_slice(&port.to_be_bytes());
        }
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_layout() {
        let reply = make_reply(REPLY_SUCCEEDED, &Address::Ipv4([127, 0, 0, 1], 1080));
        assert_eq!(
            reply,
            vec![0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38]
        );
    }

    #[test]
    fn test_domain_reply_layout() {
        let reply = make_reply(REPLY_SUCCEEDED, &Address::Domain("ab".into(), 80));
        assert_eq!(reply, vec![0x05, 0x00, 0x00, 0x03, 2, b'a', b'b', 0x00, 0x50]);
    }
}
