//! Integration tests for Mirage Tunnel
//!
//! Exercises the full client-server flow over real loopback sockets:
//! - Encrypted framed carrier link
//! - Packet batches across tasks
//! - Router multiplexing, echo, and teardown convergence
//! - SOCKS5 negotiation into the dialer surface

use async_trait::async_trait;
use bytes::Bytes;
use mirage_tunnel::crypto::KEY_LEN;
use mirage_tunnel::router::{Client, Endpoint, Packet, Router, StreamId};
use mirage_tunnel::tunnel::Tunnel;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    mirage_tunnel::crypto::random_bytes(&mut key);
    key
}

/// Echo server accepting any number of connections
async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let (mut r, mut w) = conn.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Connected loopback socket pair: (application side, router side)
async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
    let app = TcpStream::connect(addr).await.unwrap();
    let router_side = accept.await.unwrap();
    (app, router_side)
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Bridge two routers with an encrypted TCP carrier link, the way
/// the TCP carrier wires them up
async fn bridge_routers(key: [u8; KEY_LEN]) -> (Router, Router) {
    let carrier = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let carrier_addr = carrier.local_addr().unwrap();

    let server_router = Router::new();
    {
        let router = server_router.clone();
        tokio::spawn(async move {
            let (conn, _) = carrier.accept().await.unwrap();
            let tunnel = Tunnel::new(conn, &key).unwrap();
            tunnel.proxy_with_router(&router).await;
        });
    }

    let client_router = Router::new();
    {
        let router = client_router.clone();
        let conn = TcpStream::connect(carrier_addr).await.unwrap();
        tokio::spawn(async move {
            let tunnel = Tunnel::new(conn, &key).unwrap();
            tunnel.proxy_with_router(&router).await;
        });
    }

    (client_router, server_router)
}

/// Test encrypted tunnel exchange between two real sockets
#[tokio::test]
async fn test_tunnel_over_tcp() {
    let key = random_key();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (conn, _) = listener.accept().await.unwrap();
        let tunnel = Tunnel::new(conn, &key).unwrap();
        let batch = tunnel.recv().await.unwrap();
        tunnel.send(&batch).await.unwrap();
        batch
    });

    let conn = TcpStream::connect(addr).await.unwrap();
    let tunnel = Tunnel::new(conn, &key).unwrap();

    let id = StreamId::random();
    let sent = vec![
        Packet::open(id.clone(), Endpoint::new("tcp", "example.com:443")),
        Packet::data(id.clone(), Bytes::from_static(b"payload")),
        Packet::close(id),
    ];
    tunnel.send(&sent).await.unwrap();

    let echoed = tunnel.recv().await.unwrap();
    assert_eq!(echoed, sent);
    assert_eq!(server.await.unwrap(), sent);
}

/// Test concurrent bidirectional batches over one link
#[tokio::test]
async fn test_tunnel_full_duplex() {
    let key = random_key();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (conn, _) = listener.accept().await.unwrap();
        let tunnel = Tunnel::new(conn, &key).unwrap();

        let mut received = Vec::new();
        for i in 0u8..50 {
            tunnel
                .send(&[Packet::data(StreamId::random(), Bytes::from(vec![i; 64]))])
                .await
                .unwrap();
            received.extend(tunnel.recv().await.unwrap());
        }
        received
    });

    let conn = TcpStream::connect(addr).await.unwrap();
    let tunnel = Tunnel::new(conn, &key).unwrap();

    let mut received = Vec::new();
    for i in 0u8..50 {
        tunnel
            .send(&[Packet::data(StreamId::random(), Bytes::from(vec![i; 64]))])
            .await
            .unwrap();
        received.extend(tunnel.recv().await.unwrap());
    }

    let from_client = server.await.unwrap();
    assert_eq!(received.len(), 50);
    assert_eq!(from_client.len(), 50);
    for (i, packet) in received.iter().enumerate() {
        assert_eq!(packet.data.as_ref(), vec![i as u8; 64].as_slice());
    }
}

/// Test a stream opened locally, echoed remotely, and torn down:
/// both routers converge to zero pipes
#[tokio::test]
async fn test_end_to_end_echo_and_convergence() {
    let (client_router, server_router) = bridge_routers(random_key()).await;
    let echo = spawn_echo_server().await;

    let (mut app, router_side) = socket_pair().await;
    let id = client_router
        .open_local(Endpoint::new("tcp", echo.to_string()), router_side)
        .await;

    app.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    app.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    // the same stream id is live on both sides
    assert_eq!(client_router.pipe_count(), 1);
    wait_for("server pipe", || server_router.pipe_count() == 1).await;

    // application hangs up; the close ripples around the loop and
    // the client side collects its pipe on the returning Close
    drop(app);
    let client = client_router.clone();
    wait_for("client convergence", move || client.pipe_count() == 0).await;

    // the server side holds its dead pipe until one further ingest
    // references the id
    assert_eq!(server_router.pipe_count(), 1);
    server_router.ingest(vec![Packet::close(id)]).await;
    assert_eq!(server_router.pipe_count(), 0);
}

/// Test several interleaved streams over one carrier link
#[tokio::test]
async fn test_concurrent_streams() {
    let (client_router, _server_router) = bridge_routers(random_key()).await;
    let echo = spawn_echo_server().await;

    let mut apps = Vec::new();
    for _ in 0..8 {
        let (app, router_side) = socket_pair().await;
        client_router
            .open_local(Endpoint::new("tcp", echo.to_string()), router_side)
            .await;
        apps.push(app);
    }

    // distinct payloads come back on the right streams
    let mut tasks = Vec::new();
    for (i, mut app) in apps.into_iter().enumerate() {
        tasks.push(tokio::spawn(async move {
            let payload = vec![i as u8; 2048];
            app.write_all(&payload).await.unwrap();
            let mut buf = vec![0u8; payload.len()];
            app.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, payload);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

/// Test a large transfer through the whole stack
#[tokio::test]
async fn test_large_transfer() {
    let (client_router, _server) = bridge_routers(random_key()).await;
    let echo = spawn_echo_server().await;

    let (mut app, router_side) = socket_pair().await;
    client_router
        .open_local(Endpoint::new("tcp", echo.to_string()), router_side)
        .await;

    let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();

    let expected = payload.clone();
    let (mut app_read, mut app_write) = app.split();
    let writer = async {
        app_write.write_all(&payload).await.unwrap();
    };
    let reader = async {
        let mut buf = vec![0u8; expected.len()];
        app_read.read_exact(&mut buf).await.unwrap();
        buf
    };
    let (_, echoed) = tokio::join!(writer, reader);
    assert_eq!(echoed, expected);
}

/// Carrier client that answers every stream by echoing the socket
/// locally, standing in for a full tunnel
struct EchoingClient;

#[async_trait]
impl Client for EchoingClient {
    async fn handle_connection(&self, _dest: Endpoint, mut conn: TcpStream) -> std::io::Result<()> {
        tokio::spawn(async move {
            let (mut r, mut w) = conn.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });
        Ok(())
    }
}

/// Test the SOCKS5 negotiation feeding the dialer surface
#[tokio::test]
async fn test_socks5_connect_handoff() {
    let socks = mirage_tunnel::proxy::Socks5Server::bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = socks.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = socks.run(Arc::new(EchoingClient)).await;
    });

    let mut conn = TcpStream::connect(addr).await.unwrap();

    // greeting: version 5, one method, no-auth
    conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    // CONNECT example.com:80 (domain form)
    let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
    request.extend_from_slice(b"example.com");
    request.extend_from_slice(&80u16.to_be_bytes());
    conn.write_all(&request).await.unwrap();

    let mut response = [0u8; 4 + 1 + 11 + 2];
    conn.read_exact(&mut response).await.unwrap();
    assert_eq!(&response[..4], &[0x05, 0x00, 0x00, 0x03]);

    // the socket now belongs to the carrier client (echoing here)
    conn.write_all(b"through the tunnel").await.unwrap();
    let mut echoed = [0u8; 18];
    conn.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"through the tunnel");
}
