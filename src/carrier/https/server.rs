//! HTTPS carrier server
//!
//! Serves what looks like a small static site over TLS. Requests
//! that present the configured bearer token reach the proxy handler;
//! everything else falls through to the decoy. Port 80 is a
//! permanent redirect to the HTTPS origin.
//!
//! The proxy handler keeps the most recent `(ID, response)` pair: a
//! repeated `ID` returns the stored bytes without touching the
//! router, so a client whose response was lost on the wire can
//! safely retry the same request.

use super::{certs::CertificateStore, decoy, AUTH_HEADER, ID_HEADER, SERVER_BUFFER};
use crate::carrier::CarrierError;
use crate::config::Configuration;
use crate::router::{Packet, Router};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

const HTTPS_PORT: u16 = 443;
const HTTP_PORT: u16 = 80;

/// Drain window for in-flight requests when the listeners stop
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands sent by the rotation hooks
enum Command {
    Stop(oneshot::Sender<()>),
    Start(oneshot::Sender<()>),
    End,
}

/// State shared by every request handler
pub(crate) struct ProxyState {
    token: String,
    pub(crate) router: Router,
    previous: Mutex<StoredResponse>,
}

/// The most recently served authenticated exchange
struct StoredResponse {
    id: String,
    body: Bytes,
}

impl ProxyState {
    pub(crate) fn new(token: String, router: Router) -> Self {
        Self {
            token,
            router,
            previous: Mutex::new(StoredResponse {
                id: String::new(),
                body: Bytes::from_static(b"[]"),
            }),
        }
    }
}

/// HTTPS carrier server
pub struct HttpsServer {
    state: Arc<ProxyState>,
    tls_config: Arc<rustls::ServerConfig>,
    certs: Arc<CertificateStore>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
}

/// Hooks handed to the certificate provider: `stop` closes both
/// listeners (draining in-flight requests), `start` reopens them
#[derive(Clone)]
pub struct ServerHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ServerHandle {
    /// Close both listeners and wait for them to drain
    pub async fn stop(&self) {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Reopen the listeners after a `stop`
    pub async fn start(&self) {
        let (ack, done) = oneshot::channel();
        if self.cmd_tx.send(Command::Start(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Shut the server down for good
    pub async fn end(&self) {
        let _ = self.cmd_tx.send(Command::End).await;
    }
}

impl HttpsServer {
    /// Build a server from the configuration
    pub fn new(conf: &Configuration) -> Result<Self, crate::Error> {
        let versions: &[&rustls::SupportedProtocolVersion] = match conf.get("tlsMaxVersion") {
            "1.2" => &[&rustls::version::TLS12],
            "1.3" => &[&rustls::version::TLS13, &rustls::version::TLS12],
            _ => {
                return Err(crate::Error::Config(
                    "tlsMaxVersion must be one of 1.2 or 1.3".into(),
                ))
            }
        };

        let certs = Arc::new(
            CertificateStore::from_pem_files(conf.get("tlsCertFile"), conf.get("tlsKeyFile"))
                .map_err(crate::Error::Carrier)?,
        );

        let tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(versions)
        .map_err(|e| crate::Error::Carrier(CarrierError::Tls(e.to_string())))?
        .with_no_client_auth()
        .with_cert_resolver(certs.clone());

        let (cmd_tx, cmd_rx) = mpsc::channel(1);

        Ok(Self {
            state: Arc::new(ProxyState::new(
                conf.get("authToken").to_string(),
                Router::new(),
            )),
            tls_config: Arc::new(tls_config),
            certs,
            cmd_tx,
            cmd_rx,
        })
    }

    /// The certificate seam for the external provider
    pub fn certificate_store(&self) -> Arc<CertificateStore> {
        self.certs.clone()
    }

    /// Stop/start hooks for certificate rotation
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Run the listeners until a fatal error or an `end` command.
    ///
    /// `stop`/`start` commands from the rotation hooks close and
    /// reopen both listeners without returning.
    pub async fn start(&mut self) -> Result<(), crate::Error> {
        let mut pending_ack: Option<oneshot::Sender<()>> = None;

        loop {
            let mut listeners = Listeners::launch(self.state.clone(), self.tls_config.clone())
                .await
                .map_err(crate::Error::Carrier)?;
            info!(
                "HTTPS carrier listening on :{} (redirect on :{})",
                HTTPS_PORT, HTTP_PORT
            );
            if let Some(ack) = pending_ack.take() {
                let _ = ack.send(());
            }

            // supervise until a listener dies or a command arrives
            loop {
                tokio::select! {
                    result = &mut listeners.https_task => {
                        let _ = listeners.shutdown_tx.send(true);
                        let _ = listeners.http_task.await;
                        return Err(task_error("https", result));
                    }
                    result = &mut listeners.http_task => {
                        let _ = listeners.shutdown_tx.send(true);
                        let _ = listeners.https_task.await;
                        return Err(task_error("http", result));
                    }
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(Command::Stop(ack)) => {
                            listeners.shutdown().await;
                            let _ = ack.send(());
                            break;
                        }
                        Some(Command::Start(ack)) => {
                            // already running
                            let _ = ack.send(());
                        }
                        Some(Command::End) | None => {
                            listeners.shutdown().await;
                            return Ok(());
                        }
                    }
                }
            }

            // stopped; wait to be started again
            loop {
                match self.cmd_rx.recv().await {
                    Some(Command::Start(ack)) => {
                        pending_ack = Some(ack);
                        break;
                    }
                    Some(Command::Stop(ack)) => {
                        let _ = ack.send(());
                    }
                    Some(Command::End) | None => return Ok(()),
                }
            }
        }
    }
}

fn task_error(
    name: &str,
    result: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> crate::Error {
    let msg = match result {
        Ok(Ok(())) => format!("{} listener exited unexpectedly", name),
        Ok(Err(e)) => format!("{} listener failed: {}", name, e),
        Err(e) => format!("{} listener panicked: {}", name, e),
    };
    crate::Error::Carrier(CarrierError::Http(msg))
}

/// One running generation of the two listeners
struct Listeners {
    shutdown_tx: watch::Sender<bool>,
    https_task: tokio::task::JoinHandle<std::io::Result<()>>,
    http_task: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl Listeners {
    async fn launch(
        state: Arc<ProxyState>,
        tls_config: Arc<rustls::ServerConfig>,
    ) -> Result<Self, CarrierError> {
        let https_listener = TcpListener::bind(("0.0.0.0", HTTPS_PORT)).await?;
        let http_listener = TcpListener::bind(("0.0.0.0", HTTP_PORT)).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let acceptor = TlsAcceptor::from(tls_config);

        let https_task = tokio::spawn(serve_https(
            https_listener,
            acceptor,
            state,
            shutdown_rx.clone(),
        ));
        let http_task = tokio::spawn(serve_redirect(http_listener, shutdown_rx));

        Ok(Self {
            shutdown_tx,
            https_task,
            http_task,
        })
    }

    async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.https_task.await;
        let _ = self.http_task.await;
    }
}

async fn serve_https(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: Arc<ProxyState>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let mut conns = JoinSet::new();
    let result = loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let acceptor = acceptor.clone();
                    let state = state.clone();
                    let shutdown = shutdown.clone();
                    conns.spawn(handle_https_conn(stream, peer, acceptor, state, shutdown));
                }
                Err(e) => break Err(e),
            },
            _ = shutdown.changed() => break Ok(()),
            // reap finished connection tasks so the set stays small
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    };
    drop(listener);

    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while conns.join_next().await.is_some() {}
    })
    .await;
    result
}

async fn handle_https_conn(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    state: Arc<ProxyState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(s) => s,
        Err(e) => {
            debug!("TLS handshake with {} failed: {}", peer, e);
            return;
        }
    };
    let io = TokioIo::new(tls_stream);

    let service = service_fn(move |req| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(handle_request(&state, req).await) }
    });

    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!("Connection from {} ended: {}", peer, e);
            }
        }
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, conn.as_mut()).await;
        }
    }
}

async fn serve_redirect(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let mut conns = JoinSet::new();
    let result = loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let shutdown = shutdown.clone();
                    conns.spawn(handle_redirect_conn(stream, peer, shutdown));
                }
                Err(e) => break Err(e),
            },
            _ = shutdown.changed() => break Ok(()),
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
        }
    };
    drop(listener);

    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while conns.join_next().await.is_some() {}
    })
    .await;
    result
}

async fn handle_redirect_conn(
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let io = TokioIo::new(stream);
    let service =
        service_fn(|req| async move { Ok::<_, Infallible>(redirect_response(&req)) });

    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!("Redirect connection from {} ended: {}", peer, e);
            }
        }
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, conn.as_mut()).await;
        }
    }
}

/// Permanent redirect to the HTTPS origin, preserving host and path
fn redirect_response<B>(req: &Request<B>) -> Response<Full<Bytes>> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let location = format!("https://{}{}", host, req.uri());

    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = StatusCode::MOVED_PERMANENTLY;
    if let Ok(value) = HeaderValue::from_str(&location) {
        resp.headers_mut().insert(LOCATION, value);
    }
    resp
}

/// Gate every request on the bearer token; failures see the decoy
async fn handle_request<B>(state: &Arc<ProxyState>, req: Request<B>) -> Response<Full<Bytes>>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    let provided = req
        .headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if verify_token(provided, &state.token) {
        proxy_handler(state, req).await
    } else {
        decoy::serve(req.uri().path())
    }
}

/// Compare tokens in time that depends on input length but not on
/// input contents. Unequal lengths answer immediately; that leaks
/// only the token length.
fn verify_token(provided: &str, expected: &str) -> bool {
    if provided.len() != expected.len() {
        return false;
    }
    provided
        .as_bytes()
        .ct_eq(expected.as_bytes())
        .into()
}

/// The authenticated exchange: ingest the request batch and answer
/// with a freshly filled one, unless the `ID` was already served
async fn proxy_handler<B>(state: &Arc<ProxyState>, req: Request<B>) -> Response<Full<Bytes>>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: std::fmt::Display,
{
    if req.method() != Method::POST {
        return text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "error: method must be POST",
        );
    }

    let id = match req
        .headers()
        .get(ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| !id.is_empty())
    {
        Some(id) => id.to_string(),
        None => {
            return text_response(StatusCode::BAD_REQUEST, "error: ID header must be included")
        }
    };

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("error while reading client payload: {}", e),
            )
        }
    };

    let packets: Vec<Packet> = match serde_json::from_slice(&body) {
        Ok(packets) => packets,
        Err(e) => {
            return text_response(
                StatusCode::BAD_REQUEST,
                &format!("error: failed to parse request: {}", e),
            )
        }
    };

    // Take/put discipline on the replay slot: concurrent requests
    // observe a consistent (ID, bytes) pair.
    let mut previous = state.previous.lock().await;

    if previous.id != id {
        let router = state.router.clone();
        tokio::spawn(async move { router.ingest(packets).await });

        let outbound = state.router.fill(SERVER_BUFFER).await;
        let encoded = match serde_json::to_vec(&outbound) {
            Ok(encoded) => encoded,
            Err(e) => {
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("error: failed to encode response: {}", e),
                )
            }
        };
        previous.id = id;
        previous.body = Bytes::from(encoded);
    }

    let body = previous.body.clone();
    drop(previous);

    let mut resp = Response::new(Full::new(body));
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

fn text_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(message.to_string())));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
