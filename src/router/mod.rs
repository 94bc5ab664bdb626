//! Multiplex router
//!
//! Fans many concurrent TCP connections into one ordered sequence of
//! identified packets and fans inbound packets back out to the right
//! per-connection byte stream. Each stream owns a pipe (its inbound
//! queue plus a closed flag) and two workers: a writer draining the
//! pipe into the socket and a reader turning socket bytes into
//! outbound `Data` packets.
//!
//! Stream teardown is lazy: a worker that dies only marks the pipe
//! closed; the entry is removed by the next `ingest` that references
//! the id, which lets late packets be observed and dropped without a
//! background sweeper.

mod packet;

pub use packet::{Endpoint, Packet, PacketKind, StreamId};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, trace};

/// Capacity of the aggregate outbound queue and of each per-stream
/// inbound queue, in packets
pub const QUEUE_CAPACITY: usize = 4096;

/// Scratch buffer for socket reads; each read is copied into a fresh
/// packet payload before the buffer is reused
const SCRATCH_SIZE: usize = 64 * 1024;

/// Client side of a carrier: takes locally accepted sockets and
/// multiplexes them towards the far end of the tunnel
#[async_trait]
pub trait Client: Send + Sync {
    /// Carry `conn` through the tunnel to `dest`
    async fn handle_connection(&self, dest: Endpoint, conn: TcpStream) -> std::io::Result<()>;
}

/// Per-stream state owned by the router
#[derive(Clone)]
struct Pipe {
    inbound_tx: mpsc::Sender<Packet>,
    closed: Arc<AtomicBool>,
}

/// The multiplex engine.
///
/// Cheap to clone; all clones share the same queues and pipe map.
#[derive(Clone)]
pub struct Router {
    outbound_tx: mpsc::Sender<Packet>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<Packet>>>,
    pipes: Arc<DashMap<StreamId, Pipe>>,
}

impl Router {
    /// Create an empty router
    pub fn new() -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            pipes: Arc::new(DashMap::new()),
        }
    }

    /// Register a locally accepted socket that wants to talk to
    /// `dest` on the far side.
    ///
    /// Assigns a fresh stream id, announces it to the peer with an
    /// `Open` packet, and starts the two per-stream workers. The
    /// returned id identifies the stream on both ends.
    pub async fn open_local(&self, dest: Endpoint, conn: TcpStream) -> StreamId {
        let id = StreamId::random();
        // announce before the workers can enqueue any data
        let _ = self
            .outbound_tx
            .send(Packet::open(id.clone(), dest))
            .await;
        self.register(id.clone(), conn);
        id
    }

    /// Handle a peer-initiated `Open`: dial the destination and
    /// register the stream under the peer's id. No `Open` is echoed
    /// back; this end is the callee.
    async fn open_remote(&self, id: StreamId, dest: Option<Endpoint>) {
        let Some(dest) = dest else {
            trace!("Open packet without destination for stream {}", id);
            return;
        };

        if dest.network != "tcp" {
            debug!("Refusing non-tcp endpoint {} for stream {}", dest, id);
            let _ = self.outbound_tx.send(Packet::close(id)).await;
            return;
        }

        match TcpStream::connect(&dest.address).await {
            Ok(conn) => {
                debug!("Stream {} dialed {}", id, dest.address);
                self.register(id, conn);
            }
            Err(e) => {
                debug!("Stream {} failed to dial {}: {}", id, dest.address, e);
                let _ = self.outbound_tx.send(Packet::close(id)).await;
            }
        }
    }

    /// Register a pipe for `id` and start its workers
    fn register(&self, id: StreamId, conn: TcpStream) {
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));
        self.pipes.insert(
            id.clone(),
            Pipe {
                inbound_tx,
                closed: closed.clone(),
            },
        );

        let (read_half, write_half) = conn.into_split();
        let hangup = Arc::new(Notify::new());

        tokio::spawn(write_worker(
            id.clone(),
            write_half,
            inbound_rx,
            self.outbound_tx.clone(),
            closed.clone(),
            hangup.clone(),
        ));
        tokio::spawn(read_worker(
            id,
            read_half,
            self.outbound_tx.clone(),
            closed,
            hangup,
        ));
    }

    /// Route a batch of packets from the far side.
    ///
    /// Unknown ids open a new stream when the packet is an `Open` and
    /// are dropped otherwise. A packet referencing a pipe whose
    /// closed flag is set removes the pipe instead of delivering.
    /// Delivery into a full inbound queue blocks, which backpressures
    /// the caller.
    pub async fn ingest(&self, packets: Vec<Packet>) {
        for packet in packets {
            // clone out of the map so no shard lock is held across await
            let pipe = self.pipes.get(&packet.id).map(|entry| entry.value().clone());

            let Some(pipe) = pipe else {
                if packet.is_open() {
                    self.open_remote(packet.id, packet.dest).await;
                }
                continue;
            };

            if pipe.closed.load(Ordering::Acquire) {
                self.pipes.remove(&packet.id);
                continue;
            }

            // send fails only if the writer already exited; the flag
            // is set in that case and the next packet cleans up
            let _ = pipe.inbound_tx.send(packet).await;
        }
    }

    /// Drain up to `max` pending outbound packets without blocking.
    /// Returns fewer (possibly zero) packets when the queue is short.
    pub async fn fill(&self, max: usize) -> Vec<Packet> {
        let mut rx = self.outbound_rx.lock().await;
        let pending = rx.len().min(max);
        let mut batch = Vec::with_capacity(pending);
        for _ in 0..pending {
            match rx.recv().await {
                Some(packet) => batch.push(packet),
                None => break,
            }
        }
        batch
    }

    /// Wait until at least one outbound packet exists, then drain up
    /// to `max`. Used by carriers that should stay quiet on an idle
    /// link.
    pub async fn next_batch(&self, max: usize) -> Vec<Packet> {
        let mut rx = self.outbound_rx.lock().await;
        let mut batch = Vec::new();
        match rx.recv().await {
            Some(packet) => batch.push(packet),
            None => return batch,
        }
        let pending = rx.len().min(max.saturating_sub(1));
        for _ in 0..pending {
            match rx.recv().await {
                Some(packet) => batch.push(packet),
                None => break,
            }
        }
        batch
    }

    /// Number of packets waiting on the outbound queue
    pub async fn queue_len(&self) -> usize {
        self.outbound_rx.lock().await.len()
    }

    /// Number of registered pipes (streams not yet garbage-collected)
    pub fn pipe_count(&self) -> usize {
        self.pipes.len()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Peer-to-socket worker: applies inbound packets to the socket in
/// dequeue order, exits on `Close` or write failure, then marks the
/// pipe closed and shuts the socket down (which also hangs up the
/// reader).
async fn write_worker(
    id: StreamId,
    mut conn: OwnedWriteHalf,
    mut inbound: mpsc::Receiver<Packet>,
    outbound: mpsc::Sender<Packet>,
    closed: Arc<AtomicBool>,
    hangup: Arc<Notify>,
) {
    while let Some(packet) = inbound.recv().await {
        debug_assert_eq!(packet.id, id, "packet routed to the wrong pipe");

        if packet.is_close() {
            break;
        }

        if let Err(e) = conn.write_all(&packet.data).await {
            trace!("Stream {} write failed: {}", id, e);
            let _ = outbound.send(Packet::close(id.clone())).await;
            break;
        }
    }

    closed.store(true, Ordering::Release);
    let _ = conn.shutdown().await;
    hangup.notify_one();
}

/// Socket-to-peer worker: copies each socket read into a fresh
/// payload and enqueues it outbound; emits `Close` on EOF, read
/// error, or hangup by the writer.
async fn read_worker(
    id: StreamId,
    mut conn: OwnedReadHalf,
    outbound: mpsc::Sender<Packet>,
    closed: Arc<AtomicBool>,
    hangup: Arc<Notify>,
) {
    let mut scratch = vec![0u8; SCRATCH_SIZE];
    loop {
        tokio::select! {
            result = conn.read(&mut scratch) => match result {
                Ok(0) => {
                    let _ = outbound.send(Packet::close(id.clone())).await;
                    break;
                }
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&scratch[..n]);
                    if outbound.send(Packet::data(id.clone(), data)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    trace!("Stream {} read failed: {}", id, e);
                    let _ = outbound.send(Packet::close(id.clone())).await;
                    break;
                }
            },
            _ = hangup.notified() => {
                let _ = outbound.send(Packet::close(id.clone())).await;
                break;
            }
        }
    }

    closed.store(true, Ordering::Release);
}
