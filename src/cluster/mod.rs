//! Cluster transport: peer links, delta replication, point-to-point
//! delivery.
//!
//! Each peer link is a TCP connection carrying length-delimited MessagePack
//! frames of [`ClusterEnvelope`]. The link task multiplexes an outbound
//! queue (tracker deltas, routed messages, pings) with inbound dispatch.
//! Replication is best-effort: a full peer queue drops the oldest delta and
//! bumps a loss counter; consistency is rebuilt by the snapshot exchanged
//! on (re)connect.

mod protocol;

pub use protocol::InboundHandler;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arena_proto::ClusterEnvelope;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PeerBlock;
use crate::metrics;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const PEER_TIMEOUT: Duration = Duration::from_secs(45);
const REDIAL_DELAY: Duration = Duration::from_secs(5);

/// Bounded drop-oldest queue feeding one peer link.
struct PeerQueue {
    deque: Mutex<VecDeque<ClusterEnvelope>>,
    notify: Notify,
    cap: usize,
}

impl PeerQueue {
    fn new(cap: usize) -> Self {
        Self {
            deque: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cap,
        }
    }

    fn push(&self, env: ClusterEnvelope) {
        {
            let mut deque = self.deque.lock();
            if deque.len() >= self.cap {
                deque.pop_front();
                metrics::CLUSTER_DELTAS_DROPPED.inc();
            }
            deque.push_back(env);
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> ClusterEnvelope {
        loop {
            if let Some(env) = self.deque.lock().pop_front() {
                return env;
            }
            self.notify.notified().await;
        }
    }
}

/// One healthy peer link.
pub struct PeerHandle {
    pub name: String,
    queue: Arc<PeerQueue>,
    last_pong: Mutex<Instant>,
}

/// Manages peer links and the replication fan-out.
pub struct ClusterManager {
    node: String,
    peers: DashMap<String, Arc<PeerHandle>>,
    queue_cap: usize,
    shutdown: CancellationToken,
}

impl ClusterManager {
    pub fn new(node: impl Into<String>, queue_cap: usize, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            node: node.into(),
            peers: DashMap::new(),
            queue_cap,
            shutdown,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    #[allow(dead_code)] // Available to the console surface
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Best-effort send to all currently healthy peers. No ack, no retry.
    pub fn broadcast(&self, env: ClusterEnvelope) {
        for peer in self.peers.iter() {
            peer.queue.push(env.clone());
        }
    }

    /// Point-to-point send to one peer. Returns false when the peer link is
    /// not currently established.
    pub fn send(&self, node: &str, env: ClusterEnvelope) -> bool {
        match self.peers.get(node) {
            Some(peer) => {
                peer.queue.push(env);
                true
            }
            None => {
                debug!(node = %node, "No link to peer, dropping envelope");
                false
            }
        }
    }

    /// Drain the tracker's delta stream into peer broadcasts, preserving
    /// commit order.
    pub fn spawn_replica_pump(
        self: &Arc<Self>,
        mut replica_rx: mpsc::Receiver<ClusterEnvelope>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(delta) = replica_rx.recv().await {
                manager.broadcast(delta);
            }
        });
    }

    /// Dial a configured peer, redialing on loss while autoconnect is set.
    pub fn connect_to_peer(self: &Arc<Self>, handler: Arc<InboundHandler>, link: PeerBlock) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                if manager.shutdown.is_cancelled() {
                    return;
                }
                match TcpStream::connect(&link.addr).await {
                    Ok(stream) => {
                        info!(peer = %link.name, addr = %link.addr, "Cluster link established (outbound)");
                        if let Err(e) =
                            run_link(manager.clone(), handler.clone(), stream, true).await
                        {
                            warn!(peer = %link.name, error = %e, "Cluster link lost");
                        }
                    }
                    Err(e) => {
                        debug!(peer = %link.name, addr = %link.addr, error = %e, "Cluster dial failed");
                    }
                }
                if !link.autoconnect {
                    return;
                }
                tokio::time::sleep(REDIAL_DELAY).await;
            }
        });
    }

    /// Accept inbound peer links.
    pub fn start_inbound_listener(
        self: &Arc<Self>,
        handler: Arc<InboundHandler>,
        listen_addr: String,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
                Ok(l) => l,
                Err(e) => {
                    warn!(addr = %listen_addr, error = %e, "Failed to bind cluster listener");
                    return;
                }
            };
            info!(addr = %listen_addr, "Cluster listener started");
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                debug!(addr = %addr, "Inbound cluster connection");
                                let manager = manager.clone();
                                let handler = handler.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = run_link(manager, handler, stream, false).await {
                                        warn!(error = %e, "Inbound cluster link lost");
                                    }
                                });
                            }
                            Err(e) => warn!(error = %e, "Cluster accept failed"),
                        }
                    }
                    _ = manager.shutdown.cancelled() => return,
                }
            }
        });
    }

    /// Ping peers on an interval; a peer that misses the timeout is dropped
    /// and its presences evicted via the link task's cleanup path.
    pub fn start_heartbeat(self: &Arc<Self>, handler: Arc<InboundHandler>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = Instant::now();
                        let mut dead = Vec::new();
                        for peer in manager.peers.iter() {
                            if now.duration_since(*peer.last_pong.lock()) > PEER_TIMEOUT {
                                dead.push(peer.name.clone());
                            } else {
                                peer.queue.push(ClusterEnvelope::Ping);
                            }
                        }
                        for name in dead {
                            info!(peer = %name, "Peer timed out");
                            manager.drop_peer(&name, &handler);
                        }
                    }
                    _ = manager.shutdown.cancelled() => return,
                }
            }
        });
    }

    fn register_peer(&self, name: &str, queue: Arc<PeerQueue>) -> Arc<PeerHandle> {
        let handle = Arc::new(PeerHandle {
            name: name.to_string(),
            queue,
            last_pong: Mutex::new(Instant::now()),
        });
        self.peers.insert(name.to_string(), handle.clone());
        metrics::CLUSTER_PEERS.set(self.peers.len() as i64);
        handle
    }

    fn drop_peer(&self, name: &str, handler: &InboundHandler) {
        if self.peers.remove(name).is_some() {
            metrics::CLUSTER_PEERS.set(self.peers.len() as i64);
            handler.on_peer_lost(name);
        }
    }
}

type LinkSink = futures_util::stream::SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>;
type LinkStream = futures_util::stream::SplitStream<Framed<TcpStream, LengthDelimitedCodec>>;

async fn send_frame(sink: &mut LinkSink, env: &ClusterEnvelope) -> anyhow::Result<()> {
    let frame = env.to_frame()?;
    sink.send(Bytes::from(frame)).await?;
    Ok(())
}

async fn read_frame(stream: &mut LinkStream) -> anyhow::Result<ClusterEnvelope> {
    match stream.next().await {
        Some(Ok(bytes)) => Ok(ClusterEnvelope::from_frame(&bytes)?),
        Some(Err(e)) => Err(e.into()),
        None => anyhow::bail!("link closed during handshake"),
    }
}


/// Run one peer link to completion: handshake, snapshot exchange, then the
/// multiplexed send/receive loop. On any exit the peer is dropped and its
/// presences evicted.
async fn run_link(
    manager: Arc<ClusterManager>,
    handler: Arc<InboundHandler>,
    stream: TcpStream,
    dialer: bool,
) -> anyhow::Result<()> {
    let framed = Framed::new(stream, LengthDelimitedCodec::new());
    let (mut sink, mut stream) = framed.split();

    // Handshake: dialer leads with Hello, acceptor answers Welcome.
    let peer_name = if dialer {
        send_frame(
            &mut sink,
            &ClusterEnvelope::Hello {
                node: manager.node.clone(),
            },
        )
        .await?;
        match read_frame(&mut stream).await? {
            ClusterEnvelope::Welcome { node } => node,
            other => anyhow::bail!("expected Welcome, got {other:?}"),
        }
    } else {
        match read_frame(&mut stream).await? {
            ClusterEnvelope::Hello { node } => {
                send_frame(
                    &mut sink,
                    &ClusterEnvelope::Welcome {
                        node: manager.node.clone(),
                    },
                )
                .await?;
                node
            }
            other => anyhow::bail!("expected Hello, got {other:?}"),
        }
    };
    if peer_name == manager.node {
        anyhow::bail!("peer announced this node's own name {peer_name:?}");
    }

    let queue = Arc::new(PeerQueue::new(manager.queue_cap));
    let handle = manager.register_peer(&peer_name, queue.clone());

    // Lazy consistency: replay the full local presence snapshot so the peer
    // can merge and sweep stale entries from a previous incarnation.
    queue.push(handler.local_snapshot());

    let result: anyhow::Result<()> = async {
        loop {
            tokio::select! {
                outbound = queue.pop() => {
                    send_frame(&mut sink, &outbound).await?;
                }
                inbound = stream.next() => {
                    let frame = match inbound {
                        Some(Ok(bytes)) => bytes,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    };
                    match ClusterEnvelope::from_frame(&frame)? {
                        // Replies go through the queue: the sink branch is
                        // the only writer.
                        ClusterEnvelope::Ping => queue.push(ClusterEnvelope::Pong),
                        ClusterEnvelope::Pong => {
                            *handle.last_pong.lock() = Instant::now();
                        }
                        env => {
                            if let Some(reply) = handler.handle(&peer_name, env) {
                                queue.push(reply);
                            }
                        }
                    }
                }
                _ = manager.shutdown.cancelled() => return Ok(()),
            }
        }
    }
    .await;

    // Only drop the peer if a newer link has not already replaced it.
    let still_ours = manager
        .peers
        .get(&peer_name)
        .map(|p| Arc::ptr_eq(&p.queue, &queue))
        .unwrap_or(false);
    if still_ours {
        manager.drop_peer(&peer_name, &handler);
    }
    result
}
