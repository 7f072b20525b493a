//! Prometheus metrics collection for arenad.
//!
//! Tracks session/presence/match population, router throughput, and the
//! drop counters mandated by the backpressure policies (tracker event
//! queue, per-peer delta queue, match inbound queue).

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry for all metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    // ========================================================================
    // Counters (monotonic increasing)
    // ========================================================================

    /// Realtime envelopes delivered to local session outbound queues.
    pub static ref MESSAGES_SENT: IntCounter = IntCounter::new(
        "arenad_messages_sent_total",
        "Envelopes enqueued to local sessions"
    ).unwrap();

    /// Envelopes handed to the cluster for remote delivery.
    pub static ref MESSAGES_ROUTED_REMOTE: IntCounter = IntCounter::new(
        "arenad_messages_routed_remote_total",
        "Envelopes sent to peer nodes"
    ).unwrap();

    /// Presence events dropped because the tracker event queue was full.
    pub static ref PRESENCE_EVENTS_DROPPED: IntCounter = IntCounter::new(
        "arenad_presence_events_dropped_total",
        "Tracker events dropped on queue overflow"
    ).unwrap();

    /// Tracker deltas dropped on a peer outbound queue overflow.
    pub static ref CLUSTER_DELTAS_DROPPED: IntCounter = IntCounter::new(
        "arenad_cluster_deltas_dropped_total",
        "Replication deltas dropped on peer queue overflow"
    ).unwrap();

    /// Match messages dropped because a match inbound queue was full.
    pub static ref MATCH_INBOUND_DROPPED: IntCounter = IntCounter::new(
        "arenad_match_inbound_dropped_total",
        "Match data messages dropped on inbound overflow"
    ).unwrap();

    /// Sessions closed for not draining their outbound queue.
    pub static ref SLOW_CONSUMERS_CLOSED: IntCounter = IntCounter::new(
        "arenad_slow_consumers_closed_total",
        "Sessions closed as slow consumers"
    ).unwrap();

    /// Pipeline errors by wire error code.
    pub static ref PIPELINE_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("arenad_pipeline_errors_total", "Handler errors by code"),
        &["code"]
    ).unwrap();

    /// Runtime RPC invocations by outcome.
    pub static ref RPC_CALLS: IntCounterVec = IntCounterVec::new(
        Opts::new("arenad_rpc_calls_total", "Runtime RPC calls by outcome"),
        &["outcome"]
    ).unwrap();

    // ========================================================================
    // Gauges (can increase/decrease)
    // ========================================================================

    /// Currently connected realtime sessions.
    pub static ref SESSIONS_CONNECTED: IntGauge = IntGauge::new(
        "arenad_sessions_connected",
        "Currently connected sessions"
    ).unwrap();

    /// Presences currently held by the local tracker (local + remote).
    pub static ref PRESENCES_TRACKED: IntGauge = IntGauge::new(
        "arenad_presences_tracked",
        "Presences in the tracker"
    ).unwrap();

    /// Authoritative matches running on this node.
    pub static ref MATCHES_ACTIVE: IntGauge = IntGauge::new(
        "arenad_matches_active",
        "Active authoritative matches"
    ).unwrap();

    /// Healthy cluster peers.
    pub static ref CLUSTER_PEERS: IntGauge = IntGauge::new(
        "arenad_cluster_peers",
        "Connected cluster peers"
    ).unwrap();
}

/// Initialize the Prometheus metrics registry.
///
/// Must be called once at server startup before any metrics are recorded.
pub fn init() {
    REGISTRY.register(Box::new(MESSAGES_SENT.clone())).unwrap();
    REGISTRY
        .register(Box::new(MESSAGES_ROUTED_REMOTE.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PRESENCE_EVENTS_DROPPED.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CLUSTER_DELTAS_DROPPED.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(MATCH_INBOUND_DROPPED.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(SLOW_CONSUMERS_CLOSED.clone()))
        .unwrap();
    REGISTRY.register(Box::new(PIPELINE_ERRORS.clone())).unwrap();
    REGISTRY.register(Box::new(RPC_CALLS.clone())).unwrap();
    REGISTRY
        .register(Box::new(SESSIONS_CONNECTED.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PRESENCES_TRACKED.clone()))
        .unwrap();
    REGISTRY.register(Box::new(MATCHES_ACTIVE.clone())).unwrap();
    REGISTRY.register(Box::new(CLUSTER_PEERS.clone())).unwrap();
}

/// Gather all metrics and encode them in Prometheus text format.
///
/// Returns a string suitable for HTTP response on `/metrics` endpoint.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
