//! Queue and resource cap configuration.

use serde::Deserialize;

/// Resource caps for the bounded queues in the realtime path.
///
/// Every queue in the hot path is bounded; these caps decide when the
/// overflow policy (close, drop-with-counter) kicks in.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Session outbound queue capacity (default: 64). Overflow closes the
    /// session as a slow consumer.
    #[serde(default = "default_session_outbound_queue")]
    pub session_outbound_queue: usize,
    /// Tracker event queue capacity (default: 1024). Overflow drops the
    /// event and bumps a counter.
    #[serde(default = "default_tracker_event_queue")]
    pub tracker_event_queue: usize,
    /// Match inbound capacity per tick-rate unit (default: 256, so a match
    /// at tick rate T holds T*256 messages).
    #[serde(default = "default_match_inbound_scale")]
    pub match_inbound_scale: usize,
    /// Per-peer replication queue capacity (default: 4096). Overflow drops
    /// the oldest delta.
    #[serde(default = "default_peer_outbound_queue")]
    pub peer_outbound_queue: usize,
    /// Seconds between pings on an idle session (default: 15).
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Seconds without a pong before the session is closed (default: 30).
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
    /// Per-frame write deadline in milliseconds (default: 10_000).
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            session_outbound_queue: default_session_outbound_queue(),
            tracker_event_queue: default_tracker_event_queue(),
            match_inbound_scale: default_match_inbound_scale(),
            peer_outbound_queue: default_peer_outbound_queue(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

fn default_session_outbound_queue() -> usize {
    64
}

fn default_tracker_event_queue() -> usize {
    1024
}

fn default_match_inbound_scale() -> usize {
    256
}

fn default_peer_outbound_queue() -> usize {
    4096
}

fn default_ping_interval() -> u64 {
    15
}

fn default_pong_timeout() -> u64 {
    30
}

fn default_write_timeout_ms() -> u64 {
    10_000
}
