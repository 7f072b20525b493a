//! Dispatch of inbound cluster envelopes.

use std::sync::Arc;

use arena_proto::ClusterEnvelope;
use tracing::{debug, warn};

use crate::session::SessionRegistry;
use crate::tracker::Tracker;

/// Handles cluster envelopes received from peers after the handshake.
pub struct InboundHandler {
    node: String,
    tracker: Arc<Tracker>,
    sessions: Arc<SessionRegistry>,
}

impl InboundHandler {
    pub fn new(node: impl Into<String>, tracker: Arc<Tracker>, sessions: Arc<SessionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            node: node.into(),
            tracker,
            sessions,
        })
    }

    /// The full local presence snapshot, sent on every (re)connect.
    pub fn local_snapshot(&self) -> ClusterEnvelope {
        ClusterEnvelope::Snapshot {
            node: self.node.clone(),
            presences: self.tracker.snapshot_local(),
        }
    }

    /// A peer link died: discard everything it owned. The sweep emits no
    /// presence events.
    pub fn on_peer_lost(&self, peer: &str) {
        self.tracker.evict_node(peer);
    }

    /// Dispatch one envelope, optionally producing a direct reply.
    pub fn handle(&self, peer: &str, env: ClusterEnvelope) -> Option<ClusterEnvelope> {
        match env {
            ClusterEnvelope::Track { .. }
            | ClusterEnvelope::Untrack { .. }
            | ClusterEnvelope::UntrackAll { .. }
            | ClusterEnvelope::UntrackByMode { .. }
            | ClusterEnvelope::UntrackByStream { .. } => {
                self.tracker.apply_remote(env);
                None
            }
            ClusterEnvelope::Snapshot { node, presences } => {
                if node != peer {
                    warn!(peer = %peer, claimed = %node, "Snapshot for foreign node ignored");
                    return None;
                }
                debug!(peer = %peer, count = presences.len(), "Merging peer snapshot");
                self.tracker.merge_snapshot(&node, presences);
                None
            }
            ClusterEnvelope::SnapshotRequest => Some(self.local_snapshot()),
            ClusterEnvelope::Message {
                sessions,
                envelope,
                reliable,
            } => {
                let shared = Arc::new(envelope);
                for session_id in sessions {
                    if let Some(session) = self.sessions.get(&session_id) {
                        session.enqueue(shared.clone(), reliable);
                    }
                }
                None
            }
            ClusterEnvelope::Hello { .. }
            | ClusterEnvelope::Welcome { .. }
            | ClusterEnvelope::Ping
            | ClusterEnvelope::Pong => None,
        }
    }
}
