//! Message router.
//!
//! Delivers an envelope to the set of recipients implied by a stream (or an
//! explicit presence list): local recipients are enqueued on their
//! sessions' outbound queues, remote recipients are grouped by node and
//! handed to the cluster transport. Delivery is at-most-once with no retry;
//! failures show up as absence of delivery, never as client-visible errors.

use std::collections::HashMap;
use std::sync::Arc;

use arena_proto::{ClusterEnvelope, Envelope, PresenceId, Stream};
use tracing::debug;
use uuid::Uuid;

use crate::cluster::ClusterManager;
use crate::metrics;
use crate::session::SessionRegistry;
use crate::tracker::Tracker;

/// A deferred send accumulated by a match core's dispatcher, flushed at the
/// end of the tick.
#[derive(Debug, Clone)]
pub struct DeferredMessage {
    pub stream: Stream,
    pub envelope: Envelope,
    pub reliable: bool,
    /// Explicit recipients; `None` fans out to the whole stream.
    pub presence_filter: Option<Vec<PresenceId>>,
}

pub struct Router {
    node: String,
    tracker: Arc<Tracker>,
    sessions: Arc<SessionRegistry>,
    cluster: Arc<ClusterManager>,
}

impl Router {
    pub fn new(
        tracker: Arc<Tracker>,
        sessions: Arc<SessionRegistry>,
        cluster: Arc<ClusterManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node: tracker.node().to_string(),
            tracker,
            sessions,
            cluster,
        })
    }

    /// Fan an envelope out to every visible presence on the stream.
    pub fn send_to_stream(&self, stream: &Stream, envelope: Envelope, reliable: bool) {
        let recipients: Vec<PresenceId> = self
            .tracker
            .list_by_stream(stream, false, false)
            .into_iter()
            .map(|p| p.id)
            .collect();
        self.deliver(&recipients, envelope, reliable);
    }

    /// Send to an explicit set of presences.
    pub fn send_to_presence_ids(&self, ids: &[PresenceId], envelope: Envelope, reliable: bool) {
        self.deliver(ids, envelope, reliable);
    }

    /// Match-origin send; identical semantics, tagged for metrics.
    pub fn send_deferred(&self, message: DeferredMessage) {
        match message.presence_filter {
            Some(ids) => self.send_to_presence_ids(&ids, message.envelope, message.reliable),
            None => self.send_to_stream(&message.stream, message.envelope, message.reliable),
        }
    }

    fn deliver(&self, recipients: &[PresenceId], envelope: Envelope, reliable: bool) {
        if recipients.is_empty() {
            return;
        }

        let mut remote: HashMap<&str, Vec<Uuid>> = HashMap::new();
        let shared = Arc::new(envelope);

        for id in recipients {
            if id.node == self.node {
                match self.sessions.get(&id.session_id) {
                    Some(session) => {
                        session.enqueue(shared.clone(), reliable);
                    }
                    None => {
                        debug!(session = %id.session_id, "Recipient session gone, dropping");
                    }
                }
            } else {
                remote.entry(id.node.as_str()).or_default().push(id.session_id);
            }
        }

        for (node, sessions) in remote {
            metrics::MESSAGES_ROUTED_REMOTE.inc();
            self.cluster.send(
                node,
                ClusterEnvelope::Message {
                    sessions,
                    envelope: (*shared).clone(),
                    reliable,
                },
            );
        }
    }
}
