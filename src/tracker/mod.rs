//! The presence tracker.
//!
//! Node-local authoritative index of which session is on which stream as
//! which user. All mutations are atomic under a single mutex; events and
//! replication deltas are enqueued in commit order while the lock is held
//! (pure queue pushes, no I/O) and consumed by dedicated tasks outside it.
//!
//! Remote presences applied from peer deltas live in the same indexes and
//! are indistinguishable from local ones in reads.

use std::collections::HashMap;
use std::sync::Arc;

use arena_proto::{
    ClusterEnvelope, Presence, PresenceId, PresenceMeta, PresenceReason, Stream, StreamMode,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::metrics;

/// One batch of presence transitions committed by a single tracker
/// mutation. Events for a given `(session, stream, user)` key reach the
/// dispatcher in commit order.
#[derive(Debug, Clone, Default)]
pub struct TrackerEvent {
    pub joins: Vec<Presence>,
    pub updates: Vec<Presence>,
    pub leaves: Vec<Presence>,
}

impl TrackerEvent {
    fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.updates.is_empty() && self.leaves.is_empty()
    }
}

/// Diff listener invoked by the event dispatcher. Must not block.
pub type Listener = Box<dyn Fn(&TrackerEvent) + Send + Sync>;

/// Per-stream bucket key: one presence of one session-as-user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CompactKey {
    node: String,
    session_id: Uuid,
    user_id: Uuid,
}

impl CompactKey {
    fn of(presence: &Presence) -> Self {
        Self {
            node: presence.id.node.clone(),
            session_id: presence.id.session_id,
            user_id: presence.user_id,
        }
    }
}

#[derive(Default)]
struct Indexes {
    /// Every presence a session holds, keyed by (stream, compact key).
    by_session: HashMap<Uuid, HashMap<(Stream, CompactKey), Arc<Presence>>>,
    /// Two-level stream index for O(1) mode sweeps.
    by_stream_mode: HashMap<StreamMode, HashMap<Stream, HashMap<CompactKey, Arc<Presence>>>>,
    /// Total presences, equal to the sum of all `by_session` bucket sizes.
    count: usize,
}

impl Indexes {
    fn insert(&mut self, presence: Arc<Presence>) {
        let compact = CompactKey::of(&presence);
        self.by_session
            .entry(presence.id.session_id)
            .or_default()
            .insert((presence.stream.clone(), compact.clone()), presence.clone());
        self.by_stream_mode
            .entry(presence.stream.mode)
            .or_default()
            .entry(presence.stream.clone())
            .or_default()
            .insert(compact, presence);
        self.count += 1;
        metrics::PRESENCES_TRACKED.set(self.count as i64);
    }

    /// Remove one presence from both indexes, dropping emptied buckets.
    fn remove(&mut self, session_id: Uuid, stream: &Stream, compact: &CompactKey) -> Option<Arc<Presence>> {
        let bucket = self.by_session.get_mut(&session_id)?;
        let removed = bucket.remove(&(stream.clone(), compact.clone()))?;
        if bucket.is_empty() {
            self.by_session.remove(&session_id);
        }

        if let Some(streams) = self.by_stream_mode.get_mut(&stream.mode) {
            if let Some(stream_bucket) = streams.get_mut(stream) {
                stream_bucket.remove(compact);
                if stream_bucket.is_empty() {
                    streams.remove(stream);
                }
            }
            if streams.is_empty() {
                self.by_stream_mode.remove(&stream.mode);
            }
        }

        self.count -= 1;
        metrics::PRESENCES_TRACKED.set(self.count as i64);
        Some(removed)
    }

    fn get(&self, session_id: Uuid, stream: &Stream, compact: &CompactKey) -> Option<&Arc<Presence>> {
        self.by_session
            .get(&session_id)?
            .get(&(stream.clone(), compact.clone()))
    }
}

/// The cluster-aware presence tracker.
pub struct Tracker {
    node: String,
    inner: Mutex<Indexes>,
    events_tx: mpsc::Sender<TrackerEvent>,
    replica_tx: mpsc::Sender<ClusterEnvelope>,
}

impl Tracker {
    /// Create a tracker. Returns the event stream for the dispatcher task
    /// and the delta stream for the cluster replication pump.
    pub fn new(
        node: impl Into<String>,
        event_queue: usize,
        replica_queue: usize,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<TrackerEvent>,
        mpsc::Receiver<ClusterEnvelope>,
    ) {
        let (events_tx, events_rx) = mpsc::channel(event_queue);
        let (replica_tx, replica_rx) = mpsc::channel(replica_queue);
        (
            Arc::new(Self {
                node: node.into(),
                inner: Mutex::new(Indexes::default()),
                events_tx,
                replica_tx,
            }),
            events_rx,
            replica_rx,
        )
    }

    /// This node's name, the tag on every locally created presence.
    pub fn node(&self) -> &str {
        &self.node
    }

    // ========================================================================
    // Local mutations (replicated to peers)
    // ========================================================================

    /// Track a presence. Idempotent per `(id, stream, user_id)`: re-tracking
    /// is a silent no-op. Returns `(success, first_for_session)`.
    #[allow(clippy::too_many_arguments)]
    pub fn track(
        &self,
        ctx: &CancellationToken,
        session_id: Uuid,
        stream: Stream,
        user_id: Uuid,
        mut meta: PresenceMeta,
        allow_if_first: bool,
    ) -> (bool, bool) {
        if ctx.is_cancelled() {
            return (false, false);
        }
        meta.reason = PresenceReason::Join;
        let presence = Presence {
            id: PresenceId {
                node: self.node.clone(),
                session_id,
            },
            stream,
            user_id,
            meta,
        };
        self.track_inner(presence, allow_if_first, true)
    }

    /// Overwrite a presence's meta. Behaves as a join when the presence is
    /// not yet tracked and tracking would be allowed.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        ctx: &CancellationToken,
        session_id: Uuid,
        stream: Stream,
        user_id: Uuid,
        mut meta: PresenceMeta,
        allow_if_first: bool,
    ) -> bool {
        if ctx.is_cancelled() {
            return false;
        }
        meta.reason = PresenceReason::Update;
        let presence = Presence {
            id: PresenceId {
                node: self.node.clone(),
                session_id,
            },
            stream,
            user_id,
            meta,
        };
        self.update_inner(presence, allow_if_first, true)
    }

    /// Remove exactly one presence. No-op if absent.
    pub fn untrack(&self, session_id: Uuid, stream: Stream, user_id: Uuid) {
        let id = PresenceId {
            node: self.node.clone(),
            session_id,
        };
        self.untrack_inner(id, stream, user_id, true);
    }

    /// Remove one presence that may belong to any node (match kicks reach
    /// across the cluster). The delta replicates to peers, including the
    /// presence's owner.
    pub fn untrack_presence(&self, id: PresenceId, stream: Stream, user_id: Uuid) {
        self.untrack_inner(id, stream, user_id, true);
    }

    /// Remove every presence the session holds, with a caller-supplied
    /// reason (`Leave` or `Disconnect`).
    pub fn untrack_all(&self, session_id: Uuid, reason: PresenceReason) {
        let id = PresenceId {
            node: self.node.clone(),
            session_id,
        };
        self.untrack_all_inner(id, reason, true);
    }

    /// Mass evacuation of a stream. Emits no events.
    pub fn untrack_by_stream(&self, stream: Stream) {
        self.untrack_by_stream_inner(stream, true);
    }

    /// Remove the session's presences whose mode is in `modes`, excepting
    /// `skip_stream`.
    #[allow(dead_code)] // API-surface counterpart of the replicated delta
    pub fn untrack_by_modes(
        &self,
        session_id: Uuid,
        modes: &[StreamMode],
        skip_stream: Option<&Stream>,
    ) {
        let id = PresenceId {
            node: self.node.clone(),
            session_id,
        };
        self.untrack_by_modes_inner(id, modes, skip_stream, true);
    }

    // ========================================================================
    // Remote application (never re-broadcast)
    // ========================================================================

    /// Apply a delta received from a peer under the local lock.
    pub fn apply_remote(&self, delta: ClusterEnvelope) {
        match delta {
            ClusterEnvelope::Track { presence } => {
                if presence.meta.reason == PresenceReason::Update {
                    self.update_inner(presence, true, false);
                } else {
                    self.track_inner(presence, true, false);
                }
            }
            ClusterEnvelope::Untrack {
                id,
                stream,
                user_id,
            } => {
                self.untrack_inner(id, stream, user_id, false);
            }
            ClusterEnvelope::UntrackAll { id, reason } => {
                self.untrack_all_inner(id, reason, false);
            }
            ClusterEnvelope::UntrackByMode {
                id,
                modes,
                skip_stream,
            } => {
                self.untrack_by_modes_inner(id, &modes, skip_stream.as_ref(), false);
            }
            ClusterEnvelope::UntrackByStream { stream } => {
                self.untrack_by_stream_inner(stream, false);
            }
            _ => {}
        }
    }

    /// Merge a peer's full presence snapshot, then remove stale entries
    /// tagged with that node that the snapshot no longer contains. The
    /// sweep emits no events.
    pub fn merge_snapshot(&self, node: &str, presences: Vec<Presence>) {
        let snapshot_keys: std::collections::HashSet<(Uuid, Stream, Uuid)> = presences
            .iter()
            .map(|p| (p.id.session_id, p.stream.clone(), p.user_id))
            .collect();

        for presence in presences {
            if presence.id.node != node {
                continue;
            }
            self.track_inner(presence, true, false);
        }

        let stale: Vec<Arc<Presence>> = {
            let inner = self.inner.lock();
            inner
                .by_session
                .values()
                .flat_map(|bucket| bucket.values())
                .filter(|p| {
                    p.id.node == node
                        && !snapshot_keys.contains(&(
                            p.id.session_id,
                            p.stream.clone(),
                            p.user_id,
                        ))
                })
                .cloned()
                .collect()
        };
        for presence in stale {
            let compact = CompactKey::of(&presence);
            let mut inner = self.inner.lock();
            inner.remove(presence.id.session_id, &presence.stream, &compact);
        }
    }

    /// Discard every presence tagged with a dead node. Emits no events and
    /// replicates nothing; each surviving node runs the same sweep from its
    /// own membership view.
    pub fn evict_node(&self, node: &str) {
        let mut inner = self.inner.lock();
        let doomed: Vec<(Uuid, Stream, CompactKey)> = inner
            .by_session
            .values()
            .flat_map(|bucket| bucket.values())
            .filter(|p| p.id.node == node)
            .map(|p| (p.id.session_id, p.stream.clone(), CompactKey::of(p)))
            .collect();
        for (session_id, stream, compact) in doomed {
            inner.remove(session_id, &stream, &compact);
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn list_by_stream(
        &self,
        stream: &Stream,
        include_hidden: bool,
        local_only: bool,
    ) -> Vec<Presence> {
        let inner = self.inner.lock();
        inner
            .by_stream_mode
            .get(&stream.mode)
            .and_then(|streams| streams.get(stream))
            .map(|bucket| {
                bucket
                    .values()
                    .filter(|p| include_hidden || !p.meta.hidden)
                    .filter(|p| !local_only || p.id.node == self.node)
                    .map(|p| (**p).clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count_by_stream(&self, stream: &Stream, include_hidden: bool) -> usize {
        let inner = self.inner.lock();
        inner
            .by_stream_mode
            .get(&stream.mode)
            .and_then(|streams| streams.get(stream))
            .map(|bucket| {
                bucket
                    .values()
                    .filter(|p| include_hidden || !p.meta.hidden)
                    .count()
            })
            .unwrap_or(0)
    }

    #[allow(dead_code)] // Available to API handlers
    pub fn check_local_by_id_stream_user(
        &self,
        session_id: Uuid,
        stream: &Stream,
        user_id: Uuid,
    ) -> bool {
        self.get_local_by_session_id_stream_user_id(session_id, stream, user_id)
            .is_some()
    }

    pub fn get_local_by_session_id_stream_user_id(
        &self,
        session_id: Uuid,
        stream: &Stream,
        user_id: Uuid,
    ) -> Option<Presence> {
        let compact = CompactKey {
            node: self.node.clone(),
            session_id,
            user_id,
        };
        let inner = self.inner.lock();
        inner
            .get(session_id, stream, &compact)
            .map(|p| (**p).clone())
    }

    /// Every presence created by this node, for the snapshot burst.
    pub fn snapshot_local(&self) -> Vec<Presence> {
        let inner = self.inner.lock();
        inner
            .by_session
            .values()
            .flat_map(|bucket| bucket.values())
            .filter(|p| p.id.node == self.node)
            .map(|p| (**p).clone())
            .collect()
    }

    #[allow(dead_code)] // Available to API handlers
    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn track_inner(&self, presence: Presence, allow_if_first: bool, replicate: bool) -> (bool, bool) {
        let mut inner = self.inner.lock();

        let compact = CompactKey::of(&presence);
        let session_id = presence.id.session_id;
        let first = !inner.by_session.contains_key(&session_id);
        if first && !allow_if_first {
            return (false, false);
        }
        if inner.get(session_id, &presence.stream, &compact).is_some() {
            // Re-track is a silent no-op.
            return (true, false);
        }

        let shared = Arc::new(presence);
        inner.insert(shared.clone());

        if !shared.meta.hidden {
            self.emit(
                &inner,
                TrackerEvent {
                    joins: vec![(*shared).clone()],
                    ..Default::default()
                },
            );
        }
        if replicate {
            self.replicate(
                &inner,
                ClusterEnvelope::Track {
                    presence: (*shared).clone(),
                },
            );
        }
        (true, first)
    }

    fn update_inner(&self, presence: Presence, allow_if_first: bool, replicate: bool) -> bool {
        let mut inner = self.inner.lock();

        let compact = CompactKey::of(&presence);
        let session_id = presence.id.session_id;
        let previous = match inner.get(session_id, &presence.stream, &compact) {
            Some(existing) => existing.clone(),
            None => {
                // Not tracked: behaves as a join when allowed.
                drop(inner);
                let mut join = presence;
                join.meta.reason = PresenceReason::Join;
                return self.track_inner(join, allow_if_first, replicate).0;
            }
        };

        inner.remove(session_id, &presence.stream, &compact);
        let shared = Arc::new(presence);
        inner.insert(shared.clone());

        let event = match (previous.meta.hidden, shared.meta.hidden) {
            (false, false) => TrackerEvent {
                updates: vec![(*shared).clone()],
                ..Default::default()
            },
            (true, false) => TrackerEvent {
                joins: vec![(*shared).clone()],
                ..Default::default()
            },
            (false, true) => {
                let mut gone = (*previous).clone();
                gone.meta.reason = PresenceReason::Update;
                TrackerEvent {
                    leaves: vec![gone],
                    ..Default::default()
                }
            }
            (true, true) => TrackerEvent::default(),
        };
        self.emit(&inner, event);

        if replicate {
            self.replicate(
                &inner,
                ClusterEnvelope::Track {
                    presence: (*shared).clone(),
                },
            );
        }
        true
    }

    fn untrack_inner(&self, id: PresenceId, stream: Stream, user_id: Uuid, replicate: bool) {
        let compact = CompactKey {
            node: id.node.clone(),
            session_id: id.session_id,
            user_id,
        };
        let mut inner = self.inner.lock();
        let Some(removed) = inner.remove(id.session_id, &stream, &compact) else {
            return;
        };

        if !removed.meta.hidden {
            let mut gone = (*removed).clone();
            gone.meta.reason = PresenceReason::Leave;
            self.emit(
                &inner,
                TrackerEvent {
                    leaves: vec![gone],
                    ..Default::default()
                },
            );
        }
        if replicate {
            self.replicate(
                &inner,
                ClusterEnvelope::Untrack {
                    id,
                    stream,
                    user_id,
                },
            );
        }
    }

    fn untrack_all_inner(&self, id: PresenceId, reason: PresenceReason, replicate: bool) {
        let mut inner = self.inner.lock();
        let Some(bucket) = inner.by_session.get(&id.session_id) else {
            return;
        };
        let entries: Vec<(Stream, CompactKey)> = bucket
            .keys()
            .filter(|(_, compact)| compact.node == id.node)
            .cloned()
            .collect();

        let mut leaves = Vec::new();
        for (stream, compact) in entries {
            if let Some(removed) = inner.remove(id.session_id, &stream, &compact) {
                if !removed.meta.hidden {
                    let mut gone = (*removed).clone();
                    gone.meta.reason = reason;
                    leaves.push(gone);
                }
            }
        }

        self.emit(
            &inner,
            TrackerEvent {
                leaves,
                ..Default::default()
            },
        );
        if replicate {
            self.replicate(&inner, ClusterEnvelope::UntrackAll { id, reason });
        }
    }

    fn untrack_by_stream_inner(&self, stream: Stream, replicate: bool) {
        let mut inner = self.inner.lock();
        let doomed: Vec<(Uuid, CompactKey)> = inner
            .by_stream_mode
            .get(&stream.mode)
            .and_then(|streams| streams.get(&stream))
            .map(|bucket| {
                bucket
                    .values()
                    .map(|p| (p.id.session_id, CompactKey::of(p)))
                    .collect()
            })
            .unwrap_or_default();

        for (session_id, compact) in doomed {
            inner.remove(session_id, &stream, &compact);
        }
        // Mass evacuation is silent regardless of stream size.
        if replicate {
            self.replicate(&inner, ClusterEnvelope::UntrackByStream { stream });
        }
    }

    fn untrack_by_modes_inner(
        &self,
        id: PresenceId,
        modes: &[StreamMode],
        skip_stream: Option<&Stream>,
        replicate: bool,
    ) {
        let mut inner = self.inner.lock();
        let Some(bucket) = inner.by_session.get(&id.session_id) else {
            return;
        };
        let entries: Vec<(Stream, CompactKey)> = bucket
            .keys()
            .filter(|(stream, compact)| {
                compact.node == id.node
                    && modes.contains(&stream.mode)
                    && Some(stream) != skip_stream
            })
            .cloned()
            .collect();

        let mut leaves = Vec::new();
        for (stream, compact) in entries {
            if let Some(removed) = inner.remove(id.session_id, &stream, &compact) {
                if !removed.meta.hidden {
                    let mut gone = (*removed).clone();
                    gone.meta.reason = PresenceReason::Leave;
                    leaves.push(gone);
                }
            }
        }

        self.emit(
            &inner,
            TrackerEvent {
                leaves,
                ..Default::default()
            },
        );
        if replicate {
            self.replicate(
                &inner,
                ClusterEnvelope::UntrackByMode {
                    id,
                    modes: modes.to_vec(),
                    skip_stream: skip_stream.cloned(),
                },
            );
        }
    }

    /// Enqueue an event while the lock is held so commit order and queue
    /// order agree. A full queue drops the event with a counter bump.
    fn emit(&self, _guard: &Indexes, event: TrackerEvent) {
        if event.is_empty() {
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(_)) = self.events_tx.try_send(event) {
            metrics::PRESENCE_EVENTS_DROPPED.inc();
        }
    }

    fn replicate(&self, _guard: &Indexes, delta: ClusterEnvelope) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.replica_tx.try_send(delta) {
            metrics::CLUSTER_DELTAS_DROPPED.inc();
        }
    }

    /// Verify the §3 invariants. Test support.
    #[cfg(test)]
    pub fn assert_consistent(&self) {
        let inner = self.inner.lock();

        let mut session_total = 0;
        for (session_id, bucket) in &inner.by_session {
            assert!(!bucket.is_empty(), "empty by_session bucket retained");
            session_total += bucket.len();
            for ((stream, compact), presence) in bucket {
                assert_eq!(*session_id, presence.id.session_id);
                let mirrored = inner
                    .by_stream_mode
                    .get(&stream.mode)
                    .and_then(|streams| streams.get(stream))
                    .and_then(|b| b.get(compact))
                    .expect("presence missing from by_stream_mode");
                assert!(
                    Arc::ptr_eq(presence, mirrored),
                    "indexes hold different Presence values"
                );
            }
        }

        let mut stream_total = 0;
        for (mode, streams) in &inner.by_stream_mode {
            assert!(!streams.is_empty(), "empty mode bucket retained");
            for (stream, bucket) in streams {
                assert_eq!(*mode, stream.mode);
                assert!(!bucket.is_empty(), "empty stream bucket retained");
                stream_total += bucket.len();
            }
        }

        assert_eq!(session_total, inner.count, "count diverged from by_session");
        assert_eq!(stream_total, inner.count, "count diverged from by_stream_mode");
    }
}

/// Run the event dispatcher: a single task draining the tracker event queue
/// and invoking every registered diff listener in order.
pub fn run_event_dispatcher(
    mut events_rx: mpsc::Receiver<TrackerEvent>,
    listeners: Vec<Listener>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            for listener in &listeners {
                listener(&event);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_proto::SessionFormat;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn meta(username: &str) -> PresenceMeta {
        PresenceMeta::new(SessionFormat::Json, username)
    }

    fn hidden_meta(username: &str) -> PresenceMeta {
        let mut m = meta(username);
        m.hidden = true;
        m
    }

    fn tracker() -> (Arc<Tracker>, mpsc::Receiver<TrackerEvent>) {
        let (tracker, events, _replica) = Tracker::new("n1", 256, 256);
        (tracker, events)
    }

    fn drain(rx: &mut mpsc::Receiver<TrackerEvent>) -> Vec<TrackerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn track_emits_one_join_and_retrack_is_silent() {
        let (tracker, mut rx) = tracker();
        let ctx = CancellationToken::new();
        let session = Uuid::new_v4();
        let user = Uuid::new_v4();
        let stream = Stream::chat_room("lobby");

        let (ok, first) = tracker.track(&ctx, session, stream.clone(), user, meta("ada"), true);
        assert!(ok);
        assert!(first);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].joins.len(), 1);
        assert_eq!(events[0].joins[0].meta.reason, PresenceReason::Join);

        // Re-track: no-op, no event, not first.
        let (ok, first) = tracker.track(&ctx, session, stream, user, meta("ada"), true);
        assert!(ok);
        assert!(!first);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(tracker.count(), 1);
        tracker.assert_consistent();
    }

    #[test]
    fn first_track_requires_allowance() {
        let (tracker, mut rx) = tracker();
        let ctx = CancellationToken::new();
        let session = Uuid::new_v4();
        let stream = Stream::chat_room("lobby");

        let (ok, _) = tracker.track(&ctx, session, stream.clone(), Uuid::new_v4(), meta("ada"), false);
        assert!(!ok);
        assert!(drain(&mut rx).is_empty());

        // Once the session holds a presence, further tracks need no allowance.
        let user = Uuid::new_v4();
        let (ok, first) = tracker.track(&ctx, session, Stream::status(user), user, meta("ada"), true);
        assert!(ok && first);
        let (ok, first) = tracker.track(&ctx, session, stream, user, meta("ada"), false);
        assert!(ok && !first);
        tracker.assert_consistent();
    }

    #[test]
    fn cancelled_context_rejects_track_and_update() {
        let (tracker, _rx) = tracker();
        let ctx = CancellationToken::new();
        ctx.cancel();
        let session = Uuid::new_v4();
        let (ok, first) = tracker.track(
            &ctx,
            session,
            Stream::chat_room("lobby"),
            Uuid::new_v4(),
            meta("ada"),
            true,
        );
        assert!(!ok && !first);
        assert!(!tracker.update(
            &ctx,
            session,
            Stream::chat_room("lobby"),
            Uuid::new_v4(),
            meta("ada"),
            true,
        ));
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn untrack_emits_one_leave() {
        let (tracker, mut rx) = tracker();
        let ctx = CancellationToken::new();
        let session = Uuid::new_v4();
        let user = Uuid::new_v4();
        let stream = Stream::chat_room("lobby");

        tracker.track(&ctx, session, stream.clone(), user, meta("ada"), true);
        drain(&mut rx);

        tracker.untrack(session, stream.clone(), user);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].leaves.len(), 1);
        assert_eq!(events[0].leaves[0].meta.reason, PresenceReason::Leave);

        // Absent untrack is a no-op.
        tracker.untrack(session, stream, user);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(tracker.count(), 0);
        tracker.assert_consistent();
    }

    #[test]
    fn hidden_presences_are_silent() {
        let (tracker, mut rx) = tracker();
        let ctx = CancellationToken::new();
        let session = Uuid::new_v4();
        let user = Uuid::new_v4();
        let stream = Stream::chat_room("lobby");

        tracker.track(&ctx, session, stream.clone(), user, hidden_meta("ada"), true);
        tracker.untrack(session, stream.clone(), user);
        assert!(drain(&mut rx).is_empty());

        // Hidden presences still appear in include_hidden reads.
        tracker.track(&ctx, session, stream.clone(), user, hidden_meta("ada"), true);
        assert_eq!(tracker.list_by_stream(&stream, false, false).len(), 0);
        assert_eq!(tracker.list_by_stream(&stream, true, false).len(), 1);
    }

    #[test]
    fn update_emits_one_event_per_transition() {
        let (tracker, mut rx) = tracker();
        let ctx = CancellationToken::new();
        let session = Uuid::new_v4();
        let user = Uuid::new_v4();
        let stream = Stream::chat_room("lobby");

        tracker.track(&ctx, session, stream.clone(), user, meta("ada"), true);
        drain(&mut rx);

        // visible -> visible: one update.
        let mut m = meta("ada");
        m.status = "afk".to_string();
        assert!(tracker.update(&ctx, session, stream.clone(), user, m, true));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].updates.len(), 1);
        assert_eq!(events[0].updates[0].meta.status, "afk");

        // visible -> hidden: one leave.
        tracker.update(&ctx, session, stream.clone(), user, hidden_meta("ada"), true);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].leaves.len(), 1);

        // hidden -> visible: one join.
        tracker.update(&ctx, session, stream.clone(), user, meta("ada"), true);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].joins.len(), 1);
        tracker.assert_consistent();
    }

    #[test]
    fn update_on_untracked_behaves_as_join() {
        let (tracker, mut rx) = tracker();
        let ctx = CancellationToken::new();
        let session = Uuid::new_v4();
        let user = Uuid::new_v4();
        let stream = Stream::status(user);

        assert!(tracker.update(&ctx, session, stream.clone(), user, meta("ada"), true));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].joins.len(), 1);
        assert_eq!(events[0].joins[0].meta.reason, PresenceReason::Join);

        // Not allowed and first: rejected.
        let other = Uuid::new_v4();
        assert!(!tracker.update(&ctx, other, stream, user, meta("ada"), false));
    }

    #[test]
    fn untrack_all_emits_leaves_with_caller_reason() {
        let (tracker, mut rx) = tracker();
        let ctx = CancellationToken::new();
        let session = Uuid::new_v4();
        let user = Uuid::new_v4();

        tracker.track(&ctx, session, Stream::status(user), user, meta("ada"), true);
        tracker.track(&ctx, session, Stream::chat_room("lobby"), user, meta("ada"), true);
        drain(&mut rx);

        tracker.untrack_all(session, PresenceReason::Disconnect);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].leaves.len(), 2);
        assert!(
            events[0]
                .leaves
                .iter()
                .all(|p| p.meta.reason == PresenceReason::Disconnect)
        );
        assert_eq!(tracker.count(), 0);
        tracker.assert_consistent();
    }

    #[test]
    fn untrack_by_stream_is_silent_regardless_of_size() {
        let (tracker, mut rx) = tracker();
        let ctx = CancellationToken::new();
        let stream = Stream::chat_room("lobby");

        for _ in 0..10 {
            let user = Uuid::new_v4();
            tracker.track(&ctx, Uuid::new_v4(), stream.clone(), user, meta("u"), true);
        }
        drain(&mut rx);

        tracker.untrack_by_stream(stream.clone());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(tracker.count_by_stream(&stream, true), 0);
        assert_eq!(tracker.count(), 0);
        tracker.assert_consistent();
    }

    #[test]
    fn untrack_by_modes_respects_skip_stream() {
        let (tracker, mut rx) = tracker();
        let ctx = CancellationToken::new();
        let session = Uuid::new_v4();
        let user = Uuid::new_v4();
        let keep = Stream::chat_room("keep");
        let drop_stream = Stream::chat_room("drop");

        tracker.track(&ctx, session, Stream::status(user), user, meta("ada"), true);
        tracker.track(&ctx, session, keep.clone(), user, meta("ada"), true);
        tracker.track(&ctx, session, drop_stream.clone(), user, meta("ada"), true);
        drain(&mut rx);

        tracker.untrack_by_modes(session, &[StreamMode::ChatRoom], Some(&keep));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].leaves.len(), 1);
        assert_eq!(events[0].leaves[0].stream, drop_stream);
        assert!(tracker.check_local_by_id_stream_user(session, &keep, user));
        tracker.assert_consistent();
    }

    #[test]
    fn per_key_events_arrive_in_commit_order() {
        let (tracker, mut rx) = tracker();
        let ctx = CancellationToken::new();
        let session = Uuid::new_v4();
        let user = Uuid::new_v4();
        let stream = Stream::chat_room("lobby");

        tracker.track(&ctx, session, stream.clone(), user, meta("ada"), true);
        let mut m = meta("ada");
        m.status = "busy".to_string();
        tracker.update(&ctx, session, stream.clone(), user, m, true);
        tracker.untrack(session, stream, user);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].joins.len(), 1);
        assert_eq!(events[1].updates.len(), 1);
        assert_eq!(events[2].leaves.len(), 1);
    }

    #[test]
    fn remote_deltas_apply_without_rebroadcast() {
        let (n1, _e1, mut r1) = Tracker::new("n1", 256, 256);
        let (n2, _e2, _r2) = Tracker::new("n2", 256, 256);
        let ctx = CancellationToken::new();
        let session = Uuid::new_v4();
        let user = Uuid::new_v4();
        let stream = Stream::chat_room("lobby");

        n1.track(&ctx, session, stream.clone(), user, meta("ada"), true);
        let delta = r1.try_recv().expect("delta for local track");
        n2.apply_remote(delta);

        let listed = n2.list_by_stream(&stream, false, false);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id.node, "n1");
        // Remote presences are excluded from local-only reads.
        assert!(n2.list_by_stream(&stream, false, true).is_empty());
        n2.assert_consistent();
    }

    #[test]
    fn snapshot_merge_and_reconcile() {
        let (n1, _e1, _r1) = Tracker::new("n1", 256, 256);
        let (n2, _e2, _r2) = Tracker::new("n2", 256, 256);
        let ctx = CancellationToken::new();
        let stream = Stream::chat_room("lobby");

        let session_a = Uuid::new_v4();
        let user_a = Uuid::new_v4();
        n1.track(&ctx, session_a, stream.clone(), user_a, meta("ada"), true);

        // n2 holds a stale n1-tagged presence that the snapshot lacks.
        let stale = Presence {
            id: PresenceId {
                node: "n1".to_string(),
                session_id: Uuid::new_v4(),
            },
            stream: stream.clone(),
            user_id: Uuid::new_v4(),
            meta: meta("ghost"),
        };
        n2.apply_remote(ClusterEnvelope::Track { presence: stale });

        n2.merge_snapshot("n1", n1.snapshot_local());
        let listed = n2.list_by_stream(&stream, false, false);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].user_id, user_a);
        n2.assert_consistent();
    }

    #[test]
    fn evict_node_sweeps_silently() {
        let (n2, mut events, _r) = Tracker::new("n2", 256, 256);
        let ctx = CancellationToken::new();
        let stream = Stream::chat_room("lobby");

        // One local, one remote presence.
        let local_user = Uuid::new_v4();
        n2.track(&ctx, Uuid::new_v4(), stream.clone(), local_user, meta("bob"), true);
        n2.apply_remote(ClusterEnvelope::Track {
            presence: Presence {
                id: PresenceId {
                    node: "n1".to_string(),
                    session_id: Uuid::new_v4(),
                },
                stream: stream.clone(),
                user_id: Uuid::new_v4(),
                meta: meta("ada"),
            },
        });
        drain(&mut events);

        n2.evict_node("n1");
        assert!(drain(&mut events).is_empty());
        let listed = n2.list_by_stream(&stream, false, false);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].user_id, local_user);
        n2.assert_consistent();
    }

    #[test]
    fn invariants_hold_under_random_op_sequences() {
        let (tracker, mut rx, _r) = Tracker::new("n1", 4096, 4096);
        let ctx = CancellationToken::new();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        let sessions: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();
        let users: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();
        let streams: Vec<Stream> = vec![
            Stream::chat_room("a"),
            Stream::chat_room("b"),
            Stream::status(users[0]),
            Stream::party(Uuid::new_v4()),
        ];

        for _ in 0..2000 {
            let session = sessions[rng.gen_range(0..sessions.len())];
            let user = users[rng.gen_range(0..users.len())];
            let stream = streams[rng.gen_range(0..streams.len())].clone();
            let mut m = meta("u");
            m.hidden = rng.gen_bool(0.2);

            match rng.gen_range(0..6) {
                0 | 1 => {
                    tracker.track(&ctx, session, stream, user, m, rng.gen_bool(0.9));
                }
                2 => {
                    tracker.update(&ctx, session, stream, user, m, rng.gen_bool(0.5));
                }
                3 => tracker.untrack(session, stream, user),
                4 => tracker.untrack_all(session, PresenceReason::Leave),
                _ => tracker.untrack_by_stream(stream),
            }
            drain(&mut rx);
        }
        tracker.assert_consistent();
    }
}
