//! The match registry: owns the set of matches on this node.
//!
//! Authoritative matches run a core on a dedicated actor task; relayed
//! matches are registry entries only, their data is a plain fan-out through
//! the router.

pub mod actor;
pub mod core;

use std::collections::HashMap;
use std::sync::Arc;

use arena_proto::{Envelope, Payload, Presence, Stream, StreamMode};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use self::actor::{ActorDeps, MatchControl};
use self::core::{JoinDecision, MatchMessage};
use crate::error::MatchError;
use crate::metrics;
use crate::router::Router;
use crate::runtime::ExtensionRuntime;
use crate::tracker::{Tracker, TrackerEvent};

const CTRL_QUEUE: usize = 64;

/// One live match on this node.
#[derive(Debug)]
pub struct MatchHandle {
    pub match_id: Uuid,
    pub stream: Stream,
    pub tick_rate: u32,
    pub label: Arc<RwLock<String>>,
    /// `None` for relayed matches, which have no core and no tick loop.
    channels: Option<MatchChannels>,
}

#[derive(Debug)]
struct MatchChannels {
    data_tx: mpsc::Sender<MatchMessage>,
    ctrl_tx: mpsc::Sender<MatchControl>,
}

impl MatchHandle {
    pub fn authoritative(&self) -> bool {
        self.channels.is_some()
    }
}

/// Summary row for match listing.
#[derive(Debug, Clone)]
#[allow(dead_code)] // Consumed by the listing surface
pub struct MatchInfo {
    pub match_id: Uuid,
    pub authoritative: bool,
    pub label: String,
    pub size: usize,
}

pub struct MatchRegistry {
    matches: Arc<DashMap<Uuid, Arc<MatchHandle>>>,
    tracker: Arc<Tracker>,
    router: Arc<Router>,
    runtime: Arc<ExtensionRuntime>,
    inbound_scale: usize,
    shutdown: CancellationToken,
}

impl MatchRegistry {
    pub fn new(
        tracker: Arc<Tracker>,
        router: Arc<Router>,
        runtime: Arc<ExtensionRuntime>,
        inbound_scale: usize,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            matches: Arc::new(DashMap::new()),
            tracker,
            router,
            runtime,
            inbound_scale,
            shutdown,
        })
    }

    /// Create an authoritative match through the provider chain. A failed
    /// `match_init` never enters the registry.
    pub async fn create_authoritative(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> Result<Arc<MatchHandle>, MatchError> {
        let core = self
            .runtime
            .create_match(name)
            .ok_or_else(|| MatchError::UnknownName(name.to_string()))?;

        let match_id = Uuid::new_v4();
        let label = Arc::new(RwLock::new(String::new()));
        let (ctrl_tx, ctrl_rx) = mpsc::channel(CTRL_QUEUE);

        let init_rx = actor::spawn(
            match_id,
            core,
            params,
            self.inbound_scale,
            ctrl_rx,
            ActorDeps {
                tracker: self.tracker.clone(),
                router: self.router.clone(),
                matches: self.matches.clone(),
                label: label.clone(),
                shutdown: self.shutdown.clone(),
            },
        );

        let (setup, data_tx) = init_rx
            .await
            .map_err(|_| MatchError::InitFailed("match task died before init".to_string()))??;

        let handle = Arc::new(MatchHandle {
            match_id,
            stream: Stream::match_stream(match_id, true),
            tick_rate: setup.tick_rate,
            label,
            channels: Some(MatchChannels { data_tx, ctrl_tx }),
        });
        self.matches.insert(match_id, handle.clone());
        metrics::MATCHES_ACTIVE.set(self.matches.len() as i64);
        Ok(handle)
    }

    /// Create a relayed match: a pure fan-out domain with no core.
    pub fn create_relayed(&self) -> Arc<MatchHandle> {
        let match_id = Uuid::new_v4();
        let handle = Arc::new(MatchHandle {
            match_id,
            stream: Stream::match_stream(match_id, false),
            tick_rate: 0,
            label: Arc::new(RwLock::new(String::new())),
            channels: None,
        });
        self.matches.insert(match_id, handle.clone());
        metrics::MATCHES_ACTIVE.set(self.matches.len() as i64);
        handle
    }

    pub fn get(&self, match_id: &Uuid) -> Option<Arc<MatchHandle>> {
        self.matches.get(match_id).map(|h| h.clone())
    }

    #[allow(dead_code)] // Available to the console surface
    pub fn count(&self) -> usize {
        self.matches.len()
    }

    /// Node-local listing with live presence counts.
    #[allow(dead_code)] // Consumed by the listing surface
    pub fn list(&self) -> Vec<MatchInfo> {
        self.matches
            .iter()
            .map(|entry| MatchInfo {
                match_id: entry.match_id,
                authoritative: entry.authoritative(),
                label: entry.label.read().clone(),
                size: self.tracker.count_by_stream(&entry.stream, true),
            })
            .collect()
    }

    /// Ask the core to admit a presence. Relayed matches admit everyone.
    pub async fn join_attempt(
        &self,
        handle: &MatchHandle,
        presence: Presence,
        metadata: HashMap<String, String>,
    ) -> Result<JoinDecision, MatchError> {
        let Some(channels) = &handle.channels else {
            return Ok(JoinDecision::accept());
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        channels
            .ctrl_tx
            .send(MatchControl::JoinAttempt {
                presence,
                metadata,
                reply: reply_tx,
            })
            .await
            .map_err(|_| MatchError::NotFound)?;
        reply_rx.await.map_err(|_| MatchError::NotFound)
    }

    /// Hand a data message to a match. Authoritative matches enqueue on the
    /// bounded inbound queue (overflow drops with a counter); relayed
    /// matches fan out immediately.
    pub fn send_data(
        &self,
        handle: &MatchHandle,
        message: MatchMessage,
        presence_filter: Vec<arena_proto::PresenceId>,
        reliable: bool,
    ) {
        match &handle.channels {
            Some(channels) => {
                if let Err(mpsc::error::TrySendError::Full(_)) =
                    channels.data_tx.try_send(message)
                {
                    metrics::MATCH_INBOUND_DROPPED.inc();
                }
            }
            None => {
                let sender_id = message.sender.id.clone();
                let envelope = Envelope::push(Payload::MatchData {
                    match_id: handle.match_id,
                    presence: Some(message.sender),
                    op_code: message.op_code,
                    data: message.data,
                });
                let recipients: Vec<arena_proto::PresenceId> = if presence_filter.is_empty() {
                    // Relayed data fans out to everyone but the sender.
                    self.tracker
                        .list_by_stream(&handle.stream, false, false)
                        .into_iter()
                        .map(|p| p.id)
                        .filter(|id| *id != sender_id)
                        .collect()
                } else {
                    presence_filter
                };
                self.router
                    .send_to_presence_ids(&recipients, envelope, reliable);
            }
        }
    }

    /// Request termination; the core's `match_terminate` runs at the next
    /// tick boundary.
    pub async fn terminate(&self, match_id: &Uuid, grace_seconds: u64) -> bool {
        let Some(handle) = self.get(match_id) else {
            return false;
        };
        match &handle.channels {
            Some(channels) => channels
                .ctrl_tx
                .send(MatchControl::Terminate { grace_seconds })
                .await
                .is_ok(),
            None => {
                // Relayed matches have no core; drop the registry entry and
                // evacuate the stream.
                self.matches.remove(match_id);
                metrics::MATCHES_ACTIVE.set(self.matches.len() as i64);
                self.tracker.untrack_by_stream(handle.stream.clone());
                true
            }
        }
    }

    /// Feed authoritative-match presence transitions from the tracker's
    /// diff listener into the owning actor. Must not block.
    pub fn handle_presence_event(&self, event: &TrackerEvent) {
        let mut joins: HashMap<Uuid, Vec<Presence>> = HashMap::new();
        let mut leaves: HashMap<Uuid, Vec<Presence>> = HashMap::new();

        for presence in &event.joins {
            if presence.stream.mode == StreamMode::MatchAuthoritative {
                joins
                    .entry(presence.stream.subject)
                    .or_default()
                    .push(presence.clone());
            }
        }
        for presence in &event.leaves {
            if presence.stream.mode == StreamMode::MatchAuthoritative {
                leaves
                    .entry(presence.stream.subject)
                    .or_default()
                    .push(presence.clone());
            }
        }

        for (match_id, presences) in joins {
            self.forward_ctrl(&match_id, MatchControl::Join(presences));
        }
        for (match_id, presences) in leaves {
            self.forward_ctrl(&match_id, MatchControl::Leave(presences));
        }
    }

    fn forward_ctrl(&self, match_id: &Uuid, ctrl: MatchControl) {
        let Some(handle) = self.get(match_id) else {
            debug!(match_id = %match_id, "Presence event for unknown match");
            return;
        };
        if let Some(channels) = &handle.channels {
            if channels.ctrl_tx.try_send(ctrl).is_err() {
                debug!(match_id = %match_id, "Match control queue full, dropping presence batch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{BuiltinProvider, ExtensionRuntime, RuntimeProvider};
    use arena_proto::{PresenceId, PresenceMeta, SessionFormat};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn registry() -> (Arc<MatchRegistry>, Arc<Tracker>) {
        let (tracker, _events, _replica) = Tracker::new("n1", 256, 256);
        let sessions = crate::session::SessionRegistry::new();
        let cluster = crate::cluster::ClusterManager::new("n1", 64, CancellationToken::new());
        let router = Router::new(tracker.clone(), sessions, cluster);
        let providers: Vec<Box<dyn RuntimeProvider>> = vec![Box::new(BuiltinProvider::new("n1"))];
        let runtime = ExtensionRuntime::build(&providers).unwrap();
        (
            MatchRegistry::new(
                tracker.clone(),
                router,
                runtime,
                256,
                CancellationToken::new(),
            ),
            tracker,
        )
    }

    fn presence(stream: Stream) -> Presence {
        Presence {
            id: PresenceId {
                node: "n1".to_string(),
                session_id: Uuid::new_v4(),
            },
            stream,
            user_id: Uuid::new_v4(),
            meta: PresenceMeta::new(SessionFormat::Json, "ada"),
        }
    }

    #[tokio::test]
    async fn authoritative_lifecycle_through_registry() {
        let (registry, _tracker) = registry();
        let handle = registry
            .create_authoritative("echo", serde_json::json!({"tick_rate": 30, "label": "unit"}))
            .await
            .unwrap();
        assert!(handle.authoritative());
        assert_eq!(handle.tick_rate, 30);
        assert_eq!(handle.label.read().as_str(), "unit");
        assert_eq!(registry.count(), 1);

        let infos = registry.list();
        assert_eq!(infos.len(), 1);
        assert!(infos[0].authoritative);
        assert_eq!(infos[0].label, "unit");
        assert_eq!(infos[0].match_id, handle.match_id);
        assert_eq!(infos[0].size, 0);

        let decision = registry
            .join_attempt(
                &handle,
                presence(handle.stream.clone()),
                HashMap::new(),
            )
            .await
            .unwrap();
        assert!(decision.allow);

        assert!(registry.terminate(&handle.match_id, 0).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(registry.get(&handle.match_id).is_none());
    }

    #[tokio::test]
    async fn inbound_overflow_bumps_the_drop_counter() {
        let (tracker, _events, _replica) = Tracker::new("n1", 256, 256);
        let sessions = crate::session::SessionRegistry::new();
        let cluster = crate::cluster::ClusterManager::new("n1", 64, CancellationToken::new());
        let router = Router::new(tracker.clone(), sessions, cluster);
        let providers: Vec<Box<dyn RuntimeProvider>> = vec![Box::new(BuiltinProvider::new("n1"))];
        let runtime = ExtensionRuntime::build(&providers).unwrap();
        // Scale 1 at tick rate 1 gives a single-slot inbound queue.
        let registry = MatchRegistry::new(tracker, router, runtime, 1, CancellationToken::new());

        let handle = registry
            .create_authoritative("echo", serde_json::json!({"tick_rate": 1}))
            .await
            .unwrap();

        let before = crate::metrics::MATCH_INBOUND_DROPPED.get();
        let sender = presence(handle.stream.clone());
        for op_code in 0..5 {
            registry.send_data(
                &handle,
                crate::matches::core::MatchMessage {
                    sender: sender.clone(),
                    op_code,
                    data: Vec::new(),
                    receive_time_ms: 0,
                },
                Vec::new(),
                true,
            );
        }
        let dropped = crate::metrics::MATCH_INBOUND_DROPPED.get() - before;
        assert!(dropped >= 2, "expected at least 2 drops, saw {dropped}");
    }

    #[tokio::test]
    async fn unknown_name_never_registers() {
        let (registry, _tracker) = registry();
        let err = registry
            .create_authoritative("no-such-core", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, MatchError::UnknownName(_)));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn relayed_match_registers_without_core() {
        let (registry, _tracker) = registry();
        let handle = registry.create_relayed();
        assert!(!handle.authoritative());

        // Relayed join attempts always admit.
        let decision = registry
            .join_attempt(&handle, presence(handle.stream.clone()), HashMap::new())
            .await
            .unwrap();
        assert!(decision.allow);

        assert!(registry.terminate(&handle.match_id, 0).await);
        assert!(registry.get(&handle.match_id).is_none());
    }
}
