//! The Nexus - composition root wiring the realtime services together.
//!
//! Session, tracker, and router reference each other only through the
//! interfaces each exposes; ownership lives here, not between peers. The
//! tracker's diff listeners registered here are the single place presence
//! transitions fan out to wire events, match actors, and party state.

use std::collections::HashMap;
use std::sync::Arc;

use arena_proto::{Envelope, Payload, Presence, Stream, StreamMode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cluster::{ClusterManager, InboundHandler};
use crate::config::{Config, LimitsConfig};
use crate::db::Database;
use crate::matches::MatchRegistry;
use crate::matchmaker::Matchmaker;
use crate::matchmaker::party::PartyRegistry;
use crate::router::Router;
use crate::runtime::{ExtensionRuntime, RuntimeProvider};
use crate::scheduler::Scheduler;
use crate::session::SessionRegistry;
use crate::tracker::{self, Tracker, TrackerEvent};

/// Central shared state container.
pub struct Nexus {
    pub node: String,
    pub limits: LimitsConfig,
    pub tracker: Arc<Tracker>,
    pub sessions: Arc<SessionRegistry>,
    pub cluster: Arc<ClusterManager>,
    pub router: Arc<Router>,
    pub runtime: Arc<ExtensionRuntime>,
    pub matches: Arc<MatchRegistry>,
    pub matchmaker: Arc<Matchmaker>,
    pub parties: Arc<PartyRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub db: Option<Database>,
    pub shutdown: CancellationToken,
}

/// Receivers produced at construction, consumed by [`Nexus::start`].
pub struct NexusChannels {
    events_rx: mpsc::Receiver<TrackerEvent>,
    replica_rx: mpsc::Receiver<arena_proto::ClusterEnvelope>,
}

impl Nexus {
    pub fn new(
        config: &Config,
        db: Option<Database>,
        providers: Vec<Box<dyn RuntimeProvider>>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<(Arc<Self>, NexusChannels)> {
        let node = config.server.name.clone();
        let limits = config.limits.clone();

        let (tracker, events_rx, replica_rx) = Tracker::new(
            node.clone(),
            limits.tracker_event_queue,
            limits.peer_outbound_queue,
        );
        let sessions = SessionRegistry::new();
        let cluster =
            ClusterManager::new(node.clone(), limits.peer_outbound_queue, shutdown.clone());
        let router = Router::new(tracker.clone(), sessions.clone(), cluster.clone());

        let runtime = ExtensionRuntime::build(&providers)
            .map_err(|e| anyhow::anyhow!("runtime registration failed: {e}"))?;

        let matches = MatchRegistry::new(
            tracker.clone(),
            router.clone(),
            runtime.clone(),
            limits.match_inbound_scale,
            shutdown.clone(),
        );
        let matchmaker = Matchmaker::new(config.matchmaker.max_tickets);
        let parties = PartyRegistry::new();
        let scheduler = Scheduler::new(runtime.clone(), shutdown.clone());

        Ok((
            Arc::new(Self {
                node,
                limits,
                tracker,
                sessions,
                cluster,
                router,
                runtime,
                matches,
                matchmaker,
                parties,
                scheduler,
                db,
                shutdown,
            }),
            NexusChannels {
                events_rx,
                replica_rx,
            },
        ))
    }

    /// Spawn the background machinery: tracker event dispatcher, cluster
    /// replication pump and links, matchmaker pass, scheduler timers.
    pub fn start(self: &Arc<Self>, config: &Config, channels: NexusChannels) {
        // Tracker diff listeners. Each must not block: router and registry
        // forwarding are queue pushes.
        let fan_router = self.router.clone();
        let match_registry = self.matches.clone();
        let party_registry = self.parties.clone();
        let party_router = self.router.clone();
        let listeners: Vec<tracker::Listener> = vec![
            Box::new(move |event| fan_out_presence_events(event, &fan_router)),
            Box::new(move |event| match_registry.handle_presence_event(event)),
            Box::new(move |event| party_registry.handle_presence_event(event, &party_router)),
        ];
        tracker::run_event_dispatcher(channels.events_rx, listeners);

        // Cluster replication and links.
        self.cluster.spawn_replica_pump(channels.replica_rx);
        let handler = InboundHandler::new(
            self.node.clone(),
            self.tracker.clone(),
            self.sessions.clone(),
        );
        if let Some(listen_addr) = &config.cluster.listen_addr {
            self.cluster
                .start_inbound_listener(handler.clone(), listen_addr.clone());
        }
        for peer in &config.cluster.peers {
            if peer.autoconnect {
                self.cluster.connect_to_peer(handler.clone(), peer.clone());
            }
        }
        self.cluster.start_heartbeat(handler);

        self.matchmaker.start(
            config.matchmaker.interval_secs,
            self.runtime.clone(),
            self.matches.clone(),
            self.router.clone(),
            self.parties.clone(),
            self.shutdown.clone(),
        );

        self.scheduler.start();
        info!(node = %self.node, "Nexus started");
    }
}

/// Translate tracker transitions into per-stream presence event envelopes.
/// Updates ride in the joins list with reason `update`, matching what
/// clients expect from a meta change.
fn fan_out_presence_events(event: &TrackerEvent, router: &Router) {
    let mut by_stream: HashMap<Stream, (Vec<Presence>, Vec<Presence>)> = HashMap::new();

    for presence in event.joins.iter().chain(event.updates.iter()) {
        by_stream
            .entry(presence.stream.clone())
            .or_default()
            .0
            .push(presence.clone());
    }
    for presence in &event.leaves {
        by_stream
            .entry(presence.stream.clone())
            .or_default()
            .1
            .push(presence.clone());
    }

    for (stream, (joins, leaves)) in by_stream {
        let payload = match stream.mode {
            StreamMode::Status => Payload::StatusPresenceEvent { joins, leaves },
            StreamMode::ChatRoom | StreamMode::DirectMessage | StreamMode::Group => {
                Payload::ChannelPresenceEvent {
                    channel_id: stream.encode_id(),
                    joins,
                    leaves,
                }
            }
            StreamMode::MatchRelayed | StreamMode::MatchAuthoritative => {
                Payload::MatchPresenceEvent {
                    match_id: stream.subject,
                    joins,
                    leaves,
                }
            }
            StreamMode::Party => Payload::PartyPresenceEvent {
                party_id: stream.subject,
                joins,
                leaves,
            },
        };
        router.send_to_stream(&stream, Envelope::push(payload), true);
    }
}
