//! The per-match actor: one task owning the core and its state, driven by
//! a monotonic ticker at the match's declared rate.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use arena_proto::{Envelope, Payload, Presence, Stream};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::MatchHandle;
use super::core::{JoinDecision, LoopFlow, MatchCore, MatchDispatcher, MatchMessage, MatchSetup};
use crate::error::MatchError;
use crate::metrics;
use crate::router::Router;
use crate::tracker::Tracker;

/// Control operations processed by the match task between ticks.
pub enum MatchControl {
    JoinAttempt {
        presence: Presence,
        metadata: HashMap<String, String>,
        reply: oneshot::Sender<JoinDecision>,
    },
    /// Admitted presences observed on the match stream; reported to the
    /// core at the next tick boundary.
    Join(Vec<Presence>),
    Leave(Vec<Presence>),
    Terminate {
        grace_seconds: u64,
    },
}

/// Everything a match actor needs from the outside world.
pub struct ActorDeps {
    pub tracker: Arc<Tracker>,
    pub router: Arc<Router>,
    pub matches: Arc<DashMap<Uuid, Arc<MatchHandle>>>,
    pub label: Arc<RwLock<String>>,
    pub shutdown: CancellationToken,
}

type InitResult = Result<(MatchSetup, mpsc::Sender<MatchMessage>), MatchError>;

/// Spawn the actor. The returned channel yields once `match_init` has run:
/// a failed init never enters the registry.
pub fn spawn(
    match_id: Uuid,
    core: Box<dyn MatchCore>,
    params: serde_json::Value,
    inbound_scale: usize,
    ctrl_rx: mpsc::Receiver<MatchControl>,
    deps: ActorDeps,
) -> oneshot::Receiver<InitResult> {
    let (init_tx, init_rx) = oneshot::channel();
    tokio::spawn(run(match_id, core, params, inbound_scale, ctrl_rx, deps, init_tx));
    init_rx
}

/// Run a core callback behind the fault boundary.
fn guard<R>(what: &'static str, f: impl FnOnce() -> R) -> Result<R, String> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        format!("{what} panicked: {detail}")
    })
}

#[allow(clippy::too_many_arguments)]
async fn run(
    match_id: Uuid,
    mut core: Box<dyn MatchCore>,
    params: serde_json::Value,
    inbound_scale: usize,
    mut ctrl_rx: mpsc::Receiver<MatchControl>,
    deps: ActorDeps,
    init_tx: oneshot::Sender<InitResult>,
) {
    let stream = Stream::match_stream(match_id, true);
    let mut dispatcher = MatchDispatcher::new(match_id, stream.clone());

    // match_init runs exactly once, before the first tick.
    let setup = match guard("match_init", || core.match_init(&mut dispatcher, &params)) {
        Ok(Ok(setup)) => setup,
        Ok(Err(reason)) => {
            let _ = init_tx.send(Err(MatchError::InitFailed(reason)));
            return;
        }
        Err(fault) => {
            let _ = init_tx.send(Err(MatchError::InitFailed(fault)));
            return;
        }
    };
    if !(1..=30).contains(&setup.tick_rate) {
        let _ = init_tx.send(Err(MatchError::InvalidTickRate(setup.tick_rate)));
        return;
    }
    if setup.label.len() > 256 {
        let _ = init_tx.send(Err(MatchError::LabelTooLong(setup.label.len())));
        return;
    }

    let (data_tx, mut data_rx) =
        mpsc::channel::<MatchMessage>(setup.tick_rate as usize * inbound_scale);
    *deps.label.write() = setup.label.clone();
    let tick_rate = setup.tick_rate;
    if init_tx.send(Ok((setup, data_tx))).is_err() {
        return;
    }

    let mut interval =
        tokio::time::interval(Duration::from_millis(1000 / u64::from(tick_rate)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut tick: i64 = 0;
    let mut pending_joins: Vec<Presence> = Vec::new();
    let mut pending_leaves: Vec<Presence> = Vec::new();
    let mut pending_terminate: Option<u64> = None;

    info!(match_id = %match_id, tick_rate = tick_rate, "Match started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                tick += 1;

                dispatcher.set_presences(deps.tracker.list_by_stream(&stream, true, false));

                // Drain the bounded inbound queue into this tick's batch.
                let mut messages = Vec::new();
                while let Ok(msg) = data_rx.try_recv() {
                    messages.push(msg);
                }

                let mut flow = LoopFlow::Continue;

                if !pending_joins.is_empty() {
                    let joins = std::mem::take(&mut pending_joins);
                    match guard("match_join", || core.match_join(&mut dispatcher, tick, &joins)) {
                        Ok(f) => flow = f,
                        Err(fault) => {
                            fail(&deps, &mut dispatcher, match_id, &stream, &fault);
                            return;
                        }
                    }
                    flush(&deps, &mut dispatcher, &stream);
                }

                if flow == LoopFlow::Continue && !pending_leaves.is_empty() {
                    let leaves = std::mem::take(&mut pending_leaves);
                    match guard("match_leave", || core.match_leave(&mut dispatcher, tick, &leaves)) {
                        Ok(f) => flow = f,
                        Err(fault) => {
                            fail(&deps, &mut dispatcher, match_id, &stream, &fault);
                            return;
                        }
                    }
                    flush(&deps, &mut dispatcher, &stream);
                }

                if flow == LoopFlow::Continue {
                    match guard("match_loop", || core.match_loop(&mut dispatcher, tick, &messages)) {
                        Ok(f) => flow = f,
                        Err(fault) => {
                            fail(&deps, &mut dispatcher, match_id, &stream, &fault);
                            return;
                        }
                    }
                    flush(&deps, &mut dispatcher, &stream);
                }

                if let Some(grace) = pending_terminate.take() {
                    let _ = guard("match_terminate", || {
                        core.match_terminate(&mut dispatcher, tick, grace)
                    });
                    flush(&deps, &mut dispatcher, &stream);
                    close(&deps, match_id, &stream, "terminated");
                    return;
                }

                if flow == LoopFlow::Stop {
                    close(&deps, match_id, &stream, "core stopped");
                    return;
                }
            }

            ctrl = ctrl_rx.recv() => {
                let Some(ctrl) = ctrl else {
                    close(&deps, match_id, &stream, "registry dropped");
                    return;
                };
                match ctrl {
                    MatchControl::JoinAttempt { presence, metadata, reply } => {
                        dispatcher.set_presences(deps.tracker.list_by_stream(&stream, true, false));
                        match guard("match_join_attempt", || {
                            core.match_join_attempt(&mut dispatcher, tick, &presence, &metadata)
                        }) {
                            Ok(decision) => {
                                flush(&deps, &mut dispatcher, &stream);
                                let _ = reply.send(decision);
                            }
                            Err(fault) => {
                                drop(reply);
                                fail(&deps, &mut dispatcher, match_id, &stream, &fault);
                                return;
                            }
                        }
                    }
                    MatchControl::Join(mut presences) => pending_joins.append(&mut presences),
                    MatchControl::Leave(mut presences) => pending_leaves.append(&mut presences),
                    MatchControl::Terminate { grace_seconds } => {
                        pending_terminate = Some(grace_seconds);
                    }
                }
            }

            _ = deps.shutdown.cancelled() => {
                let _ = guard("match_terminate", || {
                    core.match_terminate(&mut dispatcher, tick, 0)
                });
                flush(&deps, &mut dispatcher, &stream);
                close(&deps, match_id, &stream, "node shutdown");
                return;
            }
        }
    }
}

/// Apply the dispatcher's accumulated outputs: deferred broadcasts through
/// the router, kicks through the tracker, label updates in place.
fn flush(deps: &ActorDeps, dispatcher: &mut MatchDispatcher, stream: &Stream) {
    let presences = dispatcher.presences().to_vec();
    let (deferred, kicks, label, label_error) = dispatcher.take_outputs();

    if let Some(len) = label_error {
        warn!(len = len, "Match label update rejected, exceeds 256 bytes");
    }
    if let Some(label) = label {
        *deps.label.write() = label;
    }
    for message in deferred {
        deps.router.send_deferred(message);
    }
    for id in kicks {
        match presences.iter().find(|p| p.id == id) {
            Some(presence) => {
                deps.tracker
                    .untrack_presence(id, stream.clone(), presence.user_id);
            }
            None => debug!(session = %id.session_id, "Kick target not in match, ignoring"),
        }
    }
}

/// A core fault: log, tell clients, tear the match down.
fn fail(
    deps: &ActorDeps,
    dispatcher: &mut MatchDispatcher,
    match_id: Uuid,
    stream: &Stream,
    fault: &str,
) {
    error!(match_id = %match_id, fault = %fault, "Match core fault, terminating match");
    // Discard whatever the faulting callback half-produced.
    let _ = dispatcher.take_outputs();
    close(deps, match_id, stream, "core fault");
}

/// Remove the match from the registry, send the explicit close envelope,
/// and evacuate the stream.
fn close(deps: &ActorDeps, match_id: Uuid, stream: &Stream, reason: &str) {
    deps.matches.remove(&match_id);
    metrics::MATCHES_ACTIVE.set(deps.matches.len() as i64);

    let leaves = deps.tracker.list_by_stream(stream, true, false);
    if !leaves.is_empty() {
        deps.router.send_to_stream(
            stream,
            Envelope::push(Payload::MatchPresenceEvent {
                match_id,
                joins: Vec::new(),
                leaves,
            }),
            true,
        );
    }
    deps.tracker.untrack_by_stream(stream.clone());
    info!(match_id = %match_id, reason = %reason, "Match closed");
}
