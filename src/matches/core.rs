//! The match core contract and the dispatcher exposed to it.
//!
//! A core is the authoritative game logic of one match. It owns its state
//! (ordinary struct fields), and every callback runs on the match's own
//! task, so no synchronization is needed inside a core. Each callback is a
//! fault boundary: a panic terminates that match and nothing else.

use std::collections::HashMap;

use arena_proto::{Envelope, Payload, Presence, PresenceId, Stream};
use uuid::Uuid;

use crate::router::DeferredMessage;

/// One client message delivered to the match loop.
#[derive(Debug, Clone)]
pub struct MatchMessage {
    pub sender: Presence,
    pub op_code: i64,
    pub data: Vec<u8>,
    pub receive_time_ms: i64,
}

/// Whether the match keeps running after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopFlow {
    Continue,
    /// Close the match after this tick.
    Stop,
}

/// Result of `match_init`.
#[derive(Debug, Clone)]
pub struct MatchSetup {
    /// Ticks per second, must be within [1, 30].
    pub tick_rate: u32,
    /// Searchable label, at most 256 bytes.
    pub label: String,
}

/// Verdict of a join attempt.
#[derive(Debug, Clone)]
pub struct JoinDecision {
    pub allow: bool,
    pub reject_reason: Option<String>,
}

impl JoinDecision {
    pub fn accept() -> Self {
        Self {
            allow: true,
            reject_reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reject_reason: Some(reason.into()),
        }
    }
}

/// Authoritative match logic, provided through the extension runtime.
pub trait MatchCore: Send {
    /// Runs once before the first tick. A failure here means the match
    /// never enters the registry.
    fn match_init(
        &mut self,
        ctx: &mut MatchDispatcher,
        params: &serde_json::Value,
    ) -> Result<MatchSetup, String>;

    /// Admit or reject a presence. Runs between ticks; the admitted
    /// presence is reported through `match_join` at the next tick boundary.
    fn match_join_attempt(
        &mut self,
        ctx: &mut MatchDispatcher,
        tick: i64,
        presence: &Presence,
        metadata: &HashMap<String, String>,
    ) -> JoinDecision;

    fn match_join(&mut self, ctx: &mut MatchDispatcher, tick: i64, joins: &[Presence]) -> LoopFlow;

    fn match_leave(&mut self, ctx: &mut MatchDispatcher, tick: i64, leaves: &[Presence])
    -> LoopFlow;

    /// One iteration of the match loop with the messages drained this tick.
    fn match_loop(
        &mut self,
        ctx: &mut MatchDispatcher,
        tick: i64,
        messages: &[MatchMessage],
    ) -> LoopFlow;

    /// Final callback before the match stops.
    fn match_terminate(&mut self, ctx: &mut MatchDispatcher, tick: i64, grace_seconds: u64);
}

/// Send-side surface a core may use during a callback. Broadcasts are
/// deferred and flushed through the router after the callback returns.
pub struct MatchDispatcher {
    match_id: Uuid,
    stream: Stream,
    /// Presences currently on the match stream, refreshed each tick; used
    /// to prune bogus filter entries.
    presences: Vec<Presence>,
    deferred: Vec<DeferredMessage>,
    kicks: Vec<PresenceId>,
    label_update: Option<String>,
    label_error: Option<usize>,
}

impl MatchDispatcher {
    pub fn new(match_id: Uuid, stream: Stream) -> Self {
        Self {
            match_id,
            stream,
            presences: Vec::new(),
            deferred: Vec::new(),
            kicks: Vec::new(),
            label_update: None,
            label_error: None,
        }
    }

    pub fn match_id(&self) -> Uuid {
        self.match_id
    }

    /// Presences on the match stream as of the current tick.
    pub fn presences(&self) -> &[Presence] {
        &self.presences
    }

    /// Queue a broadcast to the match stream, or to a filtered subset. The
    /// filter is pruned against current match presences.
    pub fn broadcast_message(
        &mut self,
        op_code: i64,
        data: Vec<u8>,
        filter: Option<Vec<PresenceId>>,
        sender: Option<Presence>,
    ) {
        let filter = filter.map(|wanted| {
            wanted
                .into_iter()
                .filter(|id| self.presences.iter().any(|p| p.id == *id))
                .collect::<Vec<_>>()
        });
        // A filter that pruned to nothing means nobody to send to.
        if matches!(&filter, Some(f) if f.is_empty()) {
            return;
        }
        self.deferred.push(DeferredMessage {
            stream: self.stream.clone(),
            envelope: Envelope::push(Payload::MatchData {
                match_id: self.match_id,
                presence: sender,
                op_code,
                data,
            }),
            reliable: true,
            presence_filter: filter,
        });
    }

    /// Schedule removal of presences from the match.
    pub fn match_kick(&mut self, presences: Vec<PresenceId>) {
        self.kicks.extend(presences);
    }

    /// Update the searchable label (at most 256 bytes).
    pub fn label_update(&mut self, label: impl Into<String>) {
        let label = label.into();
        if label.len() > 256 {
            self.label_error = Some(label.len());
            return;
        }
        self.label_update = Some(label);
    }

    pub(super) fn set_presences(&mut self, presences: Vec<Presence>) {
        self.presences = presences;
    }

    pub(super) fn take_outputs(
        &mut self,
    ) -> (Vec<DeferredMessage>, Vec<PresenceId>, Option<String>, Option<usize>) {
        (
            std::mem::take(&mut self.deferred),
            std::mem::take(&mut self.kicks),
            self.label_update.take(),
            self.label_error.take(),
        )
    }
}
