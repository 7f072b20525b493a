//! The extension runtime: a façade over ordered provider backends.
//!
//! At startup each provider registers its hooks into an [`Initializer`];
//! the fold over providers produces immutable lookup tables, so the hot
//! path takes no locks. Every provider call is a fault boundary: a panic
//! inside a hook is caught and mapped to an error (before path) or logged
//! and swallowed (after path, scheduled hooks, events).

mod builtin;
mod provider;

pub use builtin::BuiltinProvider;
pub use provider::{
    AfterApiFn, AfterRtFn, BeforeApiFn, BeforeRtFn, CallContext, EventFn, Initializer,
    MatchFactory, MatchmakerMatchedFn, RpcFn, RuntimeEvent, RuntimeProvider, ScheduleFn,
};

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arena_proto::Envelope;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::RuntimeError;
use crate::matches::core::MatchCore;
use crate::matchmaker::MatchmakerEntry;
use crate::metrics;
use crate::session::SessionHandle;

fn guard<R>(what: &str, f: impl FnOnce() -> R) -> Result<R, RuntimeError> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        RuntimeError::Faulted(format!("{what}: {detail}"))
    })
}

/// Immutable hook tables built once at startup.
pub struct ExtensionRuntime {
    rpc_by_id: HashMap<String, RpcFn>,
    before_rt: HashMap<String, BeforeRtFn>,
    after_rt: HashMap<String, AfterRtFn>,
    before_api: HashMap<String, BeforeApiFn>,
    after_api: HashMap<String, AfterApiFn>,
    matchmaker_matched: Option<MatchmakerMatchedFn>,
    tournament_end: Option<ScheduleFn>,
    tournament_reset: Option<ScheduleFn>,
    leaderboard_reset: Option<ScheduleFn>,
    event: Option<EventFn>,
    /// Match factories in provider priority order; `create_match` tries
    /// them until one claims the name.
    match_chain: Vec<(String, MatchFactory)>,
}

impl ExtensionRuntime {
    /// Fold providers, in priority order, into the lookup tables. The first
    /// provider to register a given hook wins; later registrations for the
    /// same key are ignored with a warning.
    pub fn build(providers: &[Box<dyn RuntimeProvider>]) -> Result<Arc<Self>, RuntimeError> {
        let mut runtime = Self {
            rpc_by_id: HashMap::new(),
            before_rt: HashMap::new(),
            after_rt: HashMap::new(),
            before_api: HashMap::new(),
            after_api: HashMap::new(),
            matchmaker_matched: None,
            tournament_end: None,
            tournament_reset: None,
            leaderboard_reset: None,
            event: None,
            match_chain: Vec::new(),
        };

        for provider in providers {
            let mut init = Initializer::default();
            provider.register(&mut init)?;
            runtime.merge(provider.name(), init);
        }
        Ok(Arc::new(runtime))
    }

    fn merge(&mut self, provider: &str, init: Initializer) {
        for (id, f) in init.rpcs {
            if self.rpc_by_id.contains_key(&id) {
                warn!(provider = %provider, id = %id, "RPC already registered by a higher-priority provider");
                continue;
            }
            self.rpc_by_id.insert(id, f);
        }
        for (tag, f) in init.before_rt {
            if self.before_rt.contains_key(&tag) {
                warn!(provider = %provider, tag = %tag, "before-RT hook already registered");
                continue;
            }
            self.before_rt.insert(tag, f);
        }
        for (tag, f) in init.after_rt {
            if self.after_rt.contains_key(&tag) {
                warn!(provider = %provider, tag = %tag, "after-RT hook already registered");
                continue;
            }
            self.after_rt.insert(tag, f);
        }
        for (op, f) in init.before_api {
            self.before_api.entry(op).or_insert(f);
        }
        for (op, f) in init.after_api {
            self.after_api.entry(op).or_insert(f);
        }
        if let Some(f) = init.matchmaker_matched {
            if self.matchmaker_matched.is_none() {
                self.matchmaker_matched = Some(f);
            } else {
                warn!(provider = %provider, "matchmaker_matched hook already registered");
            }
        }
        if let Some(f) = init.tournament_end {
            self.tournament_end.get_or_insert(f);
        }
        if let Some(f) = init.tournament_reset {
            self.tournament_reset.get_or_insert(f);
        }
        if let Some(f) = init.leaderboard_reset {
            self.leaderboard_reset.get_or_insert(f);
        }
        if let Some(f) = init.event {
            self.event.get_or_insert(f);
        }
        self.match_chain.extend(init.matches);
    }

    // ========================================================================
    // RPC
    // ========================================================================

    pub fn rpc(&self, ctx: &CallContext, id: &str, payload: &str) -> Result<String, RuntimeError> {
        let Some(f) = self.rpc_by_id.get(id) else {
            metrics::RPC_CALLS.with_label_values(&["not_found"]).inc();
            return Err(RuntimeError::RpcNotFound(id.to_string()));
        };
        let result = guard("rpc", || f(ctx, payload)).and_then(|r| r);
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::RPC_CALLS.with_label_values(&[outcome]).inc();
        result
    }

    // ========================================================================
    // Before/after interceptors
    // ========================================================================

    /// Run the before hook for a realtime envelope. `Ok(None)` means the
    /// hook consumed the envelope and the operation stops silently.
    pub fn before_rt(
        &self,
        ctx: &CallContext,
        envelope: Envelope,
    ) -> Result<Option<Envelope>, RuntimeError> {
        let Some(f) = self.before_rt.get(envelope.payload.tag()) else {
            return Ok(Some(envelope));
        };
        guard("before_rt", || f(ctx, envelope)).and_then(|r| r)
    }

    /// Run the after hook for a realtime envelope. Errors and panics are
    /// logged and swallowed.
    pub fn after_rt(&self, ctx: &CallContext, input: &Envelope, output: Option<&Envelope>) {
        let Some(f) = self.after_rt.get(input.payload.tag()) else {
            return;
        };
        if let Err(e) = guard("after_rt", || f(ctx, input, output)) {
            error!(tag = %input.payload.tag(), error = %e, "after-RT hook failed");
        }
    }

    /// Interceptors for the API surface (HTTP/gRPC transports feed these;
    /// they sit outside this daemon).
    pub fn before_api(
        &self,
        ctx: &CallContext,
        op: &str,
        payload: String,
    ) -> Result<Option<String>, RuntimeError> {
        let Some(f) = self.before_api.get(op) else {
            return Ok(Some(payload));
        };
        guard("before_api", || f(ctx, payload)).and_then(|r| r)
    }

    pub fn after_api(&self, ctx: &CallContext, op: &str, input: &str, output: Option<&str>) {
        let Some(f) = self.after_api.get(op) else {
            return;
        };
        if let Err(e) = guard("after_api", || f(ctx, input, output)) {
            error!(op = %op, error = %e, "after-API hook failed");
        }
    }

    // ========================================================================
    // Matches
    // ========================================================================

    /// Walk the provider chain until one claims the match name.
    pub fn create_match(&self, name: &str) -> Option<Box<dyn MatchCore>> {
        self.match_chain
            .iter()
            .find(|(registered, _)| registered == name)
            .map(|(_, factory)| factory())
    }

    #[allow(dead_code)] // Available to API handlers
    pub fn has_match(&self, name: &str) -> bool {
        self.match_chain.iter().any(|(n, _)| n == name)
    }

    // ========================================================================
    // Matchmaker / scheduled / event hooks
    // ========================================================================

    /// Invoke the matchmaker-matched hook. Returns the match id chosen by
    /// the hook, or `None` when no hook is registered or the hook declined.
    pub fn matchmaker_matched(&self, entries: &[MatchmakerEntry]) -> Option<Uuid> {
        let f = self.matchmaker_matched.as_ref()?;
        match guard("matchmaker_matched", || f(entries)) {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                error!(error = %e, "matchmaker_matched hook failed");
                None
            }
            Err(e) => {
                error!(error = %e, "matchmaker_matched hook fault");
                None
            }
        }
    }

    pub fn tournament_end(&self, id: Uuid, end_active: i64, next_reset: i64) {
        self.fire_schedule(&self.tournament_end, "tournament_end", id, end_active, next_reset);
    }

    pub fn tournament_reset(&self, id: Uuid, end_active: i64, next_reset: i64) {
        self.fire_schedule(
            &self.tournament_reset,
            "tournament_reset",
            id,
            end_active,
            next_reset,
        );
    }

    pub fn leaderboard_reset(&self, id: Uuid, end_active: i64, next_reset: i64) {
        self.fire_schedule(
            &self.leaderboard_reset,
            "leaderboard_reset",
            id,
            end_active,
            next_reset,
        );
    }

    fn fire_schedule(
        &self,
        slot: &Option<ScheduleFn>,
        what: &str,
        id: Uuid,
        end_active: i64,
        next_reset: i64,
    ) {
        let Some(f) = slot else { return };
        if let Err(e) = guard(what, || f(id, end_active, next_reset)) {
            error!(hook = %what, id = %id, error = %e, "scheduled hook fault");
        }
    }

    pub fn fire_session_start(&self, session: &SessionHandle) {
        self.fire_event(&RuntimeEvent::SessionStart {
            user_id: session.user_id,
            username: session.username.clone(),
            session_id: session.session_id,
        });
    }

    pub fn fire_session_end(&self, session: &SessionHandle) {
        self.fire_event(&RuntimeEvent::SessionEnd {
            user_id: session.user_id,
            username: session.username.clone(),
            session_id: session.session_id,
        });
    }

    pub fn fire_event(&self, event: &RuntimeEvent) {
        let Some(f) = &self.event else { return };
        if let Err(e) = guard("event", || f(event)) {
            error!(error = %e, "event hook fault");
        }
    }
}
