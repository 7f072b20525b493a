//! The provider contract: the hook surface every scripting backend
//! exposes, and the initializer it registers into at startup.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use arena_proto::Envelope;
use tracing::warn;
use uuid::Uuid;

use crate::error::RuntimeError;
use crate::matches::core::MatchCore;
use crate::matchmaker::MatchmakerEntry;
use crate::session::SessionHandle;

/// Caller identity handed to RPCs and hooks.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub user_id: Uuid,
    pub username: String,
    pub session_id: Uuid,
    pub vars: HashMap<String, String>,
    pub expiry: i64,
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub query_params: HashMap<String, String>,
}

impl CallContext {
    pub fn from_session(session: &SessionHandle) -> Self {
        Self {
            user_id: session.user_id,
            username: session.username.clone(),
            session_id: session.session_id,
            vars: session.vars.clone(),
            expiry: session.expiry,
            client_ip: session.remote_addr.ip(),
            client_port: session.remote_addr.port(),
            query_params: HashMap::new(),
        }
    }
}

/// Lifecycle and custom events observed by the event hook.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    SessionStart {
        user_id: Uuid,
        username: String,
        session_id: Uuid,
    },
    SessionEnd {
        user_id: Uuid,
        username: String,
        session_id: Uuid,
    },
    Custom {
        name: String,
        properties: HashMap<String, String>,
    },
}

pub type RpcFn = Arc<dyn Fn(&CallContext, &str) -> Result<String, RuntimeError> + Send + Sync>;

/// Before-hook for a realtime envelope: may mutate it, replace it, or drop
/// it (`Ok(None)`) without an error. An `Err` rejects the operation and
/// propagates to the client.
pub type BeforeRtFn =
    Arc<dyn Fn(&CallContext, Envelope) -> Result<Option<Envelope>, RuntimeError> + Send + Sync>;

/// After-hook for a realtime envelope: observes the input and the reply (if
/// any). Cannot fail the operation.
pub type AfterRtFn = Arc<dyn Fn(&CallContext, &Envelope, Option<&Envelope>) + Send + Sync>;

/// Before-hook for an API operation, keyed by operation name; payloads are
/// the operation's JSON encoding.
pub type BeforeApiFn =
    Arc<dyn Fn(&CallContext, String) -> Result<Option<String>, RuntimeError> + Send + Sync>;

pub type AfterApiFn = Arc<dyn Fn(&CallContext, &str, Option<&str>) + Send + Sync>;

/// Matchmaker-matched hook: receives the accepted entries and returns a
/// match id, or `None` meaning "no match created" (the engine then sets up
/// a relayed match).
pub type MatchmakerMatchedFn =
    Arc<dyn Fn(&[MatchmakerEntry]) -> Result<Option<Uuid>, RuntimeError> + Send + Sync>;

/// Scheduled hook invoked with `(id, end_active_unix, next_reset_unix)`.
pub type ScheduleFn = Arc<dyn Fn(Uuid, i64, i64) + Send + Sync>;

pub type EventFn = Arc<dyn Fn(&RuntimeEvent) + Send + Sync>;

pub type MatchFactory = Arc<dyn Fn() -> Box<dyn MatchCore> + Send + Sync>;

/// Registration surface handed to each provider at startup. All tables are
/// immutable once the fold over providers completes.
#[derive(Default)]
pub struct Initializer {
    pub(super) rpcs: HashMap<String, RpcFn>,
    pub(super) before_rt: HashMap<String, BeforeRtFn>,
    pub(super) after_rt: HashMap<String, AfterRtFn>,
    pub(super) before_api: HashMap<String, BeforeApiFn>,
    pub(super) after_api: HashMap<String, AfterApiFn>,
    pub(super) matchmaker_matched: Option<MatchmakerMatchedFn>,
    pub(super) tournament_end: Option<ScheduleFn>,
    pub(super) tournament_reset: Option<ScheduleFn>,
    pub(super) leaderboard_reset: Option<ScheduleFn>,
    pub(super) event: Option<EventFn>,
    pub(super) matches: Vec<(String, MatchFactory)>,
}

impl Initializer {
    pub fn register_rpc(&mut self, id: impl Into<String>, f: RpcFn) {
        let id = id.into();
        if self.rpcs.insert(id.clone(), f).is_some() {
            warn!(id = %id, "Duplicate RPC registration within provider, last wins");
        }
    }

    pub fn register_before_rt(&mut self, tag: impl Into<String>, f: BeforeRtFn) {
        self.before_rt.insert(tag.into(), f);
    }

    pub fn register_after_rt(&mut self, tag: impl Into<String>, f: AfterRtFn) {
        self.after_rt.insert(tag.into(), f);
    }

    pub fn register_before_api(&mut self, op: impl Into<String>, f: BeforeApiFn) {
        self.before_api.insert(op.into(), f);
    }

    pub fn register_after_api(&mut self, op: impl Into<String>, f: AfterApiFn) {
        self.after_api.insert(op.into(), f);
    }

    pub fn register_matchmaker_matched(&mut self, f: MatchmakerMatchedFn) {
        self.matchmaker_matched = Some(f);
    }

    pub fn register_tournament_end(&mut self, f: ScheduleFn) {
        self.tournament_end = Some(f);
    }

    pub fn register_tournament_reset(&mut self, f: ScheduleFn) {
        self.tournament_reset = Some(f);
    }

    pub fn register_leaderboard_reset(&mut self, f: ScheduleFn) {
        self.leaderboard_reset = Some(f);
    }

    pub fn register_event(&mut self, f: EventFn) {
        self.event = Some(f);
    }

    pub fn register_match(&mut self, name: impl Into<String>, factory: MatchFactory) {
        self.matches.push((name.into(), factory));
    }
}

/// One scripting backend. Providers are folded in priority order: for any
/// hook registered by more than one provider, the earlier provider wins.
pub trait RuntimeProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Register every hook this provider offers.
    fn register(&self, init: &mut Initializer) -> Result<(), RuntimeError>;
}
