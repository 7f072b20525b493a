//! Built-in provider: the hooks and match cores compiled into this binary.
//!
//! Deployments link their game modules here (or as further providers ahead
//! of or behind this one). The built-ins double as the reference
//! implementation the integration tests drive.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::provider::{Initializer, RuntimeProvider};
use crate::error::RuntimeError;
use crate::matches::core::{
    JoinDecision, LoopFlow, MatchCore, MatchDispatcher, MatchMessage, MatchSetup,
};

pub struct BuiltinProvider {
    node: String,
}

impl BuiltinProvider {
    pub fn new(node: impl Into<String>) -> Self {
        Self { node: node.into() }
    }
}

impl RuntimeProvider for BuiltinProvider {
    fn name(&self) -> &str {
        "builtin"
    }

    fn register(&self, init: &mut Initializer) -> Result<(), RuntimeError> {
        init.register_rpc("ping", Arc::new(|_ctx, payload: &str| Ok(payload.to_string())));

        let node = self.node.clone();
        init.register_rpc(
            "node_name",
            Arc::new(move |_ctx, _payload: &str| Ok(node.clone())),
        );

        init.register_rpc(
            "whoami",
            Arc::new(|ctx, _payload: &str| {
                let identity = serde_json::json!({
                    "user_id": ctx.user_id,
                    "username": ctx.username,
                    "session_id": ctx.session_id,
                    "expiry": ctx.expiry,
                    "client_ip": ctx.client_ip.to_string(),
                    "client_port": ctx.client_port,
                    "vars": ctx.vars,
                    "query_params": ctx.query_params,
                });
                serde_json::to_string(&identity).map_err(|e| {
                    RuntimeError::hook(arena_proto::ErrorCode::Internal, e.to_string())
                })
            }),
        );

        init.register_match("echo", Arc::new(|| Box::new(EchoCore::default())));
        Ok(())
    }
}

/// Reference authoritative core: answers every message with `op_code + 1`
/// and the same data, broadcast to the whole match.
#[derive(Default)]
struct EchoCore {
    max_players: usize,
    handled: u64,
}

impl MatchCore for EchoCore {
    fn match_init(
        &mut self,
        _ctx: &mut MatchDispatcher,
        params: &Value,
    ) -> Result<MatchSetup, String> {
        let tick_rate = params
            .get("tick_rate")
            .and_then(Value::as_u64)
            .unwrap_or(10) as u32;
        let label = params
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.max_players = params
            .get("max_players")
            .and_then(Value::as_u64)
            .unwrap_or(16) as usize;
        Ok(MatchSetup { tick_rate, label })
    }

    fn match_join_attempt(
        &mut self,
        ctx: &mut MatchDispatcher,
        _tick: i64,
        _presence: &arena_proto::Presence,
        _metadata: &HashMap<String, String>,
    ) -> JoinDecision {
        if ctx.presences().len() >= self.max_players {
            JoinDecision::reject("match full")
        } else {
            JoinDecision::accept()
        }
    }

    fn match_join(
        &mut self,
        _ctx: &mut MatchDispatcher,
        _tick: i64,
        _joins: &[arena_proto::Presence],
    ) -> LoopFlow {
        LoopFlow::Continue
    }

    fn match_leave(
        &mut self,
        ctx: &mut MatchDispatcher,
        _tick: i64,
        _leaves: &[arena_proto::Presence],
    ) -> LoopFlow {
        // The match winds down with its last participant.
        if ctx.presences().is_empty() {
            LoopFlow::Stop
        } else {
            LoopFlow::Continue
        }
    }

    fn match_loop(
        &mut self,
        ctx: &mut MatchDispatcher,
        _tick: i64,
        messages: &[MatchMessage],
    ) -> LoopFlow {
        for message in messages {
            self.handled += 1;
            ctx.broadcast_message(
                message.op_code + 1,
                message.data.clone(),
                None,
                Some(message.sender.clone()),
            );
        }
        LoopFlow::Continue
    }

    fn match_terminate(&mut self, _ctx: &mut MatchDispatcher, tick: i64, grace_seconds: u64) {
        debug!(tick = tick, grace = grace_seconds, handled = self.handled, "Echo match terminating");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{CallContext, ExtensionRuntime};
    use arena_proto::Stream;
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};
    use uuid::Uuid;

    fn ctx() -> CallContext {
        CallContext {
            user_id: Uuid::new_v4(),
            username: "ada".to_string(),
            session_id: Uuid::new_v4(),
            vars: HashMap::new(),
            expiry: 0,
            client_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            client_port: 4000,
            query_params: HashMap::new(),
        }
    }

    #[test]
    fn builtin_registers_rpcs_and_echo_match() {
        let providers: Vec<Box<dyn RuntimeProvider>> =
            vec![Box::new(BuiltinProvider::new("n1"))];
        let runtime = ExtensionRuntime::build(&providers).unwrap();

        assert!(runtime.has_match("echo"));
        assert!(!runtime.has_match("missing"));
        assert!(runtime.create_match("echo").is_some());

        let ctx = ctx();
        assert_eq!(runtime.rpc(&ctx, "ping", "payload").unwrap(), "payload");
        assert_eq!(runtime.rpc(&ctx, "node_name", "").unwrap(), "n1");

        let identity: serde_json::Value =
            serde_json::from_str(&runtime.rpc(&ctx, "whoami", "").unwrap()).unwrap();
        assert_eq!(identity["username"], "ada");
        assert_eq!(identity["client_port"], 4000);
    }

    #[test]
    fn echo_core_setup_and_decisions() {
        let match_id = Uuid::new_v4();
        let mut dispatcher = MatchDispatcher::new(match_id, Stream::match_stream(match_id, true));
        let mut core = EchoCore::default();

        let setup = core.match_init(&mut dispatcher, &json!({})).unwrap();
        assert_eq!(setup.tick_rate, 10);
        assert!(setup.label.is_empty());

        let setup = core
            .match_init(
                &mut dispatcher,
                &json!({"tick_rate": 15, "label": "open", "max_players": 2}),
            )
            .unwrap();
        assert_eq!(setup.tick_rate, 15);
        assert_eq!(setup.label, "open");

        // Empty match admits; an empty match after a leave stops.
        let presence = arena_proto::Presence {
            id: arena_proto::PresenceId {
                node: "n1".to_string(),
                session_id: Uuid::new_v4(),
            },
            stream: Stream::match_stream(match_id, true),
            user_id: Uuid::new_v4(),
            meta: arena_proto::PresenceMeta::new(arena_proto::SessionFormat::Json, "ada"),
        };
        let decision =
            core.match_join_attempt(&mut dispatcher, 1, &presence, &HashMap::new());
        assert!(decision.allow);

        assert_eq!(core.match_loop(&mut dispatcher, 1, &[]), LoopFlow::Continue);
        assert_eq!(core.match_leave(&mut dispatcher, 2, &[]), LoopFlow::Stop);
    }
}
