//! Match create/join/leave/data handlers, delegating to the registry.

use std::collections::HashMap;
use std::sync::Arc;

use arena_proto::{Envelope, Payload, PresenceId};
use uuid::Uuid;

use super::Pipeline;
use crate::error::{ApiError, ApiResult};
use crate::matches::MatchHandle;
use crate::matches::core::MatchMessage;
use crate::session::SessionHandle;

pub(super) async fn create(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    name: Option<String>,
    params: Option<serde_json::Value>,
) -> ApiResult<Option<Envelope>> {
    let handle = match name {
        Some(name) => {
            p.nexus()
                .matches
                .create_authoritative(&name, params.unwrap_or(serde_json::Value::Null))
                .await?
        }
        None => p.nexus().matches.create_relayed(),
    };
    // The creator joins its own match immediately.
    join_flow(p, session, cid, &handle, HashMap::new()).await
}

pub(super) async fn join(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    match_id: Uuid,
    metadata: HashMap<String, String>,
) -> ApiResult<Option<Envelope>> {
    let handle = p
        .nexus()
        .matches
        .get(&match_id)
        .ok_or_else(|| ApiError::NotFound(format!("match {match_id}")))?;
    join_flow(p, session, cid, &handle, metadata).await
}

async fn join_flow(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    handle: &Arc<MatchHandle>,
    metadata: HashMap<String, String>,
) -> ApiResult<Option<Envelope>> {
    let self_presence = p.self_presence(session, handle.stream.clone(), false, false);

    let decision = p
        .nexus()
        .matches
        .join_attempt(handle, self_presence.clone(), metadata)
        .await?;
    if !decision.allow {
        return Err(ApiError::PermissionDenied(
            decision
                .reject_reason
                .unwrap_or_else(|| "join rejected".to_string()),
        ));
    }

    let (ok, _) = p.nexus().tracker.track(
        session.context(),
        session.session_id,
        handle.stream.clone(),
        session.user_id,
        self_presence.meta.clone(),
        true,
    );
    if !ok {
        return Err(ApiError::Unavailable("session closing".to_string()));
    }

    Ok(Some(Envelope::new(
        cid,
        Payload::Match {
            match_id: handle.match_id,
            authoritative: handle.authoritative(),
            label: handle.label.read().clone(),
            size: p.nexus().tracker.count_by_stream(&handle.stream, true) as u32,
            presences: p.nexus().tracker.list_by_stream(&handle.stream, false, false),
            self_presence,
        },
    )))
}

pub(super) fn leave(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    match_id: Uuid,
) -> ApiResult<Option<Envelope>> {
    let handle = p
        .nexus()
        .matches
        .get(&match_id)
        .ok_or_else(|| ApiError::NotFound(format!("match {match_id}")))?;
    p.nexus()
        .tracker
        .untrack(session.session_id, handle.stream.clone(), session.user_id);
    Ok(Some(Envelope::new(cid, Payload::Ack {})))
}

pub(super) fn data_send(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    match_id: Uuid,
    op_code: i64,
    data: Vec<u8>,
    presence_filter: Vec<PresenceId>,
    reliable: bool,
) -> ApiResult<Option<Envelope>> {
    let handle = p
        .nexus()
        .matches
        .get(&match_id)
        .ok_or_else(|| ApiError::NotFound(format!("match {match_id}")))?;

    let sender = p
        .nexus()
        .tracker
        .get_local_by_session_id_stream_user_id(session.session_id, &handle.stream, session.user_id)
        .ok_or_else(|| ApiError::PermissionDenied("not in match".to_string()))?;

    p.nexus().matches.send_data(
        &handle,
        MatchMessage {
            sender,
            op_code,
            data,
            receive_time_ms: chrono::Utc::now().timestamp_millis(),
        },
        presence_filter,
        reliable,
    );
    // Match data has no ack; delivery is at-most-once.
    Ok(None)
}
