//! Party handlers, delegating to the party registry's state machine.
//!
//! Parties are node-local: every member's session lives on the node that
//! created the party. Presence fan-out still crosses the cluster so
//! spectating surfaces elsewhere see the party stream.

use std::sync::Arc;

use arena_proto::{Envelope, Payload, PresenceId, Stream};
use uuid::Uuid;

use super::Pipeline;
use crate::error::{ApiError, ApiResult};
use crate::matchmaker::party::JoinOutcome;
use crate::session::SessionHandle;

fn party_reply(
    p: &Pipeline,
    cid: &str,
    party_id: Uuid,
    self_presence: arena_proto::Presence,
) -> ApiResult<Option<Envelope>> {
    let (open, max_size, leader, presences) = p
        .nexus()
        .parties
        .describe(&party_id)
        .ok_or_else(|| ApiError::NotFound(format!("party {party_id}")))?;
    Ok(Some(Envelope::new(
        cid,
        Payload::Party {
            party_id,
            open,
            max_size: max_size as u32,
            leader,
            presences,
            self_presence,
        },
    )))
}

pub(super) fn create(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    open: bool,
    max_size: u32,
) -> ApiResult<Option<Envelope>> {
    if !(1..=256).contains(&max_size) {
        return Err(ApiError::InvalidArgument(
            "party max_size must be within [1,256]".to_string(),
        ));
    }

    let party_id = p
        .nexus()
        .parties
        .create(p.self_id(session), open, max_size as usize);
    let self_presence = p.self_presence(session, Stream::party(party_id), false, false);
    p.nexus().tracker.track(
        session.context(),
        session.session_id,
        self_presence.stream.clone(),
        session.user_id,
        self_presence.meta.clone(),
        true,
    );
    party_reply(p, cid, party_id, self_presence)
}

pub(super) fn join(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    party_id: Uuid,
) -> ApiResult<Option<Envelope>> {
    let self_presence = p.self_presence(session, Stream::party(party_id), false, false);

    match p.nexus().parties.join(&party_id, self_presence.clone())? {
        JoinOutcome::Admitted => {
            p.nexus().tracker.track(
                session.context(),
                session.session_id,
                self_presence.stream.clone(),
                session.user_id,
                self_presence.meta.clone(),
                true,
            );
            party_reply(p, cid, party_id, self_presence)
        }
        JoinOutcome::Pending => {
            if let Some(leader) = p.nexus().parties.leader(&party_id) {
                p.nexus().router.send_to_presence_ids(
                    &[leader],
                    Envelope::push(Payload::PartyJoinRequest {
                        party_id,
                        presences: vec![self_presence],
                    }),
                    true,
                );
            }
            Ok(Some(Envelope::new(cid, Payload::Ack {})))
        }
    }
}

pub(super) fn accept(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    party_id: Uuid,
    target: PresenceId,
) -> ApiResult<Option<Envelope>> {
    let accepted = p
        .nexus()
        .parties
        .accept(&party_id, &p.self_id(session), &target)?;
    p.nexus().tracker.track(
        session.context(),
        accepted.id.session_id,
        Stream::party(party_id),
        accepted.user_id,
        accepted.meta.clone(),
        true,
    );
    Ok(Some(Envelope::new(cid, Payload::Ack {})))
}

pub(super) fn remove(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    party_id: Uuid,
    target: PresenceId,
) -> ApiResult<Option<Envelope>> {
    let removed = p
        .nexus()
        .parties
        .remove(&party_id, &p.self_id(session), &target)?;
    if let Some(member) = removed {
        p.nexus().tracker.untrack(
            member.id.session_id,
            Stream::party(party_id),
            member.user_id,
        );
    }
    Ok(Some(Envelope::new(cid, Payload::Ack {})))
}

pub(super) fn promote(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    party_id: Uuid,
    target: PresenceId,
) -> ApiResult<Option<Envelope>> {
    p.nexus()
        .parties
        .promote(&party_id, &p.self_id(session), &target)?;
    p.nexus().router.send_to_stream(
        &Stream::party(party_id),
        Envelope::push(Payload::PartyLeader {
            party_id,
            presence: target,
        }),
        true,
    );
    Ok(Some(Envelope::new(cid, Payload::Ack {})))
}

pub(super) fn leave(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    party_id: Uuid,
) -> ApiResult<Option<Envelope>> {
    if !p.nexus().parties.contains(&party_id) {
        return Err(ApiError::NotFound(format!("party {party_id}")));
    }
    p.nexus().tracker.untrack(
        session.session_id,
        Stream::party(party_id),
        session.user_id,
    );
    Ok(Some(Envelope::new(cid, Payload::Ack {})))
}

pub(super) fn data_send(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    party_id: Uuid,
    op_code: i64,
    data: Vec<u8>,
) -> ApiResult<Option<Envelope>> {
    let self_id = p.self_id(session);
    if !p.nexus().parties.is_member(&party_id, &self_id) {
        return Err(ApiError::PermissionDenied("not in party".to_string()));
    }
    p.nexus().router.send_to_stream(
        &Stream::party(party_id),
        Envelope::push(Payload::PartyData {
            party_id,
            presence: self_id,
            op_code,
            data,
        }),
        true,
    );
    Ok(None)
}
