//! Matchmaker add/remove handlers.

use std::collections::HashMap;
use std::sync::Arc;

use arena_proto::{Envelope, Payload, QueryItem};
use uuid::Uuid;

use super::Pipeline;
use crate::error::{ApiError, ApiResult};
use crate::matchmaker::MatchmakerEntry;
use crate::session::SessionHandle;

#[allow(clippy::too_many_arguments)]
pub(super) fn add(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    min_count: u32,
    max_count: u32,
    query: Vec<QueryItem>,
    string_properties: HashMap<String, String>,
    numeric_properties: HashMap<String, f64>,
) -> ApiResult<Option<Envelope>> {
    let entry = MatchmakerEntry {
        ticket: Uuid::nil(),
        presence: p.self_id(session),
        user_id: session.user_id,
        username: session.username.clone(),
        string_properties,
        numeric_properties,
    };
    let ticket = p
        .nexus()
        .matchmaker
        .add(min_count, max_count, query, vec![entry], None)?;
    Ok(Some(Envelope::new(cid, Payload::MatchmakerTicket { ticket })))
}

pub(super) fn remove(p: &Pipeline, cid: &str, ticket: Uuid) -> ApiResult<Option<Envelope>> {
    if !p.nexus().matchmaker.remove(&ticket) {
        return Err(ApiError::NotFound(format!("ticket {ticket}")));
    }
    Ok(Some(Envelope::new(cid, Payload::Ack {})))
}
