//! Status follow/unfollow/update handlers.
//!
//! A follower joins the target user's status stream as a hidden presence;
//! status owners are the visible presences on their own stream.

use std::sync::Arc;

use arena_proto::{Envelope, Payload, Presence, PresenceMeta, Stream};
use uuid::Uuid;

use super::Pipeline;
use crate::error::{ApiError, ApiResult};
use crate::session::SessionHandle;

const MAX_FOLLOW_TARGETS: usize = 100;
const MAX_STATUS_LEN: usize = 2048;

pub(super) async fn follow(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    user_ids: Vec<Uuid>,
    usernames: Vec<String>,
) -> ApiResult<Option<Envelope>> {
    if user_ids.is_empty() && usernames.is_empty() {
        return Err(ApiError::InvalidArgument("no follow targets".to_string()));
    }
    if user_ids.len() + usernames.len() > MAX_FOLLOW_TARGETS {
        return Err(ApiError::InvalidArgument(format!(
            "too many follow targets (max {MAX_FOLLOW_TARGETS})"
        )));
    }

    let mut targets = user_ids;
    if let Some(db) = &p.nexus().db {
        for id in &targets {
            if !db.users().exists(*id).await? {
                return Err(ApiError::NotFound(format!("user {id}")));
            }
        }
        for username in &usernames {
            match db.users().id_by_username(username).await? {
                Some(id) => targets.push(id),
                None => return Err(ApiError::NotFound(format!("username {username:?}"))),
            }
        }
    } else if !usernames.is_empty() {
        return Err(ApiError::NotFound("username lookup unavailable".to_string()));
    }
    targets.sort_unstable();
    targets.dedup();

    let tracker = &p.nexus().tracker;
    let mut presences: Vec<Presence> = Vec::new();
    for target in targets {
        let stream = Stream::status(target);
        let mut meta = PresenceMeta::new(session.format, session.username.clone());
        meta.hidden = true;
        tracker.track(
            session.context(),
            session.session_id,
            stream.clone(),
            session.user_id,
            meta,
            true,
        );
        presences.extend(tracker.list_by_stream(&stream, false, false));
    }

    Ok(Some(Envelope::new(cid, Payload::Status { presences })))
}

pub(super) fn unfollow(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    user_ids: Vec<Uuid>,
) -> ApiResult<Option<Envelope>> {
    if user_ids.is_empty() {
        return Err(ApiError::InvalidArgument("no unfollow targets".to_string()));
    }
    for target in user_ids {
        p.nexus().tracker.untrack(
            session.session_id,
            Stream::status(target),
            session.user_id,
        );
    }
    Ok(Some(Envelope::new(cid, Payload::Ack {})))
}

pub(super) fn update(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    status: Option<String>,
) -> ApiResult<Option<Envelope>> {
    let stream = Stream::status(session.user_id);
    match status {
        Some(status) => {
            if status.len() > MAX_STATUS_LEN {
                return Err(ApiError::InvalidArgument(format!(
                    "status exceeds {MAX_STATUS_LEN} bytes"
                )));
            }
            let mut meta = PresenceMeta::new(session.format, session.username.clone());
            meta.status = status;
            p.nexus().tracker.update(
                session.context(),
                session.session_id,
                stream,
                session.user_id,
                meta,
                true,
            );
        }
        // No status means appear offline: drop the own-status presence.
        None => {
            p.nexus()
                .tracker
                .untrack(session.session_id, stream, session.user_id);
        }
    }
    Ok(Some(Envelope::new(cid, Payload::Ack {})))
}
