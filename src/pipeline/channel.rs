//! Chat channel join/leave/send handlers.

use std::sync::Arc;

use arena_proto::{Envelope, Payload, Stream, StreamMode};
use uuid::Uuid;

use super::Pipeline;
use crate::chat;
use crate::error::{ApiError, ApiResult};
use crate::session::SessionHandle;

const MAX_ROOM_NAME: usize = 64;
const MAX_CONTENT_LEN: usize = 4096;

fn is_chat_mode(mode: StreamMode) -> bool {
    matches!(
        mode,
        StreamMode::ChatRoom | StreamMode::DirectMessage | StreamMode::Group
    )
}

pub(super) async fn join(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    target: String,
    mode: StreamMode,
    persistence: bool,
    hidden: bool,
) -> ApiResult<Option<Envelope>> {
    let stream = match mode {
        StreamMode::ChatRoom => {
            if target.is_empty() || target.len() > MAX_ROOM_NAME {
                return Err(ApiError::InvalidArgument(format!(
                    "room name must be 1..={MAX_ROOM_NAME} bytes"
                )));
            }
            if target.chars().any(char::is_control) {
                return Err(ApiError::InvalidArgument(
                    "room name contains control characters".to_string(),
                ));
            }
            Stream::chat_room(target)
        }
        StreamMode::DirectMessage => {
            let peer = Uuid::parse_str(&target)
                .map_err(|_| ApiError::InvalidArgument("invalid peer user id".to_string()))?;
            if peer == session.user_id {
                return Err(ApiError::InvalidArgument(
                    "cannot direct message yourself".to_string(),
                ));
            }
            if let Some(db) = &p.nexus().db {
                if !db.users().exists(peer).await? {
                    return Err(ApiError::NotFound(format!("user {peer}")));
                }
            }
            Stream::direct_message(session.user_id, peer)
        }
        StreamMode::Group => {
            let group = Uuid::parse_str(&target)
                .map_err(|_| ApiError::InvalidArgument("invalid group id".to_string()))?;
            Stream::group(group)
        }
        other => {
            return Err(ApiError::InvalidArgument(format!(
                "mode {:?} is not a chat channel",
                u8::from(other)
            )));
        }
    };

    let self_presence = p.self_presence(session, stream.clone(), hidden, persistence);
    p.nexus().tracker.track(
        session.context(),
        session.session_id,
        stream.clone(),
        session.user_id,
        self_presence.meta.clone(),
        true,
    );

    Ok(Some(Envelope::new(
        cid,
        Payload::Channel {
            channel_id: stream.encode_id(),
            presences: p.nexus().tracker.list_by_stream(&stream, false, false),
            self_presence,
        },
    )))
}

fn decode_chat_stream(channel_id: &str) -> ApiResult<Stream> {
    let stream = Stream::decode_id(channel_id)
        .ok_or_else(|| ApiError::InvalidArgument("malformed channel id".to_string()))?;
    if !is_chat_mode(stream.mode) {
        return Err(ApiError::InvalidArgument(
            "channel id does not address a chat stream".to_string(),
        ));
    }
    Ok(stream)
}

pub(super) fn leave(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    channel_id: &str,
) -> ApiResult<Option<Envelope>> {
    let stream = decode_chat_stream(channel_id)?;
    p.nexus()
        .tracker
        .untrack(session.session_id, stream, session.user_id);
    Ok(Some(Envelope::new(cid, Payload::Ack {})))
}

pub(super) async fn message_send(
    p: &Pipeline,
    session: &Arc<SessionHandle>,
    cid: &str,
    channel_id: &str,
    content: &str,
) -> ApiResult<Option<Envelope>> {
    let stream = decode_chat_stream(channel_id)?;
    if content.len() > MAX_CONTENT_LEN {
        return Err(ApiError::InvalidArgument(format!(
            "content exceeds {MAX_CONTENT_LEN} bytes"
        )));
    }

    let member = p
        .nexus()
        .tracker
        .get_local_by_session_id_stream_user_id(session.session_id, &stream, session.user_id)
        .ok_or_else(|| ApiError::PermissionDenied("not on channel".to_string()))?;

    let message = chat::send_message(
        p.nexus().db.as_ref(),
        &p.nexus().router,
        &stream,
        session.user_id,
        &session.username,
        content,
        member.meta.persistence,
    )
    .await?;

    Ok(Some(Envelope::new(
        cid,
        Payload::ChannelMessageAck {
            channel_id: message.channel_id,
            message_id: message.message_id,
            code: message.code,
            username: message.username,
            create_time_ms: message.create_time_ms,
            persistent: message.persistent,
        },
    )))
}
