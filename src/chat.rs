//! Chat send core.
//!
//! Validates that content is a JSON object, stamps a message id and server
//! timestamp, optionally persists, and fans the message out on the
//! channel's stream. Persistence failure aborts the send; fan-out failure
//! is logged but never fails the ack.

use arena_proto::{ChannelMessage, Envelope, Payload, Stream};
use uuid::Uuid;

use crate::db::{Database, MessageRow};
use crate::error::{ApiError, ApiResult};
use crate::router::Router;

/// Content must be a JSON object: first significant byte `{` and a valid
/// object body.
fn validate_content(content: &str) -> ApiResult<()> {
    let trimmed = content.trim_start();
    if !trimmed.starts_with('{') {
        return Err(ApiError::InvalidArgument(
            "message content must be a JSON object".to_string(),
        ));
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) if value.is_object() => Ok(()),
        _ => Err(ApiError::InvalidArgument(
            "message content must be a JSON object".to_string(),
        )),
    }
}

/// Send one chat message on `stream`. Returns the fanned-out message for
/// the sender's ack.
pub async fn send_message(
    db: Option<&Database>,
    router: &Router,
    stream: &Stream,
    sender_id: Uuid,
    username: &str,
    content: &str,
    persist: bool,
) -> ApiResult<ChannelMessage> {
    validate_content(content)?;

    let message = ChannelMessage {
        channel_id: stream.encode_id(),
        message_id: Uuid::new_v4(),
        code: 0,
        sender_id,
        username: username.to_string(),
        content: content.to_string(),
        create_time_ms: chrono::Utc::now().timestamp_millis(),
        persistent: persist,
    };

    if persist {
        if let Some(db) = db {
            let row = MessageRow {
                id: message.message_id,
                stream: stream.clone(),
                code: message.code,
                sender_id,
                username: username.to_string(),
                content: content.to_string(),
                create_time_ms: message.create_time_ms,
                update_time_ms: message.create_time_ms,
            };
            db.messages()
                .insert(&row)
                .await
                .map_err(|e| ApiError::Internal(format!("message insert: {e}")))?;
        }
    }

    // Fan-out failure is reflected as absence of delivery only.
    router.send_to_stream(
        stream,
        Envelope::push(Payload::ChannelMessage(message.clone())),
        true,
    );
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_bodies_are_accepted() {
        assert!(validate_content(r#"{"a":1}"#).is_ok());
        assert!(validate_content("  {\"nested\":{\"b\":2}}").is_ok());
    }

    #[test]
    fn non_object_bodies_are_rejected() {
        for bad in ["[1]", "\"str\"", "42", "", "   ", "{broken", "null"] {
            assert!(validate_content(bad).is_err(), "accepted {bad:?}");
        }
    }
}
