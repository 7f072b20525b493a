//! Stream addressing.
//!
//! A stream is a four-tuple addressing a fan-out domain. Two streams are the
//! same stream iff all four fields compare equal.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Mode partitions the stream namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum StreamMode {
    /// Per-user status feed (followers receive status presence events).
    Status,
    /// Named chat room.
    ChatRoom,
    /// Direct message between exactly two users.
    DirectMessage,
    /// Group chat bound to a persisted group id.
    Group,
    /// Relayed (non-authoritative) match.
    MatchRelayed,
    /// Server-authoritative match.
    MatchAuthoritative,
    /// Party.
    Party,
}

impl From<StreamMode> for u8 {
    fn from(mode: StreamMode) -> u8 {
        match mode {
            StreamMode::Status => 0,
            StreamMode::ChatRoom => 1,
            StreamMode::DirectMessage => 2,
            StreamMode::Group => 3,
            StreamMode::MatchRelayed => 4,
            StreamMode::MatchAuthoritative => 5,
            StreamMode::Party => 6,
        }
    }
}

/// Error for an out-of-range stream mode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid stream mode {0}")]
pub struct InvalidStreamMode(pub u8);

impl TryFrom<u8> for StreamMode {
    type Error = InvalidStreamMode;

    fn try_from(value: u8) -> Result<Self, InvalidStreamMode> {
        match value {
            0 => Ok(StreamMode::Status),
            1 => Ok(StreamMode::ChatRoom),
            2 => Ok(StreamMode::DirectMessage),
            3 => Ok(StreamMode::Group),
            4 => Ok(StreamMode::MatchRelayed),
            5 => Ok(StreamMode::MatchAuthoritative),
            6 => Ok(StreamMode::Party),
            other => Err(InvalidStreamMode(other)),
        }
    }
}

/// A presence-addressable fan-out domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stream {
    pub mode: StreamMode,
    #[serde(default = "Uuid::nil", skip_serializing_if = "Uuid::is_nil")]
    pub subject: Uuid,
    #[serde(default = "Uuid::nil", skip_serializing_if = "Uuid::is_nil")]
    pub subcontext: Uuid,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
}

impl Stream {
    /// The status feed of a single user.
    pub fn status(user_id: Uuid) -> Self {
        Self {
            mode: StreamMode::Status,
            subject: user_id,
            subcontext: Uuid::nil(),
            label: String::new(),
        }
    }

    /// A named chat room.
    pub fn chat_room(label: impl Into<String>) -> Self {
        Self {
            mode: StreamMode::ChatRoom,
            subject: Uuid::nil(),
            subcontext: Uuid::nil(),
            label: label.into(),
        }
    }

    /// The direct-message stream between two users.
    ///
    /// The pair is order-normalized so both sides address the same stream.
    pub fn direct_message(a: Uuid, b: Uuid) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self {
            mode: StreamMode::DirectMessage,
            subject: lo,
            subcontext: hi,
            label: String::new(),
        }
    }

    /// The chat stream of a persisted group.
    pub fn group(group_id: Uuid) -> Self {
        Self {
            mode: StreamMode::Group,
            subject: group_id,
            subcontext: Uuid::nil(),
            label: String::new(),
        }
    }

    /// The data stream of a match.
    pub fn match_stream(match_id: Uuid, authoritative: bool) -> Self {
        Self {
            mode: if authoritative {
                StreamMode::MatchAuthoritative
            } else {
                StreamMode::MatchRelayed
            },
            subject: match_id,
            subcontext: Uuid::nil(),
            label: String::new(),
        }
    }

    /// The stream of a party.
    pub fn party(party_id: Uuid) -> Self {
        Self {
            mode: StreamMode::Party,
            subject: party_id,
            subcontext: Uuid::nil(),
            label: String::new(),
        }
    }

    /// Encode the stream as an opaque channel id usable in client payloads.
    pub fn encode_id(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            u8::from(self.mode),
            self.subject.as_simple(),
            self.subcontext.as_simple(),
            self.label
        )
    }

    /// Decode a channel id produced by [`Stream::encode_id`].
    pub fn decode_id(id: &str) -> Option<Self> {
        let mut parts = id.splitn(4, '.');
        let mode = StreamMode::try_from(parts.next()?.parse::<u8>().ok()?).ok()?;
        let subject = Uuid::parse_str(parts.next()?).ok()?;
        let subcontext = Uuid::parse_str(parts.next()?).ok()?;
        let label = parts.next()?.to_string();
        Some(Self {
            mode,
            subject,
            subcontext,
            label,
        })
    }
}
