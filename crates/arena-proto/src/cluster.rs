//! Peer-to-peer cluster envelope.
//!
//! Every frame on a cluster link is one `ClusterEnvelope`, MessagePack
//! encoded inside a length-delimited frame. Tracker deltas are fire and
//! forget; `Message` carries an already-encoded realtime envelope to
//! sessions homed on the receiving node.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::CodecError;
use crate::presence::{Presence, PresenceId, PresenceReason};
use crate::stream::{Stream, StreamMode};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum ClusterEnvelope {
    /// Link handshake, sent by the dialing node first.
    Hello { node: String },
    /// Handshake acknowledgement from the accepting node.
    Welcome { node: String },
    Ping,
    Pong,

    /// A presence was tracked or its meta updated; `meta.reason`
    /// distinguishes join from update. Receivers apply without
    /// re-broadcasting.
    Track { presence: Presence },
    Untrack {
        id: PresenceId,
        stream: Stream,
        user_id: Uuid,
    },
    UntrackAll {
        id: PresenceId,
        reason: PresenceReason,
    },
    UntrackByMode {
        id: PresenceId,
        modes: Vec<StreamMode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip_stream: Option<Stream>,
    },
    UntrackByStream { stream: Stream },

    /// Point-to-point delivery of a realtime envelope to sessions homed on
    /// the receiving node.
    Message {
        sessions: Vec<Uuid>,
        envelope: Envelope,
        reliable: bool,
    },

    /// Ask the peer for its full local presence snapshot.
    SnapshotRequest,
    /// Full local presence snapshot of `node`; the receiver merges it and
    /// sweeps stale entries tagged with that node.
    Snapshot {
        node: String,
        presences: Vec<Presence>,
    },
}

impl ClusterEnvelope {
    pub fn to_frame(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_frame(raw: &[u8]) -> Result<Self, CodecError> {
        Ok(rmp_serde::from_slice(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;
    use crate::presence::{PresenceMeta, SessionFormat};

    #[test]
    fn frame_round_trip() {
        let env = ClusterEnvelope::Track {
            presence: Presence {
                id: PresenceId {
                    node: "n2".to_string(),
                    session_id: Uuid::new_v4(),
                },
                stream: Stream::status(Uuid::new_v4()),
                user_id: Uuid::new_v4(),
                meta: PresenceMeta::new(SessionFormat::Binary, "grace"),
            },
        };
        let back = ClusterEnvelope::from_frame(&env.to_frame().unwrap()).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn message_round_trip() {
        let env = ClusterEnvelope::Message {
            sessions: vec![Uuid::new_v4()],
            envelope: Envelope::push(Payload::Pong {}),
            reliable: true,
        };
        let back = ClusterEnvelope::from_frame(&env.to_frame().unwrap()).unwrap();
        assert_eq!(env, back);
    }
}
