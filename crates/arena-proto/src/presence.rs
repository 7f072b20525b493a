//! Presence tuples.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stream::Stream;

/// Cluster-wide identity of one session: the node it lives on plus its
/// session id. A session holds one `PresenceId` but may appear on many
/// streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresenceId {
    pub node: String,
    pub session_id: Uuid,
}

/// Why a presence event was emitted. Set by the tracker on state
/// transitions; `Unknown` only appears on presences that never left the
/// index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceReason {
    Unknown,
    Join,
    Update,
    Leave,
    Disconnect,
}

/// Session wire encoding, fixed per connection at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionFormat {
    Json,
    Binary,
}

/// Mutable presence metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub format: SessionFormat,
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub persistence: bool,
    pub reason: PresenceReason,
}

impl PresenceMeta {
    pub fn new(format: SessionFormat, username: impl Into<String>) -> Self {
        Self {
            format,
            username: username.into(),
            status: String::new(),
            hidden: false,
            persistence: true,
            reason: PresenceReason::Unknown,
        }
    }
}

/// The fact that a particular session is on a particular stream as a
/// particular user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub id: PresenceId,
    pub stream: Stream,
    pub user_id: Uuid,
    pub meta: PresenceMeta,
}
