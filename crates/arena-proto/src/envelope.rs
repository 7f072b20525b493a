//! The realtime envelope.
//!
//! Every frame on a session is one `Envelope`: an optional `cid` correlation
//! id (set on request/response pairs, empty on server pushes) and a tagged
//! payload. Payload tags double as the hook keys for before/after realtime
//! interceptors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CodecError;
use crate::presence::{Presence, PresenceId};
use crate::stream::StreamMode;

/// Wire-visible error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
}

/// One persisted or fanned-out chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel_id: String,
    pub message_id: Uuid,
    pub code: i32,
    pub sender_id: Uuid,
    pub username: String,
    pub content: String,
    pub create_time_ms: i64,
    pub persistent: bool,
}

/// One matchmaker query item. All items are required; a candidate ticket
/// must satisfy every item of the querying ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QueryItem {
    Term { property: String, value: String },
    Gt { property: String, value: f64 },
    Geq { property: String, value: f64 },
    Lt { property: String, value: f64 },
    Leq { property: String, value: f64 },
}

/// A matched user inside a matchmaker result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchmakerUser {
    pub presence: PresenceId,
    pub user_id: Uuid,
    pub username: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub string_properties: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub numeric_properties: HashMap<String, f64>,
}

/// Tagged union over every realtime operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Payload {
    Error(WireError),
    Ping {},
    Pong {},
    /// Bare acknowledgement for requests with no data to return.
    Ack {},

    // Status feeds.
    StatusFollow {
        user_ids: Vec<Uuid>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        usernames: Vec<String>,
    },
    StatusUnfollow {
        user_ids: Vec<Uuid>,
    },
    StatusUpdate {
        status: Option<String>,
    },
    Status {
        presences: Vec<Presence>,
    },
    StatusPresenceEvent {
        joins: Vec<Presence>,
        leaves: Vec<Presence>,
    },

    // Chat channels.
    ChannelJoin {
        target: String,
        mode: StreamMode,
        persistence: bool,
        hidden: bool,
    },
    ChannelLeave {
        channel_id: String,
    },
    Channel {
        channel_id: String,
        presences: Vec<Presence>,
        self_presence: Presence,
    },
    ChannelMessageSend {
        channel_id: String,
        content: String,
    },
    ChannelMessageAck {
        channel_id: String,
        message_id: Uuid,
        code: i32,
        username: String,
        create_time_ms: i64,
        persistent: bool,
    },
    ChannelMessage(ChannelMessage),
    ChannelPresenceEvent {
        channel_id: String,
        joins: Vec<Presence>,
        leaves: Vec<Presence>,
    },

    // Matches.
    MatchCreate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },
    MatchJoin {
        match_id: Uuid,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        metadata: HashMap<String, String>,
    },
    MatchLeave {
        match_id: Uuid,
    },
    Match {
        match_id: Uuid,
        authoritative: bool,
        label: String,
        size: u32,
        presences: Vec<Presence>,
        self_presence: Presence,
    },
    MatchDataSend {
        match_id: Uuid,
        op_code: i64,
        #[serde(with = "crate::b64")]
        data: Vec<u8>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        presence_filter: Vec<PresenceId>,
        #[serde(default)]
        reliable: bool,
    },
    MatchData {
        match_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        presence: Option<Presence>,
        op_code: i64,
        #[serde(with = "crate::b64")]
        data: Vec<u8>,
    },
    MatchPresenceEvent {
        match_id: Uuid,
        joins: Vec<Presence>,
        leaves: Vec<Presence>,
    },

    // Matchmaker.
    MatchmakerAdd {
        min_count: u32,
        max_count: u32,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        query: Vec<QueryItem>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        string_properties: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        numeric_properties: HashMap<String, f64>,
    },
    MatchmakerTicket {
        ticket: Uuid,
    },
    MatchmakerRemove {
        ticket: Uuid,
    },
    MatchmakerMatched {
        ticket: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        match_id: Option<Uuid>,
        users: Vec<MatchmakerUser>,
    },

    // Parties.
    PartyCreate {
        open: bool,
        max_size: u32,
    },
    Party {
        party_id: Uuid,
        open: bool,
        max_size: u32,
        leader: PresenceId,
        presences: Vec<Presence>,
        self_presence: Presence,
    },
    PartyJoin {
        party_id: Uuid,
    },
    PartyJoinRequest {
        party_id: Uuid,
        presences: Vec<Presence>,
    },
    PartyLeave {
        party_id: Uuid,
    },
    PartyPromote {
        party_id: Uuid,
        presence: PresenceId,
    },
    PartyLeader {
        party_id: Uuid,
        presence: PresenceId,
    },
    PartyAccept {
        party_id: Uuid,
        presence: PresenceId,
    },
    PartyRemove {
        party_id: Uuid,
        presence: PresenceId,
    },
    PartyDataSend {
        party_id: Uuid,
        op_code: i64,
        #[serde(with = "crate::b64")]
        data: Vec<u8>,
    },
    PartyData {
        party_id: Uuid,
        presence: PresenceId,
        op_code: i64,
        #[serde(with = "crate::b64")]
        data: Vec<u8>,
    },
    PartyPresenceEvent {
        party_id: Uuid,
        joins: Vec<Presence>,
        leaves: Vec<Presence>,
    },

    // Runtime RPC, used in both directions.
    Rpc {
        id: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        payload: String,
    },
}

impl Payload {
    /// Stable tag of this payload, used as the before/after hook key.
    pub fn tag(&self) -> &'static str {
        match self {
            Payload::Error(_) => "error",
            Payload::Ping {} => "ping",
            Payload::Pong {} => "pong",
            Payload::Ack {} => "ack",
            Payload::StatusFollow { .. } => "status_follow",
            Payload::StatusUnfollow { .. } => "status_unfollow",
            Payload::StatusUpdate { .. } => "status_update",
            Payload::Status { .. } => "status",
            Payload::StatusPresenceEvent { .. } => "status_presence_event",
            Payload::ChannelJoin { .. } => "channel_join",
            Payload::ChannelLeave { .. } => "channel_leave",
            Payload::Channel { .. } => "channel",
            Payload::ChannelMessageSend { .. } => "channel_message_send",
            Payload::ChannelMessageAck { .. } => "channel_message_ack",
            Payload::ChannelMessage(_) => "channel_message",
            Payload::ChannelPresenceEvent { .. } => "channel_presence_event",
            Payload::MatchCreate { .. } => "match_create",
            Payload::MatchJoin { .. } => "match_join",
            Payload::MatchLeave { .. } => "match_leave",
            Payload::Match { .. } => "match",
            Payload::MatchDataSend { .. } => "match_data_send",
            Payload::MatchData { .. } => "match_data",
            Payload::MatchPresenceEvent { .. } => "match_presence_event",
            Payload::MatchmakerAdd { .. } => "matchmaker_add",
            Payload::MatchmakerTicket { .. } => "matchmaker_ticket",
            Payload::MatchmakerRemove { .. } => "matchmaker_remove",
            Payload::MatchmakerMatched { .. } => "matchmaker_matched",
            Payload::PartyCreate { .. } => "party_create",
            Payload::Party { .. } => "party",
            Payload::PartyJoin { .. } => "party_join",
            Payload::PartyJoinRequest { .. } => "party_join_request",
            Payload::PartyLeave { .. } => "party_leave",
            Payload::PartyPromote { .. } => "party_promote",
            Payload::PartyLeader { .. } => "party_leader",
            Payload::PartyAccept { .. } => "party_accept",
            Payload::PartyRemove { .. } => "party_remove",
            Payload::PartyDataSend { .. } => "party_data_send",
            Payload::PartyData { .. } => "party_data",
            Payload::PartyPresenceEvent { .. } => "party_presence_event",
            Payload::Rpc { .. } => "rpc",
        }
    }
}

/// One realtime frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id; empty on server-initiated pushes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cid: String,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(cid: impl Into<String>, payload: Payload) -> Self {
        Self {
            cid: cid.into(),
            payload,
        }
    }

    /// A server push without correlation id.
    pub fn push(payload: Payload) -> Self {
        Self {
            cid: String::new(),
            payload,
        }
    }

    pub fn to_json(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_binary(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_binary(raw: &[u8]) -> Result<Self, CodecError> {
        Ok(rmp_serde::from_slice(raw)?)
    }
}
