//! Wire protocol types shared by the arenad daemon and its clients.
//!
//! The realtime protocol is a typed envelope with a `cid` correlation id and
//! one payload variant per operation. A session speaks either framed JSON or
//! framed MessagePack; both encodings are derived from the same serde types.
//! The cluster protocol reuses the presence/stream tuples and is always
//! MessagePack.

mod cluster;
mod envelope;
mod error;
mod presence;
mod stream;

pub mod b64;

pub use cluster::ClusterEnvelope;
pub use envelope::{
    ChannelMessage, Envelope, MatchmakerUser, Payload, QueryItem, WireError,
};
pub use error::{CodecError, ErrorCode};
pub use presence::{Presence, PresenceId, PresenceMeta, PresenceReason, SessionFormat};
pub use stream::{InvalidStreamMode, Stream, StreamMode};
