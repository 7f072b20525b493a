//! The realtime pipeline.
//!
//! Routes an inbound envelope by payload variant. Every handler follows the
//! same shape: validate, run the before hook (which may mutate or reject),
//! apply the effect against tracker/router/registries, run the after hook,
//! reply. Handler errors are translated to wire error envelopes; nothing
//! internal leaks to the client.

mod channel;
mod match_ops;
mod matchmaker_ops;
mod party_ops;
mod rpc;
mod status;

use std::sync::Arc;

use arena_proto::{Envelope, Payload, Presence, PresenceId, PresenceMeta, Stream};
use tracing::{debug, error};

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::nexus::Nexus;
use crate::runtime::CallContext;
use crate::session::SessionHandle;

pub struct Pipeline {
    nexus: Arc<Nexus>,
}

impl Pipeline {
    pub fn new(nexus: Arc<Nexus>) -> Arc<Self> {
        Arc::new(Self { nexus })
    }

    /// Process one inbound envelope end to end.
    pub async fn dispatch(&self, session: &Arc<SessionHandle>, envelope: Envelope) {
        let cid = envelope.cid.clone();
        let ctx = CallContext::from_session(session);

        // Before hook: may rewrite, reject, or silently consume the frame.
        let envelope = match self.nexus.runtime.before_rt(&ctx, envelope) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return,
            Err(e) => {
                let api: ApiError = e.into();
                metrics::PIPELINE_ERRORS
                    .with_label_values(&[api.error_code()])
                    .inc();
                session.enqueue(Arc::new(api.to_envelope(&cid)), true);
                return;
            }
        };

        let input = envelope.clone();
        match self.route(session, &cid, envelope.payload).await {
            Ok(reply) => {
                if let Some(reply) = &reply {
                    session.enqueue(Arc::new(reply.clone()), true);
                }
                self.nexus.runtime.after_rt(&ctx, &input, reply.as_ref());
            }
            Err(api) => {
                if matches!(api, ApiError::Internal(_)) {
                    error!(tag = %input.payload.tag(), error = %api, "Handler internal error");
                } else {
                    debug!(tag = %input.payload.tag(), error = %api, "Handler rejected envelope");
                }
                metrics::PIPELINE_ERRORS
                    .with_label_values(&[api.error_code()])
                    .inc();
                session.enqueue(Arc::new(api.to_envelope(&cid)), true);
            }
        }
    }

    async fn route(
        &self,
        session: &Arc<SessionHandle>,
        cid: &str,
        payload: Payload,
    ) -> ApiResult<Option<Envelope>> {
        match payload {
            Payload::Ping {} => Ok(Some(Envelope::new(cid, Payload::Pong {}))),
            Payload::Pong {} => Ok(None),

            Payload::StatusFollow {
                user_ids,
                usernames,
            } => status::follow(self, session, cid, user_ids, usernames).await,
            Payload::StatusUnfollow { user_ids } => {
                status::unfollow(self, session, cid, user_ids)
            }
            Payload::StatusUpdate { status } => status::update(self, session, cid, status),

            Payload::ChannelJoin {
                target,
                mode,
                persistence,
                hidden,
            } => channel::join(self, session, cid, target, mode, persistence, hidden).await,
            Payload::ChannelLeave { channel_id } => {
                channel::leave(self, session, cid, &channel_id)
            }
            Payload::ChannelMessageSend {
                channel_id,
                content,
            } => channel::message_send(self, session, cid, &channel_id, &content).await,

            Payload::MatchCreate { name, params } => {
                match_ops::create(self, session, cid, name, params).await
            }
            Payload::MatchJoin { match_id, metadata } => {
                match_ops::join(self, session, cid, match_id, metadata).await
            }
            Payload::MatchLeave { match_id } => match_ops::leave(self, session, cid, match_id),
            Payload::MatchDataSend {
                match_id,
                op_code,
                data,
                presence_filter,
                reliable,
            } => match_ops::data_send(
                self,
                session,
                match_id,
                op_code,
                data,
                presence_filter,
                reliable,
            ),

            Payload::MatchmakerAdd {
                min_count,
                max_count,
                query,
                string_properties,
                numeric_properties,
            } => matchmaker_ops::add(
                self,
                session,
                cid,
                min_count,
                max_count,
                query,
                string_properties,
                numeric_properties,
            ),
            Payload::MatchmakerRemove { ticket } => {
                matchmaker_ops::remove(self, cid, ticket)
            }

            Payload::PartyCreate { open, max_size } => {
                party_ops::create(self, session, cid, open, max_size)
            }
            Payload::PartyJoin { party_id } => party_ops::join(self, session, cid, party_id),
            Payload::PartyLeave { party_id } => party_ops::leave(self, session, cid, party_id),
            Payload::PartyAccept { party_id, presence } => {
                party_ops::accept(self, session, cid, party_id, presence)
            }
            Payload::PartyRemove { party_id, presence } => {
                party_ops::remove(self, session, cid, party_id, presence)
            }
            Payload::PartyPromote { party_id, presence } => {
                party_ops::promote(self, session, cid, party_id, presence)
            }
            Payload::PartyDataSend {
                party_id,
                op_code,
                data,
            } => party_ops::data_send(self, session, party_id, op_code, data),

            Payload::Rpc { id, payload } => rpc::call(self, session, cid, &id, &payload),

            // Everything else is server-push only.
            other => Err(ApiError::InvalidArgument(format!(
                "unexpected payload {:?}",
                other.tag()
            ))),
        }
    }

    pub(crate) fn nexus(&self) -> &Nexus {
        &self.nexus
    }

    /// The session's own presence id on this node.
    pub(crate) fn self_id(&self, session: &SessionHandle) -> PresenceId {
        PresenceId {
            node: self.nexus.tracker.node().to_string(),
            session_id: session.session_id,
        }
    }

    /// Build the session's own presence for a stream.
    pub(crate) fn self_presence(
        &self,
        session: &SessionHandle,
        stream: Stream,
        hidden: bool,
        persistence: bool,
    ) -> Presence {
        let mut meta = PresenceMeta::new(session.format, session.username.clone());
        meta.hidden = hidden;
        meta.persistence = persistence;
        Presence {
            id: self.self_id(session),
            stream,
            user_id: session.user_id,
            meta,
        }
    }
}
