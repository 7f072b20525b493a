//! Parties: tracked groups of sessions sharing one matchmaker ticket.
//!
//! State machine: Open → Matching → Matched → Closed. Membership is the
//! party stream's presence set; the registry mirrors it to run the
//! leader/approval rules and to promote a new leader when the current one
//! leaves.

use std::sync::Arc;

use arena_proto::{Envelope, Payload, Presence, PresenceId, StreamMode};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::router::Router;
use crate::tracker::TrackerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyState {
    Open,
    Matching,
    Matched,
    Closed,
}

pub struct Party {
    pub party_id: Uuid,
    /// Open parties admit joiners directly; closed ones hold them for
    /// leader approval.
    pub open: bool,
    pub max_size: usize,
    pub leader: PresenceId,
    pub members: Vec<Presence>,
    pub pending: Vec<Presence>,
    pub state: PartyState,
    pub ticket: Option<Uuid>,
    pub match_id: Option<Uuid>,
}

/// Outcome of a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Track the presence on the party stream.
    Admitted,
    /// Held for approval; the leader gets a join request envelope.
    Pending,
}

#[derive(Default)]
pub struct PartyRegistry {
    parties: DashMap<Uuid, Mutex<Party>>,
}

impl PartyRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a party led by `leader`. Membership mirrors the party
    /// stream's presences: the caller tracks the leader after creation and
    /// the join event fills `members`.
    pub fn create(&self, leader: PresenceId, open: bool, max_size: usize) -> Uuid {
        let party_id = Uuid::new_v4();
        let party = Party {
            party_id,
            open,
            max_size: max_size.clamp(1, 256),
            leader,
            members: Vec::new(),
            pending: Vec::new(),
            state: PartyState::Open,
            ticket: None,
            match_id: None,
        };
        self.parties.insert(party_id, Mutex::new(party));
        party_id
    }

    pub fn contains(&self, party_id: &Uuid) -> bool {
        self.parties.contains_key(party_id)
    }

    /// Snapshot for building `Party` reply envelopes.
    pub fn describe(&self, party_id: &Uuid) -> Option<(bool, usize, PresenceId, Vec<Presence>)> {
        let entry = self.parties.get(party_id)?;
        let party = entry.lock();
        Some((
            party.open,
            party.max_size,
            party.leader.clone(),
            party.members.clone(),
        ))
    }

    /// A presence asks to join.
    pub fn join(&self, party_id: &Uuid, presence: Presence) -> ApiResult<JoinOutcome> {
        let entry = self
            .parties
            .get(party_id)
            .ok_or_else(|| ApiError::NotFound("party".to_string()))?;
        let mut party = entry.lock();
        if party.state == PartyState::Closed {
            return Err(ApiError::FailedPrecondition("party is closed".to_string()));
        }
        if party.members.len() >= party.max_size {
            return Err(ApiError::FailedPrecondition("party is full".to_string()));
        }
        if party.members.iter().any(|m| m.id == presence.id) {
            return Err(ApiError::FailedPrecondition(
                "already in the party".to_string(),
            ));
        }
        if party.open {
            return Ok(JoinOutcome::Admitted);
        }
        if !party.pending.iter().any(|p| p.id == presence.id) {
            party.pending.push(presence);
        }
        Ok(JoinOutcome::Pending)
    }

    /// Leader accepts a pending joiner; returns the presence to track.
    pub fn accept(
        &self,
        party_id: &Uuid,
        caller: &PresenceId,
        target: &PresenceId,
    ) -> ApiResult<Presence> {
        let entry = self
            .parties
            .get(party_id)
            .ok_or_else(|| ApiError::NotFound("party".to_string()))?;
        let mut party = entry.lock();
        if party.leader != *caller {
            return Err(ApiError::PermissionDenied(
                "only the leader may accept".to_string(),
            ));
        }
        if party.members.len() >= party.max_size {
            return Err(ApiError::FailedPrecondition("party is full".to_string()));
        }
        let idx = party
            .pending
            .iter()
            .position(|p| p.id == *target)
            .ok_or_else(|| ApiError::NotFound("join request".to_string()))?;
        Ok(party.pending.remove(idx))
    }

    /// Leader removes a member or a pending joiner. Returns the removed
    /// presence if it was a tracked member (the caller untracks it).
    pub fn remove(
        &self,
        party_id: &Uuid,
        caller: &PresenceId,
        target: &PresenceId,
    ) -> ApiResult<Option<Presence>> {
        let entry = self
            .parties
            .get(party_id)
            .ok_or_else(|| ApiError::NotFound("party".to_string()))?;
        let mut party = entry.lock();
        if party.leader != *caller {
            return Err(ApiError::PermissionDenied(
                "only the leader may remove".to_string(),
            ));
        }
        if party.leader == *target {
            return Err(ApiError::FailedPrecondition(
                "leader cannot remove itself".to_string(),
            ));
        }
        if let Some(idx) = party.pending.iter().position(|p| p.id == *target) {
            party.pending.remove(idx);
            return Ok(None);
        }
        let idx = party
            .members
            .iter()
            .position(|m| m.id == *target)
            .ok_or_else(|| ApiError::NotFound("member".to_string()))?;
        Ok(Some(party.members.remove(idx)))
    }

    /// Leader hands leadership to another member.
    pub fn promote(
        &self,
        party_id: &Uuid,
        caller: &PresenceId,
        target: &PresenceId,
    ) -> ApiResult<()> {
        let entry = self
            .parties
            .get(party_id)
            .ok_or_else(|| ApiError::NotFound("party".to_string()))?;
        let mut party = entry.lock();
        if party.leader != *caller {
            return Err(ApiError::PermissionDenied(
                "only the leader may promote".to_string(),
            ));
        }
        if party.leader == *target {
            return Err(ApiError::FailedPrecondition("already the leader".to_string()));
        }
        if !party.members.iter().any(|m| m.id == *target) {
            return Err(ApiError::NotFound("member".to_string()));
        }
        party.leader = target.clone();
        Ok(())
    }

    /// Is this presence a member?
    pub fn is_member(&self, party_id: &Uuid, id: &PresenceId) -> bool {
        self.parties
            .get(party_id)
            .map(|entry| entry.lock().members.iter().any(|m| m.id == *id))
            .unwrap_or(false)
    }

    pub fn leader(&self, party_id: &Uuid) -> Option<PresenceId> {
        self.parties.get(party_id).map(|e| e.lock().leader.clone())
    }

    #[allow(dead_code)] // Available to API handlers
    pub fn state(&self, party_id: &Uuid) -> Option<PartyState> {
        self.parties.get(party_id).map(|e| e.lock().state)
    }

    #[allow(dead_code)]
    pub fn ticket(&self, party_id: &Uuid) -> Option<Uuid> {
        self.parties.get(party_id).and_then(|e| e.lock().ticket)
    }

    #[allow(dead_code)]
    pub fn matched_id(&self, party_id: &Uuid) -> Option<Uuid> {
        self.parties.get(party_id).and_then(|e| e.lock().match_id)
    }

    #[allow(dead_code)] // Party matchmaking enters through the runtime surface
    pub fn set_ticket(&self, party_id: &Uuid, ticket: Option<Uuid>) {
        if let Some(entry) = self.parties.get(party_id) {
            let mut party = entry.lock();
            party.ticket = ticket;
            party.state = if ticket.is_some() {
                PartyState::Matching
            } else {
                PartyState::Open
            };
        }
    }

    pub fn mark_matched(&self, party_id: &Uuid, match_id: Uuid) {
        if let Some(entry) = self.parties.get(party_id) {
            let mut party = entry.lock();
            party.state = PartyState::Matched;
            party.match_id = Some(match_id);
            party.ticket = None;
            info!(party = %party.party_id, match_id = %match_id, "Party matched");
        }
    }

    /// Mirror party-stream presence transitions into the state machine.
    /// Leader loss promotes the oldest remaining member; an emptied party
    /// closes and its registry entry is dropped.
    pub fn handle_presence_event(&self, event: &TrackerEvent, router: &Router) {
        for presence in &event.joins {
            if presence.stream.mode != StreamMode::Party {
                continue;
            }
            let party_id = presence.stream.subject;
            if let Some(entry) = self.parties.get(&party_id) {
                let mut party = entry.lock();
                if !party.members.iter().any(|m| m.id == presence.id) {
                    party.members.push(presence.clone());
                }
            }
        }

        for presence in &event.leaves {
            if presence.stream.mode != StreamMode::Party {
                continue;
            }
            let party_id = presence.stream.subject;
            let mut close_party = false;
            let mut new_leader: Option<PresenceId> = None;

            if let Some(entry) = self.parties.get(&party_id) {
                let mut party = entry.lock();
                party.members.retain(|m| m.id != presence.id);
                if party.members.is_empty() {
                    party.state = PartyState::Closed;
                    close_party = true;
                } else if party.leader == presence.id {
                    let promoted = party.members[0].id.clone();
                    party.leader = promoted.clone();
                    new_leader = Some(promoted);
                }
            }

            if close_party {
                self.parties.remove(&party_id);
                info!(party = %party_id, "Party closed, last member left");
            } else if let Some(leader) = new_leader {
                debug!(party = %party_id, leader = %leader.session_id, "Party leader promoted on leave");
                router.send_to_stream(
                    &arena_proto::Stream::party(party_id),
                    Envelope::push(Payload::PartyLeader {
                        party_id,
                        presence: leader,
                    }),
                    true,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_proto::{PresenceMeta, SessionFormat, Stream};

    fn presence(party_id: Uuid) -> Presence {
        Presence {
            id: PresenceId {
                node: "n1".to_string(),
                session_id: Uuid::new_v4(),
            },
            stream: Stream::party(party_id),
            user_id: Uuid::new_v4(),
            meta: PresenceMeta::new(SessionFormat::Json, "u"),
        }
    }

    /// Mirror the track the pipeline would perform after an admission.
    fn mirror_join(registry: &PartyRegistry, party_id: Uuid, joiner: &Presence, router: &Router) {
        registry.handle_presence_event(
            &TrackerEvent {
                joins: vec![Presence {
                    stream: Stream::party(party_id),
                    ..joiner.clone()
                }],
                ..Default::default()
            },
            router,
        );
    }

    #[test]
    fn open_party_admits_until_full() {
        let registry = PartyRegistry::new();
        let router = test_router();
        let leader = presence(Uuid::nil());
        let party_id = registry.create(leader.id.clone(), true, 2);
        mirror_join(&registry, party_id, &leader, &router);

        let joiner = presence(party_id);
        assert_eq!(
            registry.join(&party_id, joiner.clone()).unwrap(),
            JoinOutcome::Admitted
        );
        mirror_join(&registry, party_id, &joiner, &router);

        let overflow = registry.join(&party_id, presence(party_id));
        assert!(matches!(overflow, Err(ApiError::FailedPrecondition(_))));
    }

    #[test]
    fn closed_party_requires_leader_approval() {
        let registry = PartyRegistry::new();
        let router = test_router();
        let leader = presence(Uuid::nil());
        let party_id = registry.create(leader.id.clone(), false, 4);
        mirror_join(&registry, party_id, &leader, &router);

        let joiner = presence(party_id);
        assert_eq!(
            registry.join(&party_id, joiner.clone()).unwrap(),
            JoinOutcome::Pending
        );

        // Non-leader cannot accept.
        let stranger = presence(party_id);
        assert!(
            registry
                .accept(&party_id, &stranger.id, &joiner.id)
                .is_err()
        );

        let accepted = registry
            .accept(&party_id, &leader.id, &joiner.id)
            .unwrap();
        assert_eq!(accepted.id, joiner.id);
    }

    #[test]
    fn promote_requires_leader_and_membership() {
        let registry = PartyRegistry::new();
        let router = test_router();
        let leader = presence(Uuid::nil());
        let party_id = registry.create(leader.id.clone(), true, 4);
        mirror_join(&registry, party_id, &leader, &router);

        let member = presence(party_id);
        mirror_join(&registry, party_id, &member, &router);

        // Promote when already the leader is a precondition failure.
        assert!(matches!(
            registry.promote(&party_id, &leader.id, &leader.id),
            Err(ApiError::FailedPrecondition(_))
        ));

        registry.promote(&party_id, &leader.id, &member.id).unwrap();
        assert_eq!(registry.leader(&party_id), Some(member.id));
    }

    #[test]
    fn leader_leave_promotes_oldest_member() {
        let registry = PartyRegistry::new();
        let router = test_router();
        let leader = presence(Uuid::nil());
        let party_id = registry.create(leader.id.clone(), true, 4);
        let member = presence(party_id);

        mirror_join(&registry, party_id, &leader, &router);
        mirror_join(&registry, party_id, &member, &router);
        registry.handle_presence_event(
            &TrackerEvent {
                leaves: vec![Presence {
                    stream: Stream::party(party_id),
                    ..leader.clone()
                }],
                ..Default::default()
            },
            &router,
        );
        assert_eq!(registry.leader(&party_id), Some(member.id));
    }

    #[test]
    fn matchmaking_state_transitions() {
        let registry = PartyRegistry::new();
        let leader = presence(Uuid::nil());
        let party_id = registry.create(leader.id.clone(), true, 4);
        assert_eq!(registry.state(&party_id), Some(PartyState::Open));

        let ticket = Uuid::new_v4();
        registry.set_ticket(&party_id, Some(ticket));
        assert_eq!(registry.state(&party_id), Some(PartyState::Matching));
        assert_eq!(registry.ticket(&party_id), Some(ticket));

        let match_id = Uuid::new_v4();
        registry.mark_matched(&party_id, match_id);
        assert_eq!(registry.state(&party_id), Some(PartyState::Matched));
        assert_eq!(registry.matched_id(&party_id), Some(match_id));
        assert_eq!(registry.ticket(&party_id), None);

        registry.set_ticket(&party_id, None);
        assert_eq!(registry.state(&party_id), Some(PartyState::Open));
    }

    #[test]
    fn last_leave_closes_the_party() {
        let registry = PartyRegistry::new();
        let router = test_router();
        let leader = presence(Uuid::nil());
        let party_id = registry.create(leader.id.clone(), true, 4);

        mirror_join(&registry, party_id, &leader, &router);
        registry.handle_presence_event(
            &TrackerEvent {
                leaves: vec![Presence {
                    stream: Stream::party(party_id),
                    ..leader
                }],
                ..Default::default()
            },
            &router,
        );
        assert!(!registry.contains(&party_id));
    }

    /// A router over empty components; party tests only need its type.
    fn test_router() -> Arc<Router> {
        let (tracker, _events, _replica) = crate::tracker::Tracker::new("n1", 16, 16);
        let sessions = crate::session::SessionRegistry::new();
        let cluster = crate::cluster::ClusterManager::new(
            "n1",
            16,
            tokio_util::sync::CancellationToken::new(),
        );
        Router::new(tracker, sessions, cluster)
    }
}
