//! The matchmaker: a pool of tickets matched on a configured interval.
//!
//! A ticket carries one or more entries (solo session or whole party), a
//! size band, required query items, and the properties other tickets'
//! queries are evaluated against. A matching pass assembles mutually
//! satisfying sets inside the band, invokes the matchmaker-matched runtime
//! hook, then hands the result to the match registry (relayed match when no
//! hook claims it).

pub mod party;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arena_proto::{Envelope, Payload, PresenceId, QueryItem};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ApiError;
use crate::matches::MatchRegistry;
use crate::router::Router;
use crate::runtime::ExtensionRuntime;
use arena_proto::MatchmakerUser;

/// One user inside a ticket.
#[derive(Debug, Clone)]
pub struct MatchmakerEntry {
    pub ticket: Uuid,
    pub presence: PresenceId,
    pub user_id: Uuid,
    pub username: String,
    pub string_properties: HashMap<String, String>,
    pub numeric_properties: HashMap<String, f64>,
}

impl MatchmakerEntry {
    fn satisfies(&self, item: &QueryItem) -> bool {
        match item {
            QueryItem::Term { property, value } => {
                self.string_properties.get(property) == Some(value)
            }
            QueryItem::Gt { property, value } => {
                self.numeric_properties.get(property).is_some_and(|v| v > value)
            }
            QueryItem::Geq { property, value } => {
                self.numeric_properties.get(property).is_some_and(|v| v >= value)
            }
            QueryItem::Lt { property, value } => {
                self.numeric_properties.get(property).is_some_and(|v| v < value)
            }
            QueryItem::Leq { property, value } => {
                self.numeric_properties.get(property).is_some_and(|v| v <= value)
            }
        }
    }
}

/// One matchmaking ticket.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub ticket: Uuid,
    pub min_count: u32,
    pub max_count: u32,
    pub query: Vec<QueryItem>,
    pub entries: Vec<MatchmakerEntry>,
    pub party_id: Option<Uuid>,
    /// Monotonic insertion order, oldest tickets seed sets first.
    seq: u64,
}

impl Ticket {
    /// Every entry of `other` must satisfy every query item of `self`.
    fn accepts(&self, other: &Ticket) -> bool {
        self.query
            .iter()
            .all(|item| other.entries.iter().all(|entry| entry.satisfies(item)))
    }
}

/// A completed set from one matching pass.
pub struct MatchedSet {
    pub tickets: Vec<Ticket>,
}

impl MatchedSet {
    pub fn entries(&self) -> Vec<MatchmakerEntry> {
        self.tickets
            .iter()
            .flat_map(|t| t.entries.iter().cloned())
            .collect()
    }
}

pub struct Matchmaker {
    tickets: DashMap<Uuid, Ticket>,
    by_session: DashMap<Uuid, Vec<Uuid>>,
    max_tickets: usize,
    seq: Mutex<u64>,
}

impl Matchmaker {
    pub fn new(max_tickets: usize) -> Arc<Self> {
        Arc::new(Self {
            tickets: DashMap::new(),
            by_session: DashMap::new(),
            max_tickets,
            seq: Mutex::new(0),
        })
    }

    /// Add a ticket to the pool.
    pub fn add(
        &self,
        min_count: u32,
        max_count: u32,
        query: Vec<QueryItem>,
        entries: Vec<MatchmakerEntry>,
        party_id: Option<Uuid>,
    ) -> Result<Uuid, ApiError> {
        if min_count < 2 || max_count < min_count {
            return Err(ApiError::InvalidArgument(
                "count band must satisfy 2 <= min <= max".to_string(),
            ));
        }
        if entries.is_empty() {
            return Err(ApiError::InvalidArgument("ticket has no entries".to_string()));
        }
        if entries.len() > max_count as usize {
            return Err(ApiError::InvalidArgument(
                "more entries than max_count".to_string(),
            ));
        }
        if self.tickets.len() >= self.max_tickets {
            return Err(ApiError::Unavailable("matchmaker pool is full".to_string()));
        }

        let ticket_id = Uuid::new_v4();
        let seq = {
            let mut seq = self.seq.lock();
            *seq += 1;
            *seq
        };
        let entries: Vec<MatchmakerEntry> = entries
            .into_iter()
            .map(|mut e| {
                e.ticket = ticket_id;
                e
            })
            .collect();
        for entry in &entries {
            self.by_session
                .entry(entry.presence.session_id)
                .or_default()
                .push(entry.ticket);
        }
        self.tickets.insert(
            ticket_id,
            Ticket {
                ticket: ticket_id,
                min_count,
                max_count,
                query,
                entries,
                party_id,
                seq,
            },
        );
        Ok(ticket_id)
    }

    /// Remove one ticket. Returns false when it was not pooled.
    pub fn remove(&self, ticket: &Uuid) -> bool {
        match self.tickets.remove(ticket) {
            Some((_, removed)) => {
                for entry in &removed.entries {
                    self.unindex_session(entry.presence.session_id, ticket);
                }
                true
            }
            None => false,
        }
    }

    /// Drop every ticket the session participates in (disconnect path).
    pub fn remove_session(&self, session_id: Uuid) {
        let Some((_, ticket_ids)) = self.by_session.remove(&session_id) else {
            return;
        };
        for ticket_id in ticket_ids {
            if let Some((_, removed)) = self.tickets.remove(&ticket_id) {
                for entry in &removed.entries {
                    if entry.presence.session_id != session_id {
                        self.unindex_session(entry.presence.session_id, &ticket_id);
                    }
                }
            }
        }
    }

    fn unindex_session(&self, session_id: Uuid, ticket: &Uuid) {
        if let Some(mut list) = self.by_session.get_mut(&session_id) {
            list.retain(|t| t != ticket);
            if list.is_empty() {
                drop(list);
                self.by_session.remove(&session_id);
            }
        }
    }

    #[allow(dead_code)] // Available to the console surface
    pub fn ticket_count(&self) -> usize {
        self.tickets.len()
    }

    /// One matching pass: greedily assemble mutually satisfying sets inside
    /// overlapping size bands, oldest seed first. Matched tickets leave the
    /// pool.
    pub fn process(&self) -> Vec<MatchedSet> {
        let mut pool: Vec<Ticket> = self.tickets.iter().map(|t| t.clone()).collect();
        pool.sort_by_key(|t| t.seq);

        let mut matched_sets = Vec::new();
        let mut consumed: std::collections::HashSet<Uuid> = std::collections::HashSet::new();

        for seed_idx in 0..pool.len() {
            let seed = &pool[seed_idx];
            if consumed.contains(&seed.ticket) {
                continue;
            }

            let mut set: Vec<&Ticket> = vec![seed];
            let mut count = seed.entries.len() as u32;
            let mut min_needed = seed.min_count;
            let mut max_allowed = seed.max_count;

            for candidate in pool.iter().skip(seed_idx + 1) {
                if consumed.contains(&candidate.ticket) {
                    continue;
                }
                let next_count = count + candidate.entries.len() as u32;
                if next_count > max_allowed.min(candidate.max_count) {
                    continue;
                }
                // Mutual satisfaction against every member of the set.
                let compatible = set.iter().all(|member| {
                    member.accepts(candidate) && candidate.accepts(member)
                });
                if !compatible {
                    continue;
                }
                set.push(candidate);
                count = next_count;
                min_needed = min_needed.max(candidate.min_count);
                max_allowed = max_allowed.min(candidate.max_count);
                if count == max_allowed {
                    break;
                }
            }

            if count >= min_needed && set.len() > 1 {
                for ticket in &set {
                    consumed.insert(ticket.ticket);
                }
                matched_sets.push(MatchedSet {
                    tickets: set.into_iter().cloned().collect(),
                });
            }
        }

        for set in &matched_sets {
            for ticket in &set.tickets {
                self.remove(&ticket.ticket);
            }
        }
        matched_sets
    }

    /// Spawn the interval pass task.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        self: &Arc<Self>,
        interval_secs: u64,
        runtime: Arc<ExtensionRuntime>,
        matches: Arc<MatchRegistry>,
        router: Arc<Router>,
        parties: Arc<party::PartyRegistry>,
        shutdown: CancellationToken,
    ) {
        let matchmaker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let sets = matchmaker.process();
                        for set in sets {
                            matchmaker.complete_set(&runtime, &matches, &router, &parties, set);
                        }
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        });
    }

    /// Resolve a matched set into a match id and notify every entry.
    fn complete_set(
        &self,
        runtime: &ExtensionRuntime,
        matches: &MatchRegistry,
        router: &Router,
        parties: &party::PartyRegistry,
        set: MatchedSet,
    ) {
        let entries = set.entries();

        // The hook may claim the set with its own match; otherwise the
        // matched users meet in a relayed match.
        let match_id = match runtime.matchmaker_matched(&entries) {
            Some(id) => id,
            None => matches.create_relayed().match_id,
        };

        info!(
            match_id = %match_id,
            tickets = set.tickets.len(),
            users = entries.len(),
            "Matchmaker formed a match"
        );

        let users: Vec<MatchmakerUser> = entries
            .iter()
            .map(|e| MatchmakerUser {
                presence: e.presence.clone(),
                user_id: e.user_id,
                username: e.username.clone(),
                string_properties: e.string_properties.clone(),
                numeric_properties: e.numeric_properties.clone(),
            })
            .collect();

        for ticket in &set.tickets {
            if let Some(party_id) = ticket.party_id {
                parties.mark_matched(&party_id, match_id);
            }
            let envelope = Envelope::push(Payload::MatchmakerMatched {
                ticket: ticket.ticket,
                match_id: Some(match_id),
                users: users.clone(),
            });
            let recipients: Vec<PresenceId> =
                ticket.entries.iter().map(|e| e.presence.clone()).collect();
            router.send_to_presence_ids(&recipients, envelope, true);
        }
        debug!(match_id = %match_id, "Matchmaker notifications sent");
    }
}
