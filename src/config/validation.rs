//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.

use std::path::Path;

use thiserror::Error;

use super::Config;

/// Validation errors for configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("server.name is required")]
    MissingNodeName,
    #[error("server.name must not contain '.' or whitespace, got {0:?}")]
    InvalidNodeName(String),
    #[error("listen.realtime_addr is not a valid socket address: {0}")]
    InvalidRealtimeAddr(String),
    #[error("cluster.listen_addr is not a valid socket address: {0}")]
    InvalidClusterAddr(String),
    #[error("cluster peer {0:?} has an empty addr")]
    EmptyPeerAddr(String),
    #[error("cluster peer name {0:?} duplicates another peer")]
    DuplicatePeerName(String),
    #[error("cluster peer name {0:?} is this node's own name")]
    SelfPeer(String),
    #[error("limits.{0} must be greater than zero")]
    ZeroLimit(&'static str),
    #[error("database.path parent directory does not exist: {0}")]
    DatabasePathInvalid(String),
    #[error("scheduled entity id {0:?} is not a UUID")]
    InvalidScheduleId(String),
    #[error("cron pattern {0:?} does not parse: {1}")]
    InvalidCronPattern(String, String),
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let name = &config.server.name;
    if name.is_empty() {
        errors.push(ValidationError::MissingNodeName);
    } else if name.contains('.') || name.chars().any(char::is_whitespace) {
        errors.push(ValidationError::InvalidNodeName(name.clone()));
    }

    if config
        .listen
        .realtime_addr
        .parse::<std::net::SocketAddr>()
        .is_err()
    {
        errors.push(ValidationError::InvalidRealtimeAddr(
            config.listen.realtime_addr.clone(),
        ));
    }

    if let Some(addr) = &config.cluster.listen_addr {
        if addr.parse::<std::net::SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidClusterAddr(addr.clone()));
        }
    }

    let mut seen = std::collections::HashSet::new();
    for peer in &config.cluster.peers {
        if peer.addr.is_empty() {
            errors.push(ValidationError::EmptyPeerAddr(peer.name.clone()));
        }
        if !seen.insert(peer.name.clone()) {
            errors.push(ValidationError::DuplicatePeerName(peer.name.clone()));
        }
        if peer.name == config.server.name {
            errors.push(ValidationError::SelfPeer(peer.name.clone()));
        }
    }

    let limits = &config.limits;
    for (value, field) in [
        (limits.session_outbound_queue, "session_outbound_queue"),
        (limits.tracker_event_queue, "tracker_event_queue"),
        (limits.match_inbound_scale, "match_inbound_scale"),
        (limits.peer_outbound_queue, "peer_outbound_queue"),
    ] {
        if value == 0 {
            errors.push(ValidationError::ZeroLimit(field));
        }
    }

    if let Some(db) = &config.database {
        let db_path = Path::new(&db.path);
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                errors.push(ValidationError::DatabasePathInvalid(db.path.clone()));
            }
        }
    }

    fn check_cron(pattern: &str) -> Option<ValidationError> {
        croner::Cron::new(pattern).parse().err().map(|e| {
            ValidationError::InvalidCronPattern(pattern.to_string(), e.to_string())
        })
    }
    for tournament in &config.tournaments {
        if uuid::Uuid::parse_str(&tournament.id).is_err() {
            errors.push(ValidationError::InvalidScheduleId(tournament.id.clone()));
        }
        if let Some(err) = tournament.cron.as_deref().and_then(check_cron) {
            errors.push(err);
        }
    }
    for board in &config.leaderboards {
        if uuid::Uuid::parse_str(&board.id).is_err() {
            errors.push(ValidationError::InvalidScheduleId(board.id.clone()));
        }
        if let Some(err) = check_cron(&board.cron) {
            errors.push(err);
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}
