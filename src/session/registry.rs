//! Session registry: the node-local map of live sessions and their
//! outbound queues.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use arena_proto::{Envelope, SessionFormat};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::metrics;

/// Handle to one live session. Cloned freely; the outbound queue is the
/// only way to reach the connection's writer, which preserves per-session
/// send order.
pub struct SessionHandle {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub format: SessionFormat,
    /// Opaque variables attached at authentication, exposed to RPCs/hooks.
    pub vars: HashMap<String, String>,
    /// Token expiry (unix seconds); 0 when the fronting gateway sent none.
    pub expiry: i64,
    pub remote_addr: SocketAddr,
    outbound: mpsc::Sender<Arc<Envelope>>,
    cancel: CancellationToken,
    close_reason: Mutex<Option<String>>,
}

impl SessionHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: Uuid,
        user_id: Uuid,
        username: String,
        format: SessionFormat,
        vars: HashMap<String, String>,
        expiry: i64,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<Arc<Envelope>>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            user_id,
            username,
            format,
            vars,
            expiry,
            remote_addr,
            outbound,
            cancel,
            close_reason: Mutex::new(None),
        })
    }

    /// Enqueue an envelope on the outbound queue. Overflow means the client
    /// is not draining its socket: the session is closed as a slow
    /// consumer. Returns false when nothing was enqueued.
    pub fn enqueue(&self, envelope: Arc<Envelope>, _reliable: bool) -> bool {
        match self.outbound.try_send(envelope) {
            Ok(()) => {
                metrics::MESSAGES_SENT.inc();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::SLOW_CONSUMERS_CLOSED.inc();
                self.close("slow consumer");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Request the connection task to shut the session down.
    pub fn close(&self, reason: &str) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        self.cancel.cancel();
    }

    #[allow(dead_code)]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    /// Cancellation context handed to tracker operations on behalf of this
    /// session.
    pub fn context(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Node-local index of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, session: Arc<SessionHandle>) {
        self.sessions.insert(session.session_id, session);
        metrics::SESSIONS_CONNECTED.set(self.sessions.len() as i64);
    }

    pub fn unregister(&self, session_id: &Uuid) {
        self.sessions.remove(session_id);
        metrics::SESSIONS_CONNECTED.set(self.sessions.len() as i64);
    }

    pub fn get(&self, session_id: &Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    #[allow(dead_code)] // Available to the console surface
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Close a session by id, e.g. from an admin surface or a kick.
    #[allow(dead_code)]
    pub fn disconnect(&self, session_id: &Uuid, reason: &str) {
        if let Some(session) = self.get(session_id) {
            session.close(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_proto::{Envelope, Payload};

    fn handle(cap: usize) -> (Arc<SessionHandle>, mpsc::Receiver<Arc<Envelope>>) {
        let (tx, rx) = mpsc::channel(cap);
        let session = SessionHandle::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "ada".to_string(),
            SessionFormat::Json,
            HashMap::new(),
            0,
            "127.0.0.1:9".parse().unwrap(),
            tx,
            CancellationToken::new(),
        );
        (session, rx)
    }

    #[test]
    fn overflow_closes_the_session_as_slow_consumer() {
        let (session, _rx) = handle(1);
        assert!(session.enqueue(Arc::new(Envelope::push(Payload::Pong {})), true));
        assert!(!session.enqueue(Arc::new(Envelope::push(Payload::Pong {})), true));
        assert!(session.is_closed());
        assert_eq!(session.close_reason().as_deref(), Some("slow consumer"));
    }

    #[test]
    fn first_close_reason_wins() {
        let (session, _rx) = handle(4);
        session.close("kicked");
        session.close("slow consumer");
        assert_eq!(session.close_reason().as_deref(), Some("kicked"));
    }

    #[test]
    fn registry_register_lookup_disconnect() {
        let registry = SessionRegistry::new();
        let (session, _rx) = handle(4);
        let id = session.session_id;

        registry.register(session.clone());
        assert_eq!(registry.count(), 1);
        assert!(registry.get(&id).is_some());

        registry.disconnect(&id, "admin kick");
        assert!(session.is_closed());
        assert_eq!(session.close_reason().as_deref(), Some("admin kick"));

        registry.unregister(&id);
        assert!(registry.get(&id).is_none());
        assert_eq!(registry.count(), 0);
    }
}
