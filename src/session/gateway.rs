//! Gateway — accepts realtime WebSocket connections and spins up session
//! actors.
//!
//! Authentication is the fronting proxy's concern: by the time a socket
//! reaches this listener the proxy has validated the token and rewritten
//! the query string with the session identity (`user_id`, `username`,
//! `exp`, `vars_*`). The gateway only parses that contract.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use arena_proto::{PresenceMeta, SessionFormat, Stream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::nexus::Nexus;
use crate::pipeline::Pipeline;
use crate::session::{Connection, SessionHandle};

/// Accepts realtime connections.
pub struct Gateway {
    listener: TcpListener,
    nexus: Arc<Nexus>,
    pipeline: Arc<Pipeline>,
}

/// Session identity extracted from the upgrade request.
struct AcceptParams {
    user_id: Uuid,
    username: String,
    format: SessionFormat,
    status: bool,
    expiry: i64,
    vars: HashMap<String, String>,
}

impl AcceptParams {
    fn parse(query: &str) -> Option<Self> {
        let mut pairs = HashMap::new();
        let mut vars = HashMap::new();
        for pair in query.split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if let Some(var_key) = key.strip_prefix("vars_") {
                vars.insert(var_key.to_string(), value.to_string());
            } else {
                pairs.insert(key, value);
            }
        }

        let user_id = Uuid::parse_str(pairs.get("user_id")?).ok()?;
        let username = pairs
            .get("username")
            .map(|u| u.to_string())
            .unwrap_or_else(|| format!("user-{}", &user_id.as_simple().to_string()[..8]));
        let format = match pairs.get("format").copied() {
            Some("binary") => SessionFormat::Binary,
            _ => SessionFormat::Json,
        };
        let status = pairs.get("status").copied() != Some("false");
        let expiry = pairs
            .get("exp")
            .and_then(|e| e.parse::<i64>().ok())
            .unwrap_or(0);

        Some(Self {
            user_id,
            username,
            format,
            status,
            expiry,
            vars,
        })
    }
}

impl Gateway {
    pub async fn bind(
        addr: &str,
        nexus: Arc<Nexus>,
        pipeline: Arc<Pipeline>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "Realtime gateway listening");
        Ok(Self {
            listener,
            nexus,
            pipeline,
        })
    }

    /// Run the accept loop until shutdown.
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let nexus = self.nexus.clone();
                            let pipeline = self.pipeline.clone();
                            tokio::spawn(async move {
                                if let Err(e) = accept_session(stream, addr, nexus, pipeline).await {
                                    debug!(addr = %addr, error = %e, "Session accept failed");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    }
                }
                _ = self.nexus.shutdown.cancelled() => {
                    info!("Gateway stopping");
                    return Ok(());
                }
            }
        }
    }
}

async fn accept_session(
    stream: TcpStream,
    addr: SocketAddr,
    nexus: Arc<Nexus>,
    pipeline: Arc<Pipeline>,
) -> anyhow::Result<()> {
    // Capture the upgrade request's query string during the handshake.
    let query: Arc<parking_lot::Mutex<Option<String>>> = Arc::new(parking_lot::Mutex::new(None));
    let query_slot = query.clone();
    let ws = tokio_tungstenite::accept_hdr_async(
        stream,
        move |req: &tokio_tungstenite::tungstenite::handshake::server::Request,
              resp: tokio_tungstenite::tungstenite::handshake::server::Response| {
            *query_slot.lock() = req.uri().query().map(|q| q.to_string());
            Ok(resp)
        },
    )
    .await?;

    let query = query.lock().clone().unwrap_or_default();
    let Some(params) = AcceptParams::parse(&query) else {
        anyhow::bail!("missing or invalid session identity in query string");
    };

    let session_id = Uuid::new_v4();
    let (outbound_tx, outbound_rx) = mpsc::channel(nexus.limits.session_outbound_queue);
    let cancel = CancellationToken::new();

    let session = SessionHandle::new(
        session_id,
        params.user_id,
        params.username.clone(),
        params.format,
        params.vars,
        params.expiry,
        addr,
        outbound_tx,
        cancel,
    );

    nexus.sessions.register(session.clone());
    nexus.runtime.fire_session_start(&session);

    // The session's own status presence is its first tracked presence and
    // the anchor that allows later tracks without the first-for-session
    // allowance.
    if params.status {
        let meta = PresenceMeta::new(params.format, params.username);
        nexus.tracker.track(
            session.context(),
            session_id,
            Stream::status(params.user_id),
            params.user_id,
            meta,
            true,
        );
    }

    info!(session = %session_id, user = %params.user_id, addr = %addr, "Session connected");
    Connection::new(session, outbound_rx, ws, nexus, pipeline)
        .run()
        .await;
    Ok(())
}
