//! Connection — the per-session actor.
//!
//! One task per session multiplexes the WebSocket reader half, the bounded
//! outbound queue, and the liveness timer with `tokio::select!`. Outbound
//! ordering is single-writer by construction: everything a session is sent
//! goes through its queue and this task's writer half.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arena_proto::{Envelope, PresenceReason, SessionFormat};
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use crate::error::ApiError;
use crate::nexus::Nexus;
use crate::pipeline::Pipeline;
use crate::session::SessionHandle;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// A realtime session connection handler.
pub struct Connection {
    session: Arc<SessionHandle>,
    outbound_rx: mpsc::Receiver<Arc<Envelope>>,
    ws: WebSocketStream<TcpStream>,
    nexus: Arc<Nexus>,
    pipeline: Arc<Pipeline>,
}

impl Connection {
    pub fn new(
        session: Arc<SessionHandle>,
        outbound_rx: mpsc::Receiver<Arc<Envelope>>,
        ws: WebSocketStream<TcpStream>,
        nexus: Arc<Nexus>,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        Self {
            session,
            outbound_rx,
            ws,
            nexus,
            pipeline,
        }
    }

    #[instrument(
        skip(self),
        fields(session = %self.session.session_id, user = %self.session.user_id),
        name = "session"
    )]
    pub async fn run(self) {
        let Connection {
            session,
            mut outbound_rx,
            ws,
            nexus,
            pipeline,
        } = self;

        let ping_interval = Duration::from_secs(nexus.limits.ping_interval_secs);
        let pong_timeout = Duration::from_secs(nexus.limits.pong_timeout_secs);
        let write_timeout = Duration::from_millis(nexus.limits.write_timeout_ms);

        let (mut ws_tx, mut ws_rx) = ws.split();
        let mut ping_timer = tokio::time::interval(ping_interval);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_activity = Instant::now();

        let mut close_reason = "disconnect";

        loop {
            tokio::select! {
                inbound = ws_rx.next() => {
                    match inbound {
                        Some(Ok(Message::Text(raw))) => {
                            last_activity = Instant::now();
                            handle_frame(&pipeline, &session, Envelope::from_json(&raw)).await;
                        }
                        Some(Ok(Message::Binary(raw))) => {
                            last_activity = Instant::now();
                            handle_frame(&pipeline, &session, Envelope::from_binary(&raw)).await;
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                            // tungstenite answers pings on the next poll.
                            last_activity = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Client closed connection");
                            break;
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "Read error");
                            break;
                        }
                    }
                }

                outbound = outbound_rx.recv() => {
                    let Some(envelope) = outbound else { break };
                    let frame = match encode(session.format, &envelope) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode outbound envelope");
                            continue;
                        }
                    };
                    match tokio::time::timeout(write_timeout, ws_tx.send(frame)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!(error = %e, "Write error");
                            close_reason = "write error";
                            break;
                        }
                        Err(_) => {
                            close_reason = "write deadline missed";
                            break;
                        }
                    }
                }

                _ = ping_timer.tick() => {
                    if last_activity.elapsed() > pong_timeout {
                        close_reason = "ping timeout";
                        break;
                    }
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        close_reason = "write error";
                        break;
                    }
                }

                _ = session.context().cancelled() => {
                    close_reason = "server closed";
                    break;
                }
            }
        }

        shutdown(&nexus, &session, &mut outbound_rx, &mut ws_tx, close_reason).await;
    }
}

async fn handle_frame(
    pipeline: &Pipeline,
    session: &Arc<SessionHandle>,
    decoded: Result<Envelope, arena_proto::CodecError>,
) {
    match decoded {
        Ok(envelope) => {
            pipeline.dispatch(session, envelope).await;
        }
        Err(e) => {
            debug!(error = %e, "Malformed frame");
            let reply = ApiError::InvalidArgument("malformed envelope".to_string()).to_envelope("");
            session.enqueue(Arc::new(reply), true);
        }
    }
}

fn encode(format: SessionFormat, envelope: &Envelope) -> Result<Message, arena_proto::CodecError> {
    match format {
        SessionFormat::Json => Ok(Message::Text(envelope.to_json()?)),
        SessionFormat::Binary => Ok(Message::Binary(envelope.to_binary()?)),
    }
}

/// Tear the session down. Fires exactly one `untrack_all` with reason
/// disconnect, then the registered session-end hooks.
async fn shutdown(
    nexus: &Arc<Nexus>,
    session: &Arc<SessionHandle>,
    outbound_rx: &mut mpsc::Receiver<Arc<Envelope>>,
    ws_tx: &mut WsSink,
    fallback_reason: &str,
) {
    let reason = session
        .close_reason()
        .unwrap_or_else(|| fallback_reason.to_string());

    // Stop accepting routed envelopes first.
    nexus.sessions.unregister(&session.session_id);
    session.close(&reason);
    outbound_rx.close();

    nexus
        .tracker
        .untrack_all(session.session_id, PresenceReason::Disconnect);
    nexus.matchmaker.remove_session(session.session_id);
    nexus.runtime.fire_session_end(session);

    let _ = ws_tx.send(Message::Close(None)).await;
    info!(reason = %reason, "Session closed");
}
