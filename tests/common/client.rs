//! Realtime test client over WebSocket JSON framing.

#![allow(dead_code)]

use std::time::Duration;

use arena_proto::{Envelope, Payload};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub user_id: Uuid,
    pub username: String,
    next_cid: u64,
}

impl TestClient {
    /// Connect as a fresh user.
    pub async fn connect(port: u16, username: &str) -> anyhow::Result<Self> {
        Self::connect_as(port, Uuid::new_v4(), username).await
    }

    pub async fn connect_as(port: u16, user_id: Uuid, username: &str) -> anyhow::Result<Self> {
        let url = format!(
            "ws://127.0.0.1:{}/ws?user_id={}&username={}&format=json",
            port, user_id, username
        );
        let (ws, _) = connect_async(&url).await?;
        Ok(Self {
            ws,
            user_id,
            username: username.to_string(),
            next_cid: 1,
        })
    }

    pub async fn send(&mut self, cid: &str, payload: Payload) -> anyhow::Result<()> {
        let envelope = Envelope::new(cid, payload);
        self.ws
            .send(Message::Text(envelope.to_json()?))
            .await
            .map_err(Into::into)
    }

    /// Receive the next data envelope, answering protocol pings.
    pub async fn recv(&mut self) -> anyhow::Result<Envelope> {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for envelope"))?
                .ok_or_else(|| anyhow::anyhow!("connection closed"))?;
            match frame? {
                Message::Text(raw) => return Ok(Envelope::from_json(&raw)?),
                Message::Binary(raw) => return Ok(Envelope::from_binary(&raw)?),
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => anyhow::bail!("connection closed by server"),
                Message::Frame(_) => continue,
            }
        }
    }

    /// Receive envelopes until `pred` accepts one, skipping the rest.
    pub async fn recv_until<F>(&mut self, mut pred: F) -> anyhow::Result<Envelope>
    where
        F: FnMut(&Envelope) -> bool,
    {
        for _ in 0..50 {
            let envelope = self.recv().await?;
            if pred(&envelope) {
                return Ok(envelope);
            }
        }
        anyhow::bail!("predicate not satisfied within 50 envelopes")
    }

    /// Send a request and wait for the reply with the same cid.
    pub async fn call(&mut self, payload: Payload) -> anyhow::Result<Envelope> {
        let cid = self.next_cid.to_string();
        self.next_cid += 1;
        self.send(&cid, payload).await?;
        self.recv_until(|env| env.cid == cid).await
    }

    /// Close the connection from the client side.
    pub async fn close(mut self) -> anyhow::Result<()> {
        self.ws.send(Message::Close(None)).await?;
        Ok(())
    }
}
