//! Per-connection websocket lifecycle.
//!
//! Each socket gets a reader and a writer task. The reader handles control
//! messages and enforces the pong deadline; the writer drains the outbound
//! queue the hub fills and keeps the peer alive with pings. Whichever side
//! finishes first tears the session down.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::Instant;
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::hub::{HubHandle, Outbound};
use crate::messages::ClientMessage;
use crate::room::RoomId;

/// Upper bound on queued events coalesced into one text frame.
pub const MAX_BATCH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Events a session may have queued before the hub drops it.
    pub outbound_capacity: usize,
    pub ping_interval: Duration,
    /// How long the reader waits for a pong before giving up on the peer.
    pub pong_timeout: Duration,
    pub write_timeout: Duration,
    pub max_message_bytes: usize,
    /// Join queued events with `\n` into a single frame.
    pub batch_frames: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            outbound_capacity: 256,
            ping_interval: Duration::from_secs(54),
            pong_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_message_bytes: 512,
            batch_frames: false,
        }
    }
}

#[derive(Clone)]
pub struct SessionContext {
    pub hub: HubHandle,
    pub catalog: Arc<dyn Catalog>,
    pub config: SessionConfig,
}

/// Drives one upgraded socket until either direction ends.
pub async fn serve(socket: WebSocket, ctx: SessionContext) {
    let id = SessionId::new();
    let (ws_tx, ws_rx) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(ctx.config.outbound_capacity.max(1));
    ctx.hub.register(id, outbound_tx);
    info!("session {id} connected");

    let mut writer = tokio::spawn(write_loop(id, ws_tx, outbound_rx, ctx.config.clone()));
    let mut reader = tokio::spawn(read_loop(id, ws_rx, ctx.clone()));

    tokio::select! {
        result = &mut reader => {
            log_outcome(id, "read", result);
            // Closing the queue lets the writer send a close frame and exit.
            ctx.hub.unregister(id);
            if tokio::time::timeout(ctx.config.write_timeout, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        result = &mut writer => {
            log_outcome(id, "write", result);
            reader.abort();
            ctx.hub.unregister(id);
        }
    }
    info!("session {id} closed");
}

fn log_outcome(id: SessionId, side: &str, result: std::result::Result<Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => debug!("session {id}: {side} side finished"),
        Ok(Err(err)) => warn!("session {id}: {side} side failed: {err}"),
        Err(err) => error!("session {id}: {side} task died: {err}"),
    }
}

async fn read_loop(id: SessionId, mut ws_rx: SplitStream<WebSocket>, ctx: SessionContext) -> Result<()> {
    let pong_timeout = ctx.config.pong_timeout;
    let mut deadline = Instant::now() + pong_timeout;
    loop {
        let frame = match tokio::time::timeout_at(deadline, ws_rx.next()).await {
            Err(_) => {
                return Err(Error::Transport(format!(
                    "no pong within {}s",
                    pong_timeout.as_secs()
                )))
            }
            Ok(None) => return Ok(()),
            Ok(Some(frame)) => frame?,
        };

        if frame.is_pong() {
            deadline = Instant::now() + pong_timeout;
            continue;
        }
        if frame.is_close() {
            return Ok(());
        }
        let Ok(text) = frame.to_str() else {
            continue;
        };
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => dispatch(id, message, &ctx).await,
            Err(err) => debug!("session {id}: ignoring malformed message: {err}"),
        }
    }
}

async fn dispatch(id: SessionId, message: ClientMessage, ctx: &SessionContext) {
    match message {
        ClientMessage::DisplayHello(hello) => {
            let room = RoomId::scene(hello.scene_id);
            ctx.hub.join(id, room, Some(hello.display_key.clone()));
            info!("session {id}: display {} joined {room}", hello.display_key);
            if let Err(err) = ctx
                .catalog
                .bind_display(&hello.display_key, hello.scene_id, hello.caps)
                .await
            {
                warn!(
                    "session {id}: could not record display {}: {err}",
                    hello.display_key
                );
            }
        }
        ClientMessage::StateReport(report) => {
            debug!(
                "session {id}: entity {} at ({:.1}, {:.1})",
                report.entity_id, report.x, report.y
            );
        }
    }
}

async fn write_loop(
    id: SessionId,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    config: SessionConfig,
) -> Result<()> {
    let mut ping = tokio::time::interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(first) = next else {
                    debug!("session {id}: outbound queue closed");
                    let _ = send_frame(&mut ws_tx, Message::close(), config.write_timeout).await;
                    return Ok(());
                };
                let frame = if config.batch_frames {
                    drain_batch(&first, &mut outbound, MAX_BATCH)
                } else {
                    first.to_string()
                };
                send_frame(&mut ws_tx, Message::text(frame), config.write_timeout).await?;
            }
            _ = ping.tick() => {
                send_frame(&mut ws_tx, Message::ping(Vec::new()), config.write_timeout).await?;
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: Message, limit: Duration) -> Result<()>
where
    S: Sink<Message, Error = warp::Error> + Unpin,
{
    match tokio::time::timeout(limit, sink.send(frame)).await {
        Ok(sent) => sent.map_err(Error::from),
        Err(_) => Err(Error::Transport(format!(
            "write stalled for {}s",
            limit.as_secs()
        ))),
    }
}

/// Appends whatever is already queued, up to `limit` events, to `first`.
fn drain_batch(first: &str, outbound: &mut mpsc::Receiver<Outbound>, limit: usize) -> String {
    let mut frame = first.to_owned();
    for _ in 1..limit {
        match outbound.try_recv() {
            Ok(next) => {
                frame.push('\n');
                frame.push_str(&next);
            }
            Err(_) => break,
        }
    }
    frame
}
