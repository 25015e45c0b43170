use std::time::Duration;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::api::{ApiError, SharedState};
use super::models::*;

/// Text frame the server answers a client `"ping"` with. Not JSON.
pub const KEEPALIVE_REPLY: &str = "pong";

/// Ping cadence and dead-peer detection for progress sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

// ── Progress message types ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsMessage {
    /// Committed state of the run; always the first frame on a socket.
    Snapshot { run: RunRecord },
    PhaseChanged { run: RunRecord },
    HealingAttempt {
        run_id: RunId,
        attempt: HealingAttempt,
        max_attempts: u32,
        progress: u8,
    },
    /// Final frame; the socket closes after it.
    RunFinished { run: RunRecord },
}

/// Classification of an incoming text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressFrame {
    Update(Box<WsMessage>),
    /// Anything that is not a progress update. Never an error.
    Keepalive,
}

impl ProgressFrame {
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<WsMessage>(text) {
            Ok(msg) => Self::Update(Box::new(msg)),
            Err(_) => Self::Keepalive,
        }
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn progress_ws_handler(
    State(state): State<SharedState>,
    Path(run_id): Path<RunId>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    // Unknown runs get a 404 instead of an upgraded socket.
    state.runner.snapshot(run_id).await?;
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, run_id))
        .into_response())
}

async fn handle_socket(socket: WebSocket, state: SharedState, run_id: RunId) {
    let (mut sender, receiver) = socket.split();
    // Subscribe before reading the snapshot so no committed transition falls
    // between the two.
    let rx = state.runner.hub().subscribe(run_id);

    if !send_snapshot(&mut sender, &state, run_id).await {
        let _ = sender.send(Message::Close(None)).await;
        return;
    }
    match rx {
        Some(rx) => run_socket_loop(sender, receiver, rx, &state, run_id).await,
        None => {
            // Run already finished; the snapshot is all there is.
            let _ = sender.send(Message::Close(None)).await;
        }
    }
}

async fn send_snapshot(
    sender: &mut SplitSink<WebSocket, Message>,
    state: &SharedState,
    run_id: RunId,
) -> bool {
    let run = match state.runner.snapshot(run_id).await {
        Ok(run) => run,
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "Failed to load snapshot for progress socket");
            return false;
        }
    };
    match serde_json::to_string(&WsMessage::Snapshot { run }) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "Failed to serialize snapshot");
            false
        }
    }
}

/// Forward run updates with ping/pong keepalive.
///
/// Combines broadcast forwarding, client message handling and periodic
/// ping/pong health checking in a single select loop. A peer that leaves a
/// Ping unanswered for longer than the pong timeout is dropped.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
    state: &SharedState,
    run_id: RunId,
) {
    let keepalive = state.keepalive;
    let mut ping_interval = tokio::time::interval(keepalive.interval);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > keepalive.pong_timeout {
                    debug!(run_id = %run_id, "Progress socket missed pong; closing");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(run_id = %run_id, missed, "Progress socket lagged; resending snapshot");
                        if !send_snapshot(&mut sender, state, run_id).await {
                            break;
                        }
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Text(text))) if text.as_str().trim() == "ping" => {
                        if sender.send(Message::Text(KEEPALIVE_REPLY.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fakes::record;
    use chrono::Utc;

    #[test]
    fn test_snapshot_serialization_shape() {
        let run = record(RunMode::Hybrid);
        let json = serde_json::to_value(WsMessage::Snapshot { run: run.clone() }).unwrap();
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["data"]["run"]["id"], run.id.to_string());
        assert_eq!(json["data"]["run"]["status"], "queued");
        assert_eq!(json["data"]["run"]["phase"], "starting");
        assert_eq!(json["data"]["run"]["config"]["maxHealAttempts"], 3);
    }

    #[test]
    fn test_healing_attempt_message() {
        let run = record(RunMode::Ai);
        let msg = WsMessage::HealingAttempt {
            run_id: run.id,
            attempt: HealingAttempt {
                attempt: 1,
                fixes: vec![],
                result: None,
                started_at: Utc::now(),
                completed_at: None,
            },
            max_attempts: 3,
            progress: 90,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"healing_attempt\""));
        assert_eq!(ProgressFrame::parse(&json), ProgressFrame::Update(Box::new(msg)));
    }

    #[test]
    fn test_non_json_frames_are_keepalives() {
        assert_eq!(ProgressFrame::parse(KEEPALIVE_REPLY), ProgressFrame::Keepalive);
        assert_eq!(ProgressFrame::parse(""), ProgressFrame::Keepalive);
        assert_eq!(ProgressFrame::parse("{\"type\":\"unknown\"}"), ProgressFrame::Keepalive);
        assert_eq!(ProgressFrame::parse("[1,2,3]"), ProgressFrame::Keepalive);
    }

    #[test]
    fn test_keepalive_defaults() {
        let keepalive = Keepalive::default();
        assert_eq!(keepalive.interval, Duration::from_secs(30));
        assert_eq!(keepalive.pong_timeout, Duration::from_secs(60));
        assert!(keepalive.pong_timeout > keepalive.interval);
    }
}
