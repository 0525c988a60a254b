use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use phaser_core::identity::DeviceId;
use phaser_core::net::messages::{ClientMessage, MessageType, RegisterAckMsg, ServerMessage};
use phaser_core::net::protocol::{
    MAX_MESSAGE_SIZE, PROTOCOL_VERSION, decode_client_message, decode_message_type,
    encode_server_message,
};

use crate::state::{AppState, ConnectionGuard};

pub async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, StatusCode> {
    let max_ws = state.config.limits.max_ws_connections;
    let current = state.ws_connection_count.load(Ordering::Relaxed);
    if current >= max_ws {
        tracing::warn!(current, max = max_ws, "WS connection limit reached");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state))
        .into_response())
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let _guard = ConnectionGuard::new(Arc::clone(&state.ws_connection_count));
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // The first message must be a Register.
    let wait = Duration::from_secs(state.config.limits.register_timeout_secs);
    let first_msg = match tokio::time::timeout(wait, ws_receiver.next()).await {
        Ok(Some(Ok(Message::Binary(data)))) => data,
        Ok(_) => return,
        Err(_) => {
            tracing::debug!("connection sent no Register in time");
            return;
        },
    };

    let register = match decode_client_message(&first_msg) {
        Ok(ClientMessage::Register(r)) => r,
        Ok(_) => {
            send_register_error(&mut ws_sender, "first message must be Register").await;
            return;
        },
        Err(e) => {
            tracing::warn!(error = %e, "undecodable first message");
            return;
        },
    };

    if register.protocol_version != PROTOCOL_VERSION {
        let reason = format!(
            "Protocol version mismatch: device={}, server={}",
            register.protocol_version, PROTOCOL_VERSION
        );
        tracing::warn!(device_id = register.identity.device_id, "{reason}");
        send_register_error(&mut ws_sender, &reason).await;
        return;
    }

    let device_id = register.identity.device_id;
    let (tx, rx) = mpsc::channel(state.config.limits.device_message_buffer);
    let registered = state.sessions.write().await.register(register.identity, tx);
    let session_id = match registered {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(device_id, "registration refused: {e}");
            send_register_error(&mut ws_sender, &e.to_string()).await;
            return;
        },
    };

    spawn_writer(ws_sender, rx);
    read_loop(&mut ws_receiver, &state, device_id).await;

    state.sessions.write().await.unregister(device_id, session_id);
}

async fn send_register_error(ws_sender: &mut SplitSink<WebSocket, Message>, error: &str) {
    let ack = ServerMessage::RegisterAck(RegisterAckMsg {
        success: false,
        error: Some(error.to_string()),
    });
    if let Ok(response) = encode_server_message(&ack)
        && let Err(e) = ws_sender.send(Message::Binary(response.into())).await
    {
        tracing::warn!(error = %e, "Failed to send register error");
        return;
    }
    let _ = ws_sender.send(Message::Close(None)).await;
}

/// Drain the device queue into the socket. When the queue closes the socket
/// is closed too.
fn spawn_writer(mut ws_sender: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Bytes>) {
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if ws_sender.send(Message::Binary(data)).await.is_err() {
                return;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });
}

/// Per-connection rate limiter (token bucket).
struct RateLimiter {
    tokens: f64,
    last_refill: tokio::time::Instant,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
}

impl RateLimiter {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: tokio::time::Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    /// Returns true if the message is allowed; false if rate-limited.
    fn allow(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

async fn read_loop(
    ws_receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
    device_id: DeviceId,
) {
    let rate = state.config.limits.ws_rate_limit_per_sec;
    let mut rate_limiter = RateLimiter::new(rate, rate);

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let data = match msg {
            Message::Binary(d) => d,
            Message::Close(_) => break,
            _ => continue,
        };

        if !rate_limiter.allow() {
            tracing::warn!(device_id, "Rate limited");
            continue;
        }

        if data.is_empty() || data.len() > MAX_MESSAGE_SIZE {
            continue;
        }

        let Ok(msg_type) = decode_message_type(&data) else {
            continue;
        };
        if matches!(
            msg_type,
            MessageType::RegisterAck
                | MessageType::HitVerdict
                | MessageType::GameState
                | MessageType::ConfigUpdate
        ) {
            tracing::warn!(device_id, ?msg_type, "Rejected server-only message from device");
            continue;
        }

        let msg = match decode_client_message(&data) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(device_id, error = %e, "undecodable message");
                continue;
            },
        };

        let mut sessions = state.sessions.write().await;
        sessions.touch(device_id);
        match msg {
            ClientMessage::Register(_) => {
                tracing::warn!(device_id, "Register on a registered connection ignored");
            },
            ClientMessage::Heartbeat(hb) => {
                if claims_other(device_id, hb.device_id) {
                    continue;
                }
                sessions.record_heartbeat(device_id, hb);
            },
            ClientMessage::ShotFired(shot) => {
                if claims_other(device_id, shot.device_id) {
                    continue;
                }
                sessions.record_shot(device_id, &shot);
            },
            ClientMessage::RespawnComplete(done) => {
                if claims_other(device_id, done.device_id) {
                    continue;
                }
                sessions.respawn_complete(device_id);
            },
            ClientMessage::HitReport(report) => {
                sessions.arbitrate(device_id, &report);
            },
        }
    }
}

fn claims_other(device_id: DeviceId, claimed: DeviceId) -> bool {
    if claimed != device_id {
        tracing::warn!(device_id, claimed, "message names another device, ignored");
        return true;
    }
    false
}
