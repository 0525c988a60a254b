//! Server session client.
//!
//! Holds one WebSocket session with the authoritative server at a time:
//! register, heartbeat on the store's cadence, relay queued device messages,
//! and apply whatever the server pushes back. Reconnects with capped
//! exponential backoff until cancelled.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use phaser_core::identity::generate_display_name;
use phaser_core::net::messages::{ClientMessage, HeartbeatMsg, RegisterMsg, ServerMessage};
use phaser_core::net::protocol::{
    PROTOCOL_VERSION, ProtocolError, decode_server_message, encode_client_message,
};
use phaser_core::storage::PersistedState;
use phaser_core::store::GameStateStore;
use phaser_core::time::Clock;

use crate::config::ServerLinkConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug)]
pub enum SyncError {
    Connect(String),
    Protocol(ProtocolError),
    /// The server refused the registration.
    Rejected(String),
    RegisterTimeout,
    Closed,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "connection failed: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Rejected(reason) => write!(f, "registration rejected: {reason}"),
            Self::RegisterTimeout => write!(f, "no registration ack from server"),
            Self::Closed => write!(f, "server closed the session"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// Delay before reconnect attempt `attempt` (0-based): doubles from `min_ms`
/// up to `max_ms`.
pub fn retry_delay(attempt: u32, min_ms: u64, max_ms: u64) -> Duration {
    let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
    Duration::from_millis(min_ms.saturating_mul(factor).min(max_ms))
}

/// Up to a quarter of the base delay, so a field of devices does not
/// reconnect in lockstep after a server restart.
fn with_jitter(base: Duration) -> Duration {
    let spread = (base.as_millis() as u64) / 4;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::rng().random_range(0..=spread))
}

pub struct SyncClient {
    url: String,
    config: ServerLinkConfig,
    store: GameStateStore,
    persisted: PersistedState,
    clock: Arc<dyn Clock>,
    outbox: mpsc::Receiver<ClientMessage>,
    attempt: u32,
}

impl SyncClient {
    pub fn new(
        url: String,
        config: ServerLinkConfig,
        store: GameStateStore,
        persisted: PersistedState,
        clock: Arc<dyn Clock>,
        outbox: mpsc::Receiver<ClientMessage>,
    ) -> Self {
        Self {
            url,
            config,
            store,
            persisted,
            clock,
            outbox,
            attempt: 0,
        }
    }

    /// Keep a session up until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            match self.session(&cancel).await {
                Ok(()) => {},
                Err(e) => tracing::warn!(url = %self.url, "server session ended: {e}"),
            }
            self.store.set_server_connected(false);
            if cancel.is_cancelled() {
                break;
            }

            let delay = with_jitter(retry_delay(
                self.attempt,
                self.config.reconnect_min_ms,
                self.config.reconnect_max_ms,
            ));
            self.attempt = self.attempt.saturating_add(1);
            tracing::info!(delay_ms = delay.as_millis() as u64, "reconnecting to server");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {},
            }
        }
        tracing::debug!("server sync stopped");
    }

    async fn session(&mut self, cancel: &CancellationToken) -> Result<(), SyncError> {
        let ws = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = tokio_tungstenite::connect_async(self.url.as_str()) => {
                result.map_err(|e| SyncError::Connect(e.to_string()))?.0
            },
        };
        let local_ip = match ws.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.local_addr().ok().map(|addr| addr.ip()),
            _ => None,
        };
        if let Some(ip) = local_ip {
            self.ensure_display_name(ip);
        }

        let (mut sink, mut source) = ws.split();
        let register = ClientMessage::Register(RegisterMsg {
            identity: self.store.identity(),
            protocol_version: PROTOCOL_VERSION,
        });
        send(&mut sink, &register).await?;

        let timeout = Duration::from_millis(self.config.register_timeout_ms);
        let ack = tokio::time::timeout(timeout, next_server_message(&mut source))
            .await
            .map_err(|_| SyncError::RegisterTimeout)??;
        match ack {
            ServerMessage::RegisterAck(ack) if ack.success => {},
            ServerMessage::RegisterAck(ack) => {
                return Err(SyncError::Rejected(ack.error.unwrap_or_default()));
            },
            other => {
                return Err(SyncError::Rejected(format!("expected RegisterAck, got {other:?}")));
            },
        }

        self.attempt = 0;
        let stale = self.drain_outbox();
        if stale > 0 {
            tracing::debug!(stale, "dropped messages queued before this session");
        }
        self.store.set_server_connected(true);
        tracing::info!(url = %self.url, "registered with server");

        let mut tick = tokio::time::interval(Duration::from_millis(self.config.tick_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                },
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Binary(data))) => match decode_server_message(&data) {
                        Ok(msg) => self.apply_server_message(msg),
                        Err(e) => tracing::warn!("undecodable server message: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => return Err(SyncError::Closed),
                    Some(Ok(_)) => {},
                    Some(Err(e)) => return Err(SyncError::Connect(e.to_string())),
                },
                Some(msg) = self.outbox.recv() => send(&mut sink, &msg).await?,
                _ = tick.tick() => {
                    if let Some(heartbeat) = self.heartbeat() {
                        send(&mut sink, &heartbeat).await?;
                    }
                },
            }
        }
    }

    fn ensure_display_name(&self, ip: IpAddr) {
        let identity = self.store.identity();
        if identity.has_display_name() {
            return;
        }
        let name = generate_display_name(identity.role, ip);
        if !self.store.set_display_name(name.clone()) {
            return;
        }
        match self.persisted.save_identity(&self.store.identity()) {
            Ok(()) => tracing::info!(%name, "generated display name"),
            Err(e) => tracing::warn!(%name, "failed to persist display name: {e}"),
        }
    }

    fn drain_outbox(&mut self) -> usize {
        let mut dropped = 0;
        while self.outbox.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    /// The heartbeat to send now, if one is due.
    pub fn heartbeat(&self) -> Option<ClientMessage> {
        let now = self.clock.now_ms();
        if !self.store.heartbeat_due(now) {
            return None;
        }
        let snap = self.store.snapshot();
        Some(ClientMessage::Heartbeat(HeartbeatMsg {
            device_id: self.store.identity().device_id,
            uptime_ms: now,
            ammo: snap.ammo,
            kills: snap.kills,
            deaths: snap.deaths,
            session_state: snap.session_state,
            goal_reached: snap.goal_reached(),
        }))
    }

    /// Apply one message pushed by the server.
    pub fn apply_server_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::RegisterAck(_) => {
                tracing::debug!("ignoring repeated register ack");
            },
            ServerMessage::ConfigUpdate(update) => {
                tracing::info!(
                    mode = %update.config.mode,
                    max_ammo = update.config.max_ammo,
                    unlimited_ammo = update.config.unlimited_ammo,
                    "config pushed by server"
                );
                if let Err(e) = self.persisted.save_config(&update.config) {
                    tracing::warn!("failed to persist pushed config: {e}");
                }
                self.store.apply_config(update.config);
            },
            ServerMessage::GameState(state) => {
                let changed = self.store.apply_server_state(
                    state.mode,
                    state.session_state,
                    self.clock.now_ms(),
                );
                if changed {
                    tracing::info!(
                        mode = %state.mode,
                        session_state = %state.session_state,
                        "session state set by server"
                    );
                }
            },
            ServerMessage::HitVerdict(verdict) => {
                let outcome = self.store.apply_verdict(
                    verdict.shooter_id,
                    verdict.target_id,
                    verdict.valid,
                    self.clock.now_ms(),
                );
                tracing::info!(
                    shooter_id = verdict.shooter_id,
                    target_id = verdict.target_id,
                    valid = verdict.valid,
                    ?outcome,
                    "hit verdict"
                );
            },
        }
    }
}

async fn send(sink: &mut WsSink, msg: &ClientMessage) -> Result<(), SyncError> {
    let data = encode_client_message(msg)?;
    sink.send(Message::Binary(data.into()))
        .await
        .map_err(|e| SyncError::Connect(e.to_string()))
}

async fn next_server_message(source: &mut WsSource) -> Result<ServerMessage, SyncError> {
    loop {
        match source.next().await {
            Some(Ok(Message::Binary(data))) => return Ok(decode_server_message(&data)?),
            Some(Ok(Message::Close(_))) | None => return Err(SyncError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(SyncError::Connect(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaser_core::game::{DEATHMATCH_KILL_GOAL, GameConfig, GameMode, SessionState};
    use phaser_core::net::messages::{ConfigUpdateMsg, GameStateMsg, HitVerdictMsg};
    use phaser_core::storage::MemoryStore;
    use phaser_core::store::WirelessHitOutcome;
    use phaser_core::test_helpers::make_store;
    use phaser_core::time::ManualClock;

    struct Rig {
        client: SyncClient,
        store: GameStateStore,
        persisted: PersistedState,
        clock: ManualClock,
        outbox: mpsc::Sender<ClientMessage>,
    }

    fn rig() -> Rig {
        let store = make_store(10);
        let persisted = PersistedState::new(Arc::new(MemoryStore::new()));
        let clock = ManualClock::new(1000);
        let (outbox, rx) = mpsc::channel(4);
        let client = SyncClient::new(
            "ws://127.0.0.1:9/ws".to_string(),
            ServerLinkConfig::default(),
            store.clone(),
            persisted.clone(),
            Arc::new(clock.clone()),
            rx,
        );
        Rig {
            client,
            store,
            persisted,
            clock,
            outbox,
        }
    }

    #[test]
    fn retry_delay_doubles_up_to_cap() {
        assert_eq!(retry_delay(0, 1000, 30_000), Duration::from_millis(1000));
        assert_eq!(retry_delay(1, 1000, 30_000), Duration::from_millis(2000));
        assert_eq!(retry_delay(4, 1000, 30_000), Duration::from_millis(16_000));
        assert_eq!(retry_delay(5, 1000, 30_000), Duration::from_millis(30_000));
        assert_eq!(retry_delay(200, 1000, 30_000), Duration::from_millis(30_000));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let base = Duration::from_millis(4000);
        for _ in 0..100 {
            let delay = with_jitter(base);
            assert!(delay >= base && delay <= Duration::from_millis(5000));
        }
    }

    #[test]
    fn heartbeat_follows_store_cadence() {
        let rig = rig();
        rig.store.set_server_connected(true);
        match rig.client.heartbeat() {
            Some(ClientMessage::Heartbeat(hb)) => {
                assert_eq!(hb.device_id, 5);
                assert_eq!(hb.uptime_ms, 1000);
                assert_eq!(hb.ammo, 10);
                assert!(!hb.goal_reached);
            },
            other => panic!("expected heartbeat, got {other:?}"),
        }
        rig.clock.advance(1000);
        assert!(rig.client.heartbeat().is_none());
        rig.clock.advance(4000);
        assert!(rig.client.heartbeat().is_some());
    }

    #[test]
    fn heartbeat_goal_matches_reported_kills() {
        let rig = rig();
        rig.store.set_server_connected(true);
        rig.store.apply_config(GameConfig {
            mode: GameMode::Deathmatch,
            max_ammo: 10,
            ..GameConfig::default()
        });
        for _ in 0..DEATHMATCH_KILL_GOAL {
            rig.store.record_kill();
        }
        match rig.client.heartbeat() {
            Some(ClientMessage::Heartbeat(hb)) => {
                assert_eq!(hb.kills, DEATHMATCH_KILL_GOAL);
                assert!(hb.goal_reached);
            },
            other => panic!("expected heartbeat, got {other:?}"),
        }
    }

    #[test]
    fn pushed_config_is_applied_and_persisted() {
        let rig = rig();
        let config = GameConfig {
            mode: GameMode::Team,
            max_ammo: 50,
            ..GameConfig::default()
        };
        rig.client
            .apply_server_message(ServerMessage::ConfigUpdate(ConfigUpdateMsg {
                config: config.clone(),
            }));
        assert_eq!(rig.store.config(), config);
        assert_eq!(rig.store.snapshot().ammo, 50);
        assert_eq!(rig.persisted.load_config().unwrap(), Some(config));
    }

    #[test]
    fn server_state_forces_respawn() {
        let rig = rig();
        rig.client
            .apply_server_message(ServerMessage::GameState(GameStateMsg {
                mode: GameMode::Deathmatch,
                session_state: SessionState::Respawning,
            }));
        let snap = rig.store.snapshot();
        assert_eq!(snap.mode, GameMode::Deathmatch);
        assert_eq!(snap.session_state, SessionState::Respawning);
        assert_eq!(snap.respawn_deadline_ms, Some(6000));
    }

    #[test]
    fn invalid_verdict_rolls_back_provisional_kill() {
        let rig = rig();
        let outcome = rig.store.apply_wireless_hit(
            2,
            phaser_core::game::HitConfirmationPolicy::ShooterOnly,
            1000,
        );
        assert_eq!(
            outcome,
            WirelessHitOutcome::Applied {
                hit_taken: false,
                kill_scored: true
            }
        );
        assert_eq!(rig.store.snapshot().kills, 1);
        rig.client
            .apply_server_message(ServerMessage::HitVerdict(HitVerdictMsg {
                shooter_id: 2,
                target_id: 3,
                valid: false,
            }));
        assert_eq!(rig.store.snapshot().kills, 0);
    }

    #[test]
    fn stale_outbox_is_drained() {
        let mut rig = rig();
        for device_id in 0..3 {
            rig.outbox
                .try_send(ClientMessage::RespawnComplete(
                    phaser_core::net::messages::RespawnCompleteMsg {
                        device_id,
                        timestamp_ms: 0,
                    },
                ))
                .unwrap();
        }
        assert_eq!(rig.client.drain_outbox(), 3);
        assert_eq!(rig.client.drain_outbox(), 0);
    }

    #[test]
    fn display_name_is_generated_once() {
        let rig = rig();
        rig.client.ensure_display_name(IpAddr::from([10, 0, 0, 42]));
        assert_eq!(rig.store.identity().display_name, "WEAPON-42");
        let saved = rig.persisted.load_identity().unwrap().unwrap();
        assert_eq!(saved.display_name, "WEAPON-42");

        rig.client.ensure_display_name(IpAddr::from([10, 0, 0, 7]));
        assert_eq!(rig.store.identity().display_name, "WEAPON-42");
    }
}
