//! Registered device sessions and hit arbitration.
//!
//! The manager is the single authority on who is connected, which players
//! are respawning, and which rules are in force. Every outbound message goes
//! through a per-device bounded queue drained by that connection's writer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

use phaser_core::game::{GameConfig, GameMode, SessionState};
use phaser_core::identity::{
    DeviceId, DeviceIdentity, DeviceRole, MAX_DISPLAY_NAME_LEN, PlayerId, TeamId,
};
use phaser_core::net::messages::{
    ConfigUpdateMsg, GameStateMsg, HeartbeatMsg, HitReportMsg, HitVerdictMsg, RegisterAckMsg,
    ServerMessage, ShotFiredMsg,
};
use phaser_core::net::protocol::encode_server_message;

pub type SharedSessionManager = Arc<RwLock<SessionManager>>;

/// Outbound queue of encoded frames for one device connection.
pub type DeviceSender = mpsc::Sender<Bytes>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    DuplicateDevice(DeviceId),
    InvalidDisplayName,
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateDevice(id) => write!(f, "device {id} is already registered"),
            Self::InvalidDisplayName => write!(
                f,
                "display name must be at most {MAX_DISPLAY_NAME_LEN} printable characters"
            ),
        }
    }
}

impl std::error::Error for RegisterError {}

/// Why a hit report was judged invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Refusal {
    /// The reporting device does not belong to the claimed shooter.
    ShooterMismatch,
    SelfHit,
    UnknownTarget,
    TargetRespawning,
    FriendlyFire,
}

impl std::fmt::Display for Refusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ShooterMismatch => "shooter does not match reporting device",
            Self::SelfHit => "shooter and target are the same player",
            Self::UnknownTarget => "target is not registered",
            Self::TargetRespawning => "target is respawning",
            Self::FriendlyFire => "shooter and target share a team",
        })
    }
}

struct DeviceSession {
    session_id: Uuid,
    identity: DeviceIdentity,
    sender: DeviceSender,
    last_seen: Instant,
    last_heartbeat: Option<HeartbeatMsg>,
    shots_reported: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct VerdictStats {
    pub valid: u64,
    pub invalid: u64,
}

/// One row of the status report.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device_id: DeviceId,
    pub player_id: PlayerId,
    pub team_id: TeamId,
    pub role: DeviceRole,
    pub display_name: String,
    pub session_id: Uuid,
    pub last_seen_ms_ago: u64,
    pub shots_reported: u32,
    pub last_heartbeat: Option<HeartbeatMsg>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub config: GameConfig,
    pub devices: Vec<DeviceStatus>,
    pub respawning: Vec<PlayerId>,
    pub verdicts: VerdictStats,
}

pub struct SessionManager {
    devices: HashMap<DeviceId, DeviceSession>,
    respawning: HashSet<PlayerId>,
    config: GameConfig,
    verdicts: VerdictStats,
}

impl SessionManager {
    pub fn new(config: GameConfig) -> Self {
        Self {
            devices: HashMap::new(),
            respawning: HashSet::new(),
            config,
            verdicts: VerdictStats::default(),
        }
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    /// Admit a device and queue its welcome: the ack, the current rules,
    /// and its player's session state.
    pub fn register(
        &mut self,
        identity: DeviceIdentity,
        sender: DeviceSender,
    ) -> Result<Uuid, RegisterError> {
        if self.devices.contains_key(&identity.device_id) {
            return Err(RegisterError::DuplicateDevice(identity.device_id));
        }
        let name = &identity.display_name;
        if name.len() > MAX_DISPLAY_NAME_LEN || name.chars().any(char::is_control) {
            return Err(RegisterError::InvalidDisplayName);
        }

        let session_id = Uuid::new_v4();
        let device_id = identity.device_id;
        tracing::info!(
            device_id,
            player_id = identity.player_id,
            team_id = identity.team_id,
            role = identity.role.label(),
            name = %identity.display_name,
            %session_id,
            "device registered"
        );
        self.devices.insert(
            device_id,
            DeviceSession {
                session_id,
                identity,
                sender,
                last_seen: Instant::now(),
                last_heartbeat: None,
                shots_reported: 0,
            },
        );

        if let Some(session) = self.devices.get(&device_id) {
            let player = session.identity.player_id;
            let welcome = [
                ServerMessage::RegisterAck(RegisterAckMsg {
                    success: true,
                    error: None,
                }),
                ServerMessage::ConfigUpdate(ConfigUpdateMsg {
                    config: self.config.clone(),
                }),
                self.game_state_for(player),
            ];
            for msg in &welcome {
                if let Some(data) = encode(msg) {
                    send(session, data);
                }
            }
        }
        Ok(session_id)
    }

    /// Remove a device, but only if `session_id` is still the live session
    /// for it. A late disconnect must not evict a newer registration.
    pub fn unregister(&mut self, device_id: DeviceId, session_id: Uuid) -> bool {
        let live = self
            .devices
            .get(&device_id)
            .is_some_and(|s| s.session_id == session_id);
        if !live {
            return false;
        }
        if let Some(session) = self.devices.remove(&device_id) {
            tracing::info!(device_id, %session_id, "device unregistered");
            self.forget_player_if_gone(session.identity.player_id);
        }
        true
    }

    pub fn touch(&mut self, device_id: DeviceId) {
        if let Some(session) = self.devices.get_mut(&device_id) {
            session.last_seen = Instant::now();
        }
    }

    pub fn record_heartbeat(&mut self, device_id: DeviceId, heartbeat: HeartbeatMsg) {
        let Some(session) = self.devices.get_mut(&device_id) else {
            return;
        };
        let was_goal = session
            .last_heartbeat
            .as_ref()
            .is_some_and(|hb| hb.goal_reached);
        if heartbeat.goal_reached && !was_goal {
            tracing::info!(
                device_id,
                player_id = session.identity.player_id,
                kills = heartbeat.kills,
                "player reached the kill goal"
            );
        }
        tracing::debug!(
            device_id,
            ammo = heartbeat.ammo,
            kills = heartbeat.kills,
            deaths = heartbeat.deaths,
            state = %heartbeat.session_state,
            "heartbeat"
        );
        session.last_heartbeat = Some(heartbeat);
    }

    pub fn record_shot(&mut self, device_id: DeviceId, shot: &ShotFiredMsg) {
        if let Some(session) = self.devices.get_mut(&device_id) {
            session.shots_reported = session.shots_reported.saturating_add(1);
            tracing::debug!(device_id, counter = shot.counter, "shot fired");
        }
    }

    /// A device finished its respawn countdown; its player may be hit again.
    pub fn respawn_complete(&mut self, device_id: DeviceId) -> bool {
        let Some(player) = self.player_of(device_id) else {
            return false;
        };
        let cleared = self.respawning.remove(&player);
        if cleared {
            tracing::info!(device_id, player_id = player, "player respawned");
        }
        cleared
    }

    /// Judge a hit report and deliver the verdict to every device of the
    /// shooter and target, plus the reporter.
    pub fn arbitrate(&mut self, reporter: DeviceId, report: &HitReportMsg) -> HitVerdictMsg {
        let judged = self.judge(reporter, report);
        match judged {
            Ok(()) => {
                self.respawning.insert(report.target_id);
                self.verdicts.valid += 1;
                tracing::info!(
                    shooter_id = report.shooter_id,
                    target_id = report.target_id,
                    "hit confirmed"
                );
            },
            Err(refusal) => {
                self.verdicts.invalid += 1;
                tracing::info!(
                    reporter,
                    shooter_id = report.shooter_id,
                    target_id = report.target_id,
                    "hit refused: {refusal}"
                );
            },
        }

        let verdict = HitVerdictMsg {
            shooter_id: report.shooter_id,
            target_id: report.target_id,
            valid: judged.is_ok(),
        };
        if let Some(data) = encode(&ServerMessage::HitVerdict(verdict.clone())) {
            for session in self.devices.values() {
                let player = session.identity.player_id;
                let concerned = session.identity.device_id == reporter
                    || player == report.shooter_id
                    || player == report.target_id;
                if concerned {
                    send(session, data.clone());
                }
            }
        }
        verdict
    }

    fn judge(&self, reporter: DeviceId, report: &HitReportMsg) -> Result<(), Refusal> {
        if self.player_of(reporter) != Some(report.shooter_id) {
            return Err(Refusal::ShooterMismatch);
        }
        if report.shooter_id == report.target_id {
            return Err(Refusal::SelfHit);
        }
        let Some(target_team) = self.team_of(report.target_id) else {
            return Err(Refusal::UnknownTarget);
        };
        if self.respawning.contains(&report.target_id) {
            return Err(Refusal::TargetRespawning);
        }
        if self.config.mode == GameMode::Team
            && self.team_of(report.shooter_id) == Some(target_team)
        {
            return Err(Refusal::FriendlyFire);
        }
        Ok(())
    }

    /// Replace the rules and push them, with each device's session state,
    /// to every connected device. Returns how many devices were notified.
    pub fn set_config(&mut self, config: GameConfig) -> usize {
        tracing::info!(
            mode = %config.mode,
            max_ammo = config.max_ammo,
            unlimited = config.unlimited_ammo,
            respawn_ms = config.respawn_duration_ms,
            "game config changed"
        );
        self.config = config;
        let Some(update) = encode(&ServerMessage::ConfigUpdate(ConfigUpdateMsg {
            config: self.config.clone(),
        })) else {
            return 0;
        };
        for session in self.devices.values() {
            send(session, update.clone());
            if let Some(state) = encode(&self.game_state_for(session.identity.player_id)) {
                send(session, state);
            }
        }
        self.devices.len()
    }

    /// Drop devices not heard from within `max_age`. Their queues close,
    /// which ends their writers and closes the sockets.
    pub fn cleanup_stale(&mut self, max_age: Duration) -> Vec<DeviceId> {
        let now = Instant::now();
        let mut removed = Vec::new();
        self.devices.retain(|&id, s| {
            let keep = now.duration_since(s.last_seen) < max_age;
            if !keep {
                removed.push((id, s.identity.player_id));
            }
            keep
        });
        for &(device_id, player_id) in &removed {
            tracing::info!(device_id, "dropped stale device");
            self.forget_player_if_gone(player_id);
        }
        removed.into_iter().map(|(id, _)| id).collect()
    }

    pub fn is_registered(&self, device_id: DeviceId) -> bool {
        self.devices.contains_key(&device_id)
    }

    pub fn is_respawning(&self, player_id: PlayerId) -> bool {
        self.respawning.contains(&player_id)
    }

    /// (connected devices, distinct players)
    pub fn stats(&self) -> (usize, usize) {
        let players: HashSet<PlayerId> =
            self.devices.values().map(|s| s.identity.player_id).collect();
        (self.devices.len(), players.len())
    }

    pub fn status(&self) -> SessionStatus {
        let now = Instant::now();
        let mut devices: Vec<DeviceStatus> = self
            .devices
            .values()
            .map(|s| DeviceStatus {
                device_id: s.identity.device_id,
                player_id: s.identity.player_id,
                team_id: s.identity.team_id,
                role: s.identity.role,
                display_name: s.identity.display_name.clone(),
                session_id: s.session_id,
                last_seen_ms_ago: now.duration_since(s.last_seen).as_millis() as u64,
                shots_reported: s.shots_reported,
                last_heartbeat: s.last_heartbeat.clone(),
            })
            .collect();
        devices.sort_by_key(|d| d.device_id);
        let mut respawning: Vec<PlayerId> = self.respawning.iter().copied().collect();
        respawning.sort_unstable();
        SessionStatus {
            config: self.config.clone(),
            devices,
            respawning,
            verdicts: self.verdicts,
        }
    }

    fn game_state_for(&self, player: PlayerId) -> ServerMessage {
        let session_state = if self.respawning.contains(&player) {
            SessionState::Respawning
        } else {
            SessionState::Active
        };
        ServerMessage::GameState(GameStateMsg {
            mode: self.config.mode,
            session_state,
        })
    }

    fn player_of(&self, device_id: DeviceId) -> Option<PlayerId> {
        self.devices.get(&device_id).map(|s| s.identity.player_id)
    }

    fn team_of(&self, player: PlayerId) -> Option<TeamId> {
        self.devices
            .values()
            .find(|s| s.identity.player_id == player)
            .map(|s| s.identity.team_id)
    }

    fn forget_player_if_gone(&mut self, player: PlayerId) {
        if self.team_of(player).is_none() {
            self.respawning.remove(&player);
        }
    }
}

fn encode(msg: &ServerMessage) -> Option<Bytes> {
    match encode_server_message(msg) {
        Ok(data) => Some(Bytes::from(data)),
        Err(e) => {
            tracing::error!("failed to encode server message: {e}");
            None
        },
    }
}

fn send(session: &DeviceSession, data: Bytes) {
    if session.sender.try_send(data).is_err() {
        tracing::warn!(
            device_id = session.identity.device_id,
            "device queue full or closed, message dropped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaser_core::net::protocol::decode_server_message;
    use phaser_core::test_helpers::make_identity;

    struct Probe {
        rx: mpsc::Receiver<Bytes>,
    }

    impl Probe {
        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(data) = self.rx.try_recv() {
                out.push(decode_server_message(&data).unwrap());
            }
            out
        }

        fn verdicts(&mut self) -> Vec<HitVerdictMsg> {
            self.drain()
                .into_iter()
                .filter_map(|m| match m {
                    ServerMessage::HitVerdict(v) => Some(v),
                    _ => None,
                })
                .collect()
        }
    }

    fn join(mgr: &mut SessionManager, device: u8, player: u16, team: u8) -> (Uuid, Probe) {
        let (tx, rx) = mpsc::channel(16);
        let id = mgr.register(make_identity(device, player, team), tx).unwrap();
        let mut probe = Probe { rx };
        probe.drain();
        (id, probe)
    }

    fn report(shooter_id: u16, target_id: u16) -> HitReportMsg {
        HitReportMsg {
            shooter_id,
            target_id,
            payload: 0,
        }
    }

    #[test]
    fn register_queues_welcome() {
        let mut mgr = SessionManager::new(GameConfig::default());
        let (tx, rx) = mpsc::channel(16);
        mgr.register(make_identity(5, 2, 1), tx).unwrap();
        let msgs = Probe { rx }.drain();
        assert_eq!(msgs.len(), 3);
        assert!(matches!(&msgs[0], ServerMessage::RegisterAck(a) if a.success));
        assert!(matches!(&msgs[1], ServerMessage::ConfigUpdate(c) if c.config.max_ammo == 30));
        assert!(matches!(
            &msgs[2],
            ServerMessage::GameState(s) if s.session_state == SessionState::Active
        ));
    }

    #[test]
    fn duplicate_device_is_rejected() {
        let mut mgr = SessionManager::new(GameConfig::default());
        let (_id, _probe) = join(&mut mgr, 5, 2, 1);
        let (tx, _rx) = mpsc::channel(16);
        assert_eq!(
            mgr.register(make_identity(5, 9, 2), tx),
            Err(RegisterError::DuplicateDevice(5))
        );
    }

    #[test]
    fn control_characters_in_name_are_rejected() {
        let mut mgr = SessionManager::new(GameConfig::default());
        let mut identity = make_identity(5, 2, 1);
        identity.display_name = "bad\nname".to_string();
        let (tx, _rx) = mpsc::channel(16);
        assert_eq!(
            mgr.register(identity, tx),
            Err(RegisterError::InvalidDisplayName)
        );
    }

    #[test]
    fn weapon_and_vest_share_a_player() {
        let mut mgr = SessionManager::new(GameConfig::default());
        let (_a, _pa) = join(&mut mgr, 5, 2, 1);
        let (_b, _pb) = join(&mut mgr, 6, 2, 1);
        assert_eq!(mgr.stats(), (2, 1));
    }

    #[test]
    fn valid_hit_marks_target_respawning_until_complete() {
        let mut mgr = SessionManager::new(GameConfig::default());
        let (_s, mut shooter) = join(&mut mgr, 5, 2, 1);
        let (_t, mut target) = join(&mut mgr, 7, 3, 2);

        assert!(mgr.arbitrate(5, &report(2, 3)).valid);
        assert!(mgr.is_respawning(3));
        assert_eq!(shooter.verdicts().len(), 1);
        assert!(target.verdicts()[0].valid);

        assert!(!mgr.arbitrate(5, &report(2, 3)).valid);

        assert!(mgr.respawn_complete(7));
        assert!(!mgr.is_respawning(3));
        assert!(mgr.arbitrate(5, &report(2, 3)).valid);
        assert_eq!(mgr.status().verdicts.valid, 2);
        assert_eq!(mgr.status().verdicts.invalid, 1);
    }

    #[test]
    fn refusals() {
        let mut mgr = SessionManager::new(GameConfig {
            mode: GameMode::Team,
            ..GameConfig::default()
        });
        let (_a, _pa) = join(&mut mgr, 5, 2, 1);
        let (_b, _pb) = join(&mut mgr, 6, 4, 1);
        let (_c, _pc) = join(&mut mgr, 7, 3, 2);

        assert_eq!(mgr.judge(5, &report(2, 2)), Err(Refusal::SelfHit));
        assert_eq!(mgr.judge(5, &report(2, 99)), Err(Refusal::UnknownTarget));
        assert_eq!(mgr.judge(5, &report(3, 2)), Err(Refusal::ShooterMismatch));
        assert_eq!(mgr.judge(5, &report(2, 4)), Err(Refusal::FriendlyFire));
        assert_eq!(mgr.judge(5, &report(2, 3)), Ok(()));
    }

    #[test]
    fn same_team_hits_allowed_outside_team_mode() {
        let mut mgr = SessionManager::new(GameConfig::default());
        let (_a, _pa) = join(&mut mgr, 5, 2, 1);
        let (_b, _pb) = join(&mut mgr, 6, 4, 1);
        assert!(mgr.arbitrate(5, &report(2, 4)).valid);
    }

    #[test]
    fn uninvolved_devices_get_no_verdict() {
        let mut mgr = SessionManager::new(GameConfig::default());
        let (_a, _pa) = join(&mut mgr, 5, 2, 1);
        let (_b, _pb) = join(&mut mgr, 7, 3, 2);
        let (_c, mut bystander) = join(&mut mgr, 9, 8, 3);
        mgr.arbitrate(5, &report(2, 3));
        assert!(bystander.verdicts().is_empty());
    }

    #[test]
    fn set_config_pushes_rules_and_state() {
        let mut mgr = SessionManager::new(GameConfig::default());
        let (_a, mut shooter) = join(&mut mgr, 5, 2, 1);
        let (_b, mut target) = join(&mut mgr, 7, 3, 2);
        mgr.arbitrate(5, &report(2, 3));
        shooter.drain();
        target.drain();

        let notified = mgr.set_config(GameConfig {
            mode: GameMode::Deathmatch,
            max_ammo: 50,
            ..GameConfig::default()
        });
        assert_eq!(notified, 2);
        let msgs = target.drain();
        assert!(matches!(&msgs[0], ServerMessage::ConfigUpdate(c) if c.config.max_ammo == 50));
        assert!(matches!(
            &msgs[1],
            ServerMessage::GameState(s)
                if s.mode == GameMode::Deathmatch && s.session_state == SessionState::Respawning
        ));
        assert!(matches!(
            &shooter.drain()[1],
            ServerMessage::GameState(s) if s.session_state == SessionState::Active
        ));
    }

    #[test]
    fn stale_unregister_does_not_evict_new_session() {
        let mut mgr = SessionManager::new(GameConfig::default());
        let (old, _p) = join(&mut mgr, 5, 2, 1);
        assert!(mgr.unregister(5, old));
        let (_new, _p2) = join(&mut mgr, 5, 2, 1);
        assert!(!mgr.unregister(5, old));
        assert!(mgr.is_registered(5));
    }

    #[test]
    fn leaving_clears_respawn_mark() {
        let mut mgr = SessionManager::new(GameConfig::default());
        let (_a, _pa) = join(&mut mgr, 5, 2, 1);
        let (target, _pb) = join(&mut mgr, 7, 3, 2);
        mgr.arbitrate(5, &report(2, 3));
        assert!(mgr.unregister(7, target));
        assert!(!mgr.is_respawning(3));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_drops_silent_devices() {
        let mut mgr = SessionManager::new(GameConfig::default());
        let (_a, _pa) = join(&mut mgr, 5, 2, 1);
        let (_b, mut pb) = join(&mut mgr, 7, 3, 2);
        tokio::time::advance(Duration::from_secs(15)).await;
        mgr.touch(5);
        tokio::time::advance(Duration::from_secs(10)).await;

        assert_eq!(mgr.cleanup_stale(Duration::from_secs(20)), vec![7]);
        assert!(mgr.is_registered(5));
        assert!(matches!(
            pb.rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn status_is_sorted_and_serializable() {
        let mut mgr = SessionManager::new(GameConfig::default());
        let (_b, _pb) = join(&mut mgr, 9, 3, 2);
        let (_a, _pa) = join(&mut mgr, 5, 2, 1);
        mgr.record_heartbeat(
            5,
            HeartbeatMsg {
                device_id: 5,
                uptime_ms: 1000,
                ammo: 29,
                kills: 0,
                deaths: 0,
                session_state: SessionState::Active,
                goal_reached: false,
            },
        );
        let status = mgr.status();
        let ids: Vec<u8> = status.devices.iter().map(|d| d.device_id).collect();
        assert_eq!(ids, vec![5, 9]);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["devices"][0]["last_heartbeat"]["ammo"], 29);
        assert_eq!(json["devices"][0]["role"], "weapon");
    }
}
