use serde::{Deserialize, Serialize};

use crate::game::{GameConfig, GameMode, SessionState};
use crate::identity::{DeviceId, DeviceIdentity, PlayerId};

/// Session message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    // Device -> Server
    Register = 0x01,
    Heartbeat = 0x02,
    ShotFired = 0x03,
    RespawnComplete = 0x04,
    HitReport = 0x05,

    // Server -> Device
    RegisterAck = 0x10,
    HitVerdict = 0x11,
    GameState = 0x12,
    ConfigUpdate = 0x13,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Register),
            0x02 => Some(Self::Heartbeat),
            0x03 => Some(Self::ShotFired),
            0x04 => Some(Self::RespawnComplete),
            0x05 => Some(Self::HitReport),
            0x10 => Some(Self::RegisterAck),
            0x11 => Some(Self::HitVerdict),
            0x12 => Some(Self::GameState),
            0x13 => Some(Self::ConfigUpdate),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Device -> Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMsg {
    pub identity: DeviceIdentity,
    pub protocol_version: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMsg {
    pub device_id: DeviceId,
    pub uptime_ms: u64,
    pub ammo: u32,
    pub kills: u32,
    pub deaths: u32,
    pub session_state: SessionState,
    /// Deathmatch kill goal met.
    pub goal_reached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShotFiredMsg {
    pub device_id: DeviceId,
    pub counter: u32,
    pub timestamp_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RespawnCompleteMsg {
    pub device_id: DeviceId,
    pub timestamp_ms: u32,
}

/// A locally sensed hit submitted for arbitration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitReportMsg {
    pub shooter_id: PlayerId,
    pub target_id: PlayerId,
    /// Optical message bits carried by the triggering envelope.
    pub payload: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Register(RegisterMsg),
    Heartbeat(HeartbeatMsg),
    ShotFired(ShotFiredMsg),
    RespawnComplete(RespawnCompleteMsg),
    HitReport(HitReportMsg),
}

// ---------------------------------------------------------------------------
// Server -> Device
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAckMsg {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitVerdictMsg {
    pub shooter_id: PlayerId,
    pub target_id: PlayerId,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStateMsg {
    pub mode: GameMode,
    pub session_state: SessionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdateMsg {
    pub config: GameConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    RegisterAck(RegisterAckMsg),
    HitVerdict(HitVerdictMsg),
    GameState(GameStateMsg),
    ConfigUpdate(ConfigUpdateMsg),
}
