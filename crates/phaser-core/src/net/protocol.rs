use serde::{Deserialize, Serialize};

use super::messages::{
    ClientMessage, ConfigUpdateMsg, GameStateMsg, HeartbeatMsg, HitReportMsg, HitVerdictMsg,
    MessageType, RegisterAckMsg, RegisterMsg, RespawnCompleteMsg, ServerMessage, ShotFiredMsg,
};

/// Current session protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size in bytes, type prefix included.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug)]
pub enum ProtocolError {
    EmptyMessage,
    UnknownMessageType(u8),
    PayloadTooLarge(usize),
    SerializeError(String),
    DeserializeError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::UnknownMessageType(b) => write!(f, "unknown message type: 0x{b:02x}"),
            Self::PayloadTooLarge(size) => {
                write!(
                    f,
                    "payload too large: {size} bytes (max {MAX_MESSAGE_SIZE})"
                )
            },
            Self::SerializeError(e) => write!(f, "serialize error: {e}"),
            Self::DeserializeError(e) => write!(f, "deserialize error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Encode a serializable payload with a 1-byte type prefix.
pub fn encode_message<T: Serialize>(
    msg_type: MessageType,
    payload: &T,
) -> Result<Vec<u8>, ProtocolError> {
    let payload_bytes =
        rmp_serde::to_vec(payload).map_err(|e| ProtocolError::SerializeError(e.to_string()))?;
    let total = 1 + payload_bytes.len();
    if total > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(total));
    }
    let mut buf = Vec::with_capacity(total);
    buf.push(msg_type as u8);
    buf.extend_from_slice(&payload_bytes);
    Ok(buf)
}

pub fn encode_client_message(msg: &ClientMessage) -> Result<Vec<u8>, ProtocolError> {
    match msg {
        ClientMessage::Register(m) => encode_message(MessageType::Register, m),
        ClientMessage::Heartbeat(m) => encode_message(MessageType::Heartbeat, m),
        ClientMessage::ShotFired(m) => encode_message(MessageType::ShotFired, m),
        ClientMessage::RespawnComplete(m) => encode_message(MessageType::RespawnComplete, m),
        ClientMessage::HitReport(m) => encode_message(MessageType::HitReport, m),
    }
}

pub fn encode_server_message(msg: &ServerMessage) -> Result<Vec<u8>, ProtocolError> {
    match msg {
        ServerMessage::RegisterAck(m) => encode_message(MessageType::RegisterAck, m),
        ServerMessage::HitVerdict(m) => encode_message(MessageType::HitVerdict, m),
        ServerMessage::GameState(m) => encode_message(MessageType::GameState, m),
        ServerMessage::ConfigUpdate(m) => encode_message(MessageType::ConfigUpdate, m),
    }
}

/// Extract the message type byte from raw wire data.
pub fn decode_message_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
    let Some(&first) = data.first() else {
        return Err(ProtocolError::EmptyMessage);
    };
    MessageType::from_byte(first).ok_or(ProtocolError::UnknownMessageType(first))
}

/// Decode a MessagePack payload (bytes after the type prefix).
pub fn decode_payload<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(data.len()));
    }
    rmp_serde::from_slice(&data[1..]).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
}

pub fn decode_client_message(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
    match decode_message_type(data)? {
        MessageType::Register => Ok(ClientMessage::Register(decode_payload::<RegisterMsg>(
            data,
        )?)),
        MessageType::Heartbeat => Ok(ClientMessage::Heartbeat(decode_payload::<HeartbeatMsg>(
            data,
        )?)),
        MessageType::ShotFired => Ok(ClientMessage::ShotFired(decode_payload::<ShotFiredMsg>(
            data,
        )?)),
        MessageType::RespawnComplete => Ok(ClientMessage::RespawnComplete(decode_payload::<
            RespawnCompleteMsg,
        >(data)?)),
        MessageType::HitReport => Ok(ClientMessage::HitReport(decode_payload::<HitReportMsg>(
            data,
        )?)),
        other => Err(ProtocolError::UnknownMessageType(other as u8)),
    }
}

pub fn decode_server_message(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
    match decode_message_type(data)? {
        MessageType::RegisterAck => Ok(ServerMessage::RegisterAck(decode_payload::<
            RegisterAckMsg,
        >(data)?)),
        MessageType::HitVerdict => Ok(ServerMessage::HitVerdict(decode_payload::<
            HitVerdictMsg,
        >(data)?)),
        MessageType::GameState => Ok(ServerMessage::GameState(decode_payload::<GameStateMsg>(
            data,
        )?)),
        MessageType::ConfigUpdate => Ok(ServerMessage::ConfigUpdate(decode_payload::<
            ConfigUpdateMsg,
        >(data)?)),
        other => Err(ProtocolError::UnknownMessageType(other as u8)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{GameConfig, GameMode, SessionState};
    use crate::identity::{DeviceIdentity, DeviceRole, PlayerColor};

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            device_id: 5,
            player_id: 2,
            team_id: 1,
            color: PlayerColor::for_team(1),
            role: DeviceRole::Weapon,
            display_name: "WEAPON-12".to_string(),
        }
    }

    #[test]
    fn roundtrip_register() {
        let msg = ClientMessage::Register(RegisterMsg {
            identity: identity(),
            protocol_version: PROTOCOL_VERSION,
        });
        let encoded = encode_client_message(&msg).unwrap();
        assert_eq!(encoded[0], MessageType::Register as u8);
        assert_eq!(decode_client_message(&encoded).unwrap(), msg);
    }

    #[test]
    fn roundtrip_heartbeat() {
        let msg = ClientMessage::Heartbeat(HeartbeatMsg {
            device_id: 5,
            uptime_ms: 90_000,
            ammo: 4,
            kills: 10,
            deaths: 2,
            session_state: SessionState::Respawning,
            goal_reached: true,
        });
        let encoded = encode_client_message(&msg).unwrap();
        assert_eq!(decode_client_message(&encoded).unwrap(), msg);
    }

    #[test]
    fn roundtrip_config_update() {
        let msg = ServerMessage::ConfigUpdate(ConfigUpdateMsg {
            config: GameConfig {
                mode: GameMode::CaptureFlag,
                unlimited_ammo: true,
                ..GameConfig::default()
            },
        });
        let encoded = encode_server_message(&msg).unwrap();
        assert_eq!(encoded[0], 0x13);
        assert_eq!(decode_server_message(&encoded).unwrap(), msg);
    }

    #[test]
    fn roundtrip_verdict() {
        let msg = ServerMessage::HitVerdict(HitVerdictMsg {
            shooter_id: 2,
            target_id: 7,
            valid: false,
        });
        let encoded = encode_server_message(&msg).unwrap();
        assert_eq!(decode_server_message(&encoded).unwrap(), msg);
    }

    #[test]
    fn server_message_on_client_decoder_is_rejected() {
        let encoded = encode_server_message(&ServerMessage::RegisterAck(RegisterAckMsg {
            success: true,
            error: None,
        }))
        .unwrap();
        assert!(matches!(
            decode_client_message(&encoded),
            Err(ProtocolError::UnknownMessageType(0x10))
        ));
    }

    #[test]
    fn empty_and_unknown_are_rejected() {
        assert!(matches!(
            decode_server_message(&[]),
            Err(ProtocolError::EmptyMessage)
        ));
        assert!(matches!(
            decode_message_type(&[0xEE, 0x00]),
            Err(ProtocolError::UnknownMessageType(0xEE))
        ));
    }

    #[test]
    fn truncated_payload_is_deserialize_error() {
        let encoded = encode_client_message(&ClientMessage::HitReport(HitReportMsg {
            shooter_id: 2,
            target_id: 7,
            payload: 0x5a13,
        }))
        .unwrap();
        assert!(matches!(
            decode_client_message(&encoded[..encoded.len() - 1]),
            Err(ProtocolError::DeserializeError(_))
        ));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let huge = vec![0u8; MAX_MESSAGE_SIZE];
        assert!(matches!(
            encode_message(MessageType::HitReport, &huge),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }
}
