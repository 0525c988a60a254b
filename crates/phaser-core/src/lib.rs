pub mod codec;
pub mod envelope;
pub mod game;
pub mod identity;
pub mod net;
pub mod storage;
pub mod store;
pub mod time;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use crate::envelope::{EnvelopeKind, LinkAddr, ShotEnvelope};
    use crate::game::{GameConfig, GameMode};
    use crate::identity::{DeviceId, DeviceIdentity, DeviceRole, PlayerColor, PlayerId, TeamId};
    use crate::store::GameStateStore;

    /// Pre-shared key used by test devices.
    pub const TEST_PSK: &[u8] = b"phaser-test-psk-0123456789abcdef";

    /// Build a weapon identity with the team palette color.
    pub fn make_identity(
        device_id: DeviceId,
        player_id: PlayerId,
        team_id: TeamId,
    ) -> DeviceIdentity {
        DeviceIdentity {
            device_id,
            player_id,
            team_id,
            color: PlayerColor::for_team(team_id),
            role: DeviceRole::Weapon,
            display_name: String::new(),
        }
    }

    /// Finite-ammo FREE config.
    pub fn finite_config(max_ammo: u32) -> GameConfig {
        GameConfig {
            mode: GameMode::Free,
            max_ammo,
            unlimited_ammo: false,
            ..GameConfig::default()
        }
    }

    /// Store for device 5 / player 2 / team 1 with the given ammo.
    pub fn make_store(max_ammo: u32) -> GameStateStore {
        GameStateStore::new(make_identity(5, 2, 1), finite_config(max_ammo))
    }

    /// An envelope as sent by another device.
    pub fn make_envelope(
        kind: EnvelopeKind,
        from: &DeviceIdentity,
        payload: u32,
        timestamp_ms: u32,
    ) -> ShotEnvelope {
        ShotEnvelope::from_identity(kind, from, payload, timestamp_ms)
    }

    /// Deterministic link address whose last octet is `n`.
    pub fn link_addr(n: u8) -> LinkAddr {
        LinkAddr([0x02, 0x00, 0x00, 0x00, 0x00, n])
    }
}
