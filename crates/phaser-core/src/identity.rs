use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Hardware identifier, unique within a session. Also the identity field of
/// the optical message.
pub type DeviceId = u8;
/// Player the device is assigned to.
pub type PlayerId = u16;
pub type TeamId = u8;

/// Longest display name the external display can render.
pub const MAX_DISPLAY_NAME_LEN: usize = 23;

/// What kind of hardware this device is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Weapon,
    Vest,
}

impl DeviceRole {
    pub fn label(self) -> &'static str {
        match self {
            Self::Weapon => "WEAPON",
            Self::Vest => "VEST",
        }
    }
}

impl std::fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for DeviceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "weapon" => Ok(Self::Weapon),
            "vest" => Ok(Self::Vest),
            other => Err(format!("unknown device role: {other}")),
        }
    }
}

/// Team/player color shown on the device LEDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Default for PlayerColor {
    fn default() -> Self {
        Self::PALETTE[0]
    }
}

impl PlayerColor {
    /// Team colors, indexed by team id.
    pub const PALETTE: &[PlayerColor] = &[
        PlayerColor {
            r: 255,
            g: 87,
            b: 87,
        }, // Red
        PlayerColor {
            r: 83,
            g: 152,
            b: 255,
        }, // Blue
        PlayerColor {
            r: 46,
            g: 213,
            b: 115,
        }, // Green
        PlayerColor {
            r: 255,
            g: 195,
            b: 18,
        }, // Yellow
    ];

    /// Palette color for a team, wrapping past the end of the palette.
    pub fn for_team(team_id: TeamId) -> Self {
        Self::PALETTE[team_id as usize % Self::PALETTE.len()]
    }
}

/// Immutable per-device identity, persisted at provisioning time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    pub player_id: PlayerId,
    pub team_id: TeamId,
    pub color: PlayerColor,
    pub role: DeviceRole,
    /// Empty until the first server session generates one.
    #[serde(default)]
    pub display_name: String,
}

impl DeviceIdentity {
    pub fn has_display_name(&self) -> bool {
        !self.display_name.trim().is_empty()
    }
}

/// Build the default display name from the device role and its assigned
/// network address, e.g. `WEAPON-42` for `192.168.1.42`.
pub fn generate_display_name(role: DeviceRole, addr: IpAddr) -> String {
    let suffix = match addr {
        IpAddr::V4(v4) => v4.octets()[3].to_string(),
        IpAddr::V6(v6) => format!("{:x}", v6.segments()[7]),
    };
    let mut name = format!("{}-{suffix}", role.label());
    name.truncate(MAX_DISPLAY_NAME_LEN);
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn generated_name_uses_last_octet() {
        let addr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 42));
        assert_eq!(generate_display_name(DeviceRole::Weapon, addr), "WEAPON-42");
    }

    #[test]
    fn generated_name_for_ipv6_uses_last_segment() {
        let name = generate_display_name(DeviceRole::Vest, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(name, "VEST-1");
    }

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Weapon".parse::<DeviceRole>(), Ok(DeviceRole::Weapon));
        assert_eq!("VEST".parse::<DeviceRole>(), Ok(DeviceRole::Vest));
        assert!("turret".parse::<DeviceRole>().is_err());
    }

    #[test]
    fn team_color_wraps_palette() {
        assert_eq!(PlayerColor::for_team(0), PlayerColor::PALETTE[0]);
        assert_eq!(
            PlayerColor::for_team(PlayerColor::PALETTE.len() as TeamId),
            PlayerColor::PALETTE[0]
        );
    }

    #[test]
    fn missing_display_name_deserializes_empty() {
        let json = serde_json::json!({
            "device_id": 5,
            "player_id": 2,
            "team_id": 1,
            "color": {"r": 1, "g": 2, "b": 3},
            "role": "weapon"
        });
        let identity: DeviceIdentity = serde_json::from_value(json).unwrap();
        assert!(!identity.has_display_name());
    }
}
