use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use phaser_core::codec::MessageGeneration;
use phaser_core::envelope::{LinkAddr, PeerSet};
use phaser_core::game::{GameConfig, HitConfirmationPolicy};
use phaser_core::identity::{DeviceId, DeviceIdentity, DeviceRole, PlayerColor};

/// Default config file name.
pub const CONFIG_FILE: &str = "phaser.toml";

/// Top-level device configuration, loaded from `phaser.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Where persisted identity, peers, and game config live.
    pub storage_path: PathBuf,
    pub identity: IdentityConfig,
    pub optical: OpticalConfig,
    pub wireless: WirelessConfig,
    pub server: ServerLinkConfig,
    pub input: InputConfig,
    /// Game config used until the server pushes one.
    pub game: GameConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("phaser-state.toml"),
            identity: IdentityConfig::default(),
            optical: OpticalConfig::default(),
            wireless: WirelessConfig::default(),
            server: ServerLinkConfig::default(),
            input: InputConfig::default(),
            game: GameConfig::default(),
        }
    }
}

/// Provisioning values, used only when no identity is persisted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub device_id: u8,
    pub player_id: u16,
    pub team_id: u8,
    pub role: DeviceRole,
    pub display_name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            device_id: 1,
            player_id: 1,
            team_id: 0,
            role: DeviceRole::Weapon,
            display_name: String::new(),
        }
    }
}

impl IdentityConfig {
    pub fn to_identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            device_id: self.device_id,
            player_id: self.player_id,
            team_id: self.team_id,
            color: PlayerColor::for_team(self.team_id),
            role: self.role,
            display_name: self.display_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpticalConfig {
    pub generation: MessageGeneration,
    /// Pending messages the transmitter may hold.
    pub queue_capacity: usize,
    /// Emitter pin number, for logs only on the host.
    pub pin: u8,
}

impl Default for OpticalConfig {
    fn default() -> Self {
        Self {
            generation: MessageGeneration::Compact,
            queue_capacity: 5,
            pin: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WirelessConfig {
    pub enabled: bool,
    /// Radio channel; must match the network association's channel.
    pub channel: u8,
    /// Hex-encoded pre-shared key.
    pub psk: Option<String>,
    /// Comma-separated peer addresses. Persisted on first boot if no peer
    /// list is stored yet.
    pub peers: Option<String>,
    /// This device's link address. Derived from the device id if unset.
    pub link_addr: Option<String>,
    /// UDP port of channel 0; each channel adds one.
    pub base_port: u16,
    pub bind_ip: IpAddr,
    pub broadcast_ip: IpAddr,
    pub hit_policy: HitConfirmationPolicy,
    pub receive_timeout_ms: u64,
}

impl Default for WirelessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel: 1,
            psk: None,
            peers: None,
            link_addr: None,
            base_port: 47_000,
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            broadcast_ip: IpAddr::from([255, 255, 255, 255]),
            hit_policy: HitConfirmationPolicy::Conflated,
            receive_timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerLinkConfig {
    /// WebSocket URL, e.g. `ws://10.0.0.2:8080/ws`. Offline when unset.
    pub url: Option<String>,
    pub tick_ms: u64,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    pub register_timeout_ms: u64,
    pub outbox_capacity: usize,
}

impl Default for ServerLinkConfig {
    fn default() -> Self {
        Self {
            url: None,
            tick_ms: 1000,
            reconnect_min_ms: 1000,
            reconnect_max_ms: 30_000,
            register_timeout_ms: 5000,
            outbox_capacity: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Minimum time between accepted trigger pulls.
    pub debounce_ms: u64,
    /// How long the reset button must be held for a factory reset.
    pub reset_hold_ms: u64,
    /// Pull the trigger on this period. Host emulation only.
    pub auto_fire_ms: Option<u64>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 150,
            reset_hold_ms: 2000,
            auto_fire_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { field: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid { field, reason } => write!(f, "{field}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl DeviceConfig {
    /// Load `phaser.toml` from the working directory, then apply env
    /// overrides.
    pub fn load() -> Self {
        let mut config = Self::load_file(Path::new(CONFIG_FILE));
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Parse a config file, falling back to defaults when it is missing or
    /// unparsable.
    pub fn load_file(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<DeviceConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!(path = %path.display(), "Loaded device configuration");
                    cfg
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        "Failed to parse config: {e}, using defaults"
                    );
                    DeviceConfig::default()
                },
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                DeviceConfig::default()
            },
        }
    }

    /// Apply `PHASER_*` overrides. Unparsable values are ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| var(key).filter(|v| !v.is_empty());

        if let Some(path) = get("PHASER_STORAGE_PATH") {
            self.storage_path = PathBuf::from(path);
        }
        if let Some(v) = get("PHASER_DEVICE_ID")
            && let Ok(n) = v.parse()
        {
            self.identity.device_id = n;
        }
        if let Some(v) = get("PHASER_PLAYER_ID")
            && let Ok(n) = v.parse()
        {
            self.identity.player_id = n;
        }
        if let Some(v) = get("PHASER_TEAM_ID")
            && let Ok(n) = v.parse()
        {
            self.identity.team_id = n;
        }
        if let Some(v) = get("PHASER_ROLE")
            && let Ok(role) = v.parse()
        {
            self.identity.role = role;
        }
        if let Some(url) = get("PHASER_SERVER_URL") {
            self.server.url = Some(url);
        }
        if let Some(psk) = get("PHASER_PSK") {
            self.wireless.psk = Some(psk);
        }
        if let Some(peers) = get("PHASER_PEERS") {
            self.wireless.peers = Some(peers);
        }
        if let Some(v) = get("PHASER_WIRELESS_CHANNEL")
            && let Ok(n) = v.parse()
        {
            self.wireless.channel = n;
        }
        if let Some(v) = get("PHASER_AUTO_FIRE_MS")
            && let Ok(n) = v.parse()
        {
            self.input.auto_fire_ms = Some(n);
        }
    }

    /// Reject a device id the configured optical format cannot carry.
    pub fn check_device_id(&self, device_id: DeviceId) -> Result<(), ConfigError> {
        let format = self.optical.generation.format();
        if !format.fits_device_id(device_id) {
            return Err(invalid(
                "identity.device_id",
                format!(
                    "{device_id} does not fit the {}-bit identity field",
                    format.identity_bits
                ),
            ));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.check_device_id(self.identity.device_id)?;
        if self.optical.queue_capacity == 0 {
            return Err(invalid("optical.queue_capacity", "must be > 0"));
        }
        if self.wireless.enabled {
            if !crate::wireless::CHANNELS.contains(&self.wireless.channel) {
                return Err(invalid(
                    "wireless.channel",
                    format!("{} is not in 1..=14", self.wireless.channel),
                ));
            }
            if let Some(psk) = &self.wireless.psk {
                let key = hex::decode(psk).map_err(|e| invalid("wireless.psk", e.to_string()))?;
                if key.is_empty() {
                    return Err(invalid("wireless.psk", "must not be empty"));
                }
            }
            if let Some(peers) = &self.wireless.peers {
                PeerSet::from_csv(peers).map_err(|e| invalid("wireless.peers", e.to_string()))?;
            }
            if let Some(addr) = &self.wireless.link_addr {
                addr.parse::<LinkAddr>()
                    .map_err(|e| invalid("wireless.link_addr", e.to_string()))?;
            }
        }
        if self.wireless.receive_timeout_ms == 0 {
            return Err(invalid("wireless.receive_timeout_ms", "must be > 0"));
        }
        if let Some(url) = &self.server.url
            && !(url.starts_with("ws://") || url.starts_with("wss://"))
        {
            return Err(invalid("server.url", "must be a ws:// or wss:// URL"));
        }
        if self.server.tick_ms == 0 {
            return Err(invalid("server.tick_ms", "must be > 0"));
        }
        if self.server.reconnect_min_ms == 0
            || self.server.reconnect_max_ms < self.server.reconnect_min_ms
        {
            return Err(invalid(
                "server.reconnect_max_ms",
                "must be >= reconnect_min_ms > 0",
            ));
        }
        if self.server.outbox_capacity == 0 {
            return Err(invalid("server.outbox_capacity", "must be > 0"));
        }
        if self.input.auto_fire_ms == Some(0) {
            return Err(invalid("input.auto_fire_ms", "must be > 0"));
        }
        if self.game.respawn_duration_ms == 0 {
            return Err(invalid("game.respawn_duration_ms", "must be > 0"));
        }
        Ok(())
    }

    /// Decoded pre-shared key, if configured.
    pub fn psk(&self) -> Option<Vec<u8>> {
        self.wireless
            .psk
            .as_deref()
            .and_then(|psk| hex::decode(psk).ok())
            .filter(|key| !key.is_empty())
    }

    /// Configured link address, or one derived from `device_id`. Pass the
    /// identity the device actually boots with, not the provisioning value.
    pub fn link_addr(&self, device_id: DeviceId) -> LinkAddr {
        self.wireless
            .link_addr
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(LinkAddr([0x02, 0x50, 0x48, 0x00, 0x00, device_id]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaser_core::game::GameMode;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let cfg = DeviceConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.optical.queue_capacity, 5);
        assert_eq!(cfg.input.debounce_ms, 150);
        assert_eq!(cfg.input.reset_hold_ms, 2000);
        assert_eq!(cfg.wireless.receive_timeout_ms, 500);
        assert_eq!(cfg.server.tick_ms, 1000);
        assert!(cfg.server.url.is_none());
    }

    #[test]
    fn parse_sectioned_toml() {
        let toml_str = r#"
storage_path = "/var/lib/phaser/state.toml"

[identity]
device_id = 5
player_id = 2
team_id = 1
role = "vest"

[wireless]
channel = 6
psk = "00112233445566778899aabbccddeeff"
peers = "AA:00:00:00:00:01,AA:00:00:00:00:02"
hit_policy = "shooter_only"

[server]
url = "ws://10.0.0.2:8080/ws"

[game]
mode = "team"
max_ammo = 10
"#;
        let cfg: DeviceConfig = toml::from_str(toml_str).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.identity.device_id, 5);
        assert_eq!(cfg.identity.role, DeviceRole::Vest);
        assert_eq!(cfg.wireless.channel, 6);
        assert_eq!(cfg.wireless.hit_policy, HitConfirmationPolicy::ShooterOnly);
        assert_eq!(cfg.psk().map(|k| k.len()), Some(16));
        assert_eq!(cfg.game.mode, GameMode::Team);
        assert_eq!(cfg.game.respawn_duration_ms, 5000);
        assert_eq!(cfg.optical.queue_capacity, 5);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("PHASER_DEVICE_ID", "9"),
            ("PHASER_ROLE", "VEST"),
            ("PHASER_SERVER_URL", "ws://127.0.0.1:9000/ws"),
            ("PHASER_TEAM_ID", "not-a-number"),
            ("PHASER_PEERS", ""),
        ]
        .into_iter()
        .collect();
        let mut cfg = DeviceConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.identity.device_id, 9);
        assert_eq!(cfg.identity.role, DeviceRole::Vest);
        assert_eq!(cfg.server.url.as_deref(), Some("ws://127.0.0.1:9000/ws"));
        assert_eq!(cfg.identity.team_id, 0);
        assert!(cfg.wireless.peers.is_none());
    }

    #[test]
    fn device_id_must_fit_format() {
        let mut cfg = DeviceConfig::default();
        cfg.identity.device_id = 16;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid {
                field: "identity.device_id",
                ..
            })
        ));
        cfg.optical.generation = MessageGeneration::Extended;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let cases: Vec<(&str, Box<dyn Fn(&mut DeviceConfig)>)> = vec![
            ("optical.queue_capacity", Box::new(|c| c.optical.queue_capacity = 0)),
            ("wireless.channel", Box::new(|c| c.wireless.channel = 15)),
            ("wireless.psk", Box::new(|c| c.wireless.psk = Some("xyz".into()))),
            ("wireless.peers", Box::new(|c| c.wireless.peers = Some("AA:BB".into()))),
            ("server.url", Box::new(|c| c.server.url = Some("http://x".into()))),
            ("input.auto_fire_ms", Box::new(|c| c.input.auto_fire_ms = Some(0))),
        ];
        for (field, mutate) in cases {
            let mut cfg = DeviceConfig::default();
            mutate(&mut cfg);
            match cfg.validate() {
                Err(ConfigError::Invalid { field: f, .. }) => assert_eq!(f, field),
                Ok(()) => panic!("{field} accepted"),
            }
        }
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = DeviceConfig::load_file(Path::new("/nonexistent/phaser.toml"));
        assert_eq!(cfg.identity.device_id, 1);
    }

    #[test]
    fn derived_link_addr_uses_given_device_id() {
        let mut cfg = DeviceConfig::default();
        cfg.identity.device_id = 7;
        assert_eq!(cfg.link_addr(9).to_string(), "02:50:48:00:00:09");
        cfg.wireless.link_addr = Some("AA:BB:CC:DD:EE:FF".into());
        assert_eq!(cfg.link_addr(9).to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn device_id_check_follows_optical_generation() {
        let cfg = DeviceConfig::default();
        assert!(cfg.check_device_id(15).is_ok());
        assert!(cfg.check_device_id(20).is_err());
    }
}
