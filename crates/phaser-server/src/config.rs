use serde::Deserialize;

use phaser_core::game::GameConfig;

const CONFIG_FILE: &str = "phaser-server.toml";

/// Top-level server configuration, loaded from `phaser-server.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub auth: AuthFileConfig,
    pub limits: LimitsConfig,
    pub sessions: SessionsConfig,
    /// Rules pushed to every device on registration.
    pub game: GameConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            auth: AuthFileConfig::default(),
            limits: LimitsConfig::default(),
            sessions: SessionsConfig::default(),
            game: GameConfig::default(),
        }
    }
}

/// Connection caps, buffer sizes, rate limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_ws_connections: usize,
    pub ws_rate_limit_per_sec: f64,
    /// Outbound queue depth per device connection.
    pub device_message_buffer: usize,
    /// How long a new connection may take to send its Register.
    pub register_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_ws_connections: 64,
            ws_rate_limit_per_sec: 20.0,
            device_message_buffer: 64,
            register_timeout_secs: 10,
        }
    }
}

/// Device session lifecycle.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// A device silent for this long is dropped. Devices heartbeat every 5 s.
    pub stale_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            stale_timeout_secs: 20,
            cleanup_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthFileConfig {
    pub bearer_token: Option<String>,
}

#[derive(Debug)]
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

/// Reject rules a device could not play by. Shared by startup validation and
/// the admin API.
pub fn validate_game_config(game: &GameConfig) -> Result<(), ConfigError> {
    if !game.unlimited_ammo && game.max_ammo == 0 {
        return Err(invalid("game.max_ammo", "must be > 0 unless ammo is unlimited"));
    }
    if game.respawn_duration_ms == 0 {
        return Err(invalid("game.respawn_duration_ms", "must be > 0"));
    }
    if game.max_hearts == 0 {
        return Err(invalid("game.max_hearts", "must be > 0"));
    }
    Ok(())
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(invalid(
                "listen_addr",
                format!("{} is not a valid socket address", self.listen_addr),
            ));
        }

        if self.auth.bearer_token.is_some() {
            tracing::warn!(
                "bearer_token is set in config file, use PHASER_API_TOKEN env var in production"
            );
        }

        if self.limits.max_ws_connections == 0 {
            return Err(invalid("limits.max_ws_connections", "must be > 0"));
        }
        if self.limits.ws_rate_limit_per_sec <= 0.0 {
            return Err(invalid("limits.ws_rate_limit_per_sec", "must be > 0"));
        }
        if self.limits.device_message_buffer < 4 {
            return Err(invalid(
                "limits.device_message_buffer",
                "must hold at least the registration burst (4)",
            ));
        }
        if self.limits.register_timeout_secs == 0 {
            return Err(invalid("limits.register_timeout_secs", "must be > 0"));
        }

        if self.sessions.stale_timeout_secs == 0 {
            return Err(invalid("sessions.stale_timeout_secs", "must be > 0"));
        }
        if self.sessions.cleanup_interval_secs == 0 {
            return Err(invalid("sessions.cleanup_interval_secs", "must be > 0"));
        }

        validate_game_config(&self.game)
    }

    /// Load config from `phaser-server.toml` if it exists, then apply env var
    /// overrides.
    pub fn load() -> Self {
        let mut config = match std::fs::read_to_string(CONFIG_FILE) {
            Ok(content) => match toml::from_str::<ServerConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!("Loaded configuration from {CONFIG_FILE}");
                    cfg
                },
                Err(e) => {
                    tracing::warn!("Failed to parse {CONFIG_FILE}: {e}, using defaults");
                    ServerConfig::default()
                },
            },
            Err(_) => {
                tracing::info!("No {CONFIG_FILE} found, using defaults");
                ServerConfig::default()
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply `PHASER_*` overrides from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("PHASER_LISTEN_ADDR")
            && !addr.is_empty()
        {
            self.listen_addr = addr;
        }
        if let Some(token) = lookup("PHASER_API_TOKEN")
            && !token.is_empty()
        {
            self.auth.bearer_token = Some(token);
        }
        if let Some(val) = lookup("PHASER_MAX_WS_CONNECTIONS")
            && let Ok(n) = val.parse::<usize>()
        {
            self.limits.max_ws_connections = n;
        }
        if let Some(val) = lookup("PHASER_WS_RATE_LIMIT")
            && let Ok(n) = val.parse::<f64>()
        {
            self.limits.ws_rate_limit_per_sec = n;
        }
        if let Some(val) = lookup("PHASER_STALE_TIMEOUT_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.sessions.stale_timeout_secs = n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phaser_core::game::GameMode;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080");
        assert!(cfg.auth.bearer_token.is_none());
        assert_eq!(cfg.game, GameConfig::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn parse_minimal_toml() {
        let toml_str = r#"
listen_addr = "127.0.0.1:9090"

[auth]
bearer_token = "secret123"

[game]
mode = "team"
max_ammo = 12
"#;
        let cfg: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9090");
        assert_eq!(cfg.auth.bearer_token.as_deref(), Some("secret123"));
        assert_eq!(cfg.game.mode, GameMode::Team);
        assert_eq!(cfg.game.max_ammo, 12);
        assert_eq!(cfg.game.max_hearts, 3);
        assert_eq!(cfg.limits.max_ws_connections, 64);
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("PHASER_LISTEN_ADDR", "127.0.0.1:7000"),
            ("PHASER_API_TOKEN", "tok"),
            ("PHASER_WS_RATE_LIMIT", "5.5"),
            ("PHASER_STALE_TIMEOUT_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut cfg = ServerConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.listen_addr, "127.0.0.1:7000");
        assert_eq!(cfg.auth.bearer_token.as_deref(), Some("tok"));
        assert_eq!(cfg.limits.ws_rate_limit_per_sec, 5.5);
        assert_eq!(cfg.sessions.stale_timeout_secs, 20);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut cfg = ServerConfig {
            listen_addr: "nowhere".to_string(),
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_err());

        cfg.listen_addr = "127.0.0.1:0".to_string();
        cfg.limits.device_message_buffer = 2;
        assert!(cfg.validate().is_err());

        cfg.limits.device_message_buffer = 16;
        cfg.game.max_ammo = 0;
        assert!(cfg.validate().is_err());
        cfg.game.unlimited_ammo = true;
        cfg.validate().unwrap();
    }
}
