use serde::{Deserialize, Serialize};

/// Kills that signal the deathmatch win condition to the server.
pub const DEATHMATCH_KILL_GOAL: u32 = 10;

/// Ruleset governing win conditions and connectivity requirements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    /// Shooting allowed while disconnected, no win condition.
    #[default]
    Free,
    /// Everyone else is hostile; kill goal is signalled to the server.
    Deathmatch,
    /// Same-team hits are suppressed locally.
    Team,
    CaptureFlag,
    Timed,
}

impl GameMode {
    /// Whether shots need a live server session in this mode.
    pub fn requires_server(self) -> bool {
        self != Self::Free
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Deathmatch => "DEATHMATCH",
            Self::Team => "TEAM",
            Self::CaptureFlag => "CAPTURE_FLAG",
            Self::Timed => "TIMED",
        }
    }
}

impl std::fmt::Display for GameMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether the player can currently shoot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Active,
    Respawning,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Active => "ACTIVE",
            Self::Respawning => "RESPAWNING",
        })
    }
}

/// Session rules pushed by the server. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub mode: GameMode,
    pub max_ammo: u32,
    pub unlimited_ammo: bool,
    pub respawn_duration_ms: u64,
    pub max_hearts: u32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            mode: GameMode::Free,
            max_ammo: 30,
            unlimited_ammo: false,
            respawn_duration_ms: 5000,
            max_hearts: 3,
        }
    }
}

/// Snapshot of the mutable session ledger. Every field of one snapshot
/// belongs to the same logical update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStateData {
    pub session_state: SessionState,
    pub mode: GameMode,
    pub ammo: u32,
    pub kills: u32,
    pub deaths: u32,
    pub shots_fired: u32,
    pub hits_landed: u32,
    pub hearts_remaining: u32,
    /// Only set while respawning.
    pub respawn_deadline_ms: Option<u64>,
}

impl GameStateData {
    pub fn new(config: &GameConfig) -> Self {
        Self {
            session_state: SessionState::Active,
            mode: config.mode,
            ammo: config.max_ammo,
            kills: 0,
            deaths: 0,
            shots_fired: 0,
            hits_landed: 0,
            hearts_remaining: config.max_hearts,
            respawn_deadline_ms: None,
        }
    }

    /// True while the deathmatch kill goal is met.
    pub fn goal_reached(&self) -> bool {
        self.mode == GameMode::Deathmatch && self.kills >= DEATHMATCH_KILL_GOAL
    }
}

/// Why the trigger did not produce a shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShotRejection {
    Respawning,
    ServerRequired(GameMode),
    OutOfAmmo,
}

impl std::fmt::Display for ShotRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Respawning => write!(f, "respawning"),
            Self::ServerRequired(mode) => write!(f, "{mode} requires a server connection"),
            Self::OutOfAmmo => write!(f, "out of ammo"),
        }
    }
}

/// How a wireless HIT_EVENT addressed to this device is applied.
///
/// The receiving device cannot tell from the envelope alone whether it
/// scored the hit or took it, so the interpretation is configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitConfirmationPolicy {
    /// Record both a hit taken and a kill scored.
    #[default]
    Conflated,
    /// The envelope reports that this device was hit.
    TargetOnly,
    /// The envelope confirms that this device's shot landed.
    ShooterOnly,
}

impl HitConfirmationPolicy {
    pub fn records_hit(self) -> bool {
        matches!(self, Self::Conflated | Self::TargetOnly)
    }

    pub fn records_kill(self) -> bool {
        matches!(self, Self::Conflated | Self::ShooterOnly)
    }
}
