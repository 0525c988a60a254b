//! The Game State Store: the single shared source of truth for identity,
//! configuration, counters, and session state.
//!
//! `GameStateStore` is a cheap cloneable handle. Every operation takes the
//! lock exactly once, so readers never observe fields from different logical
//! updates.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::game::{
    DEATHMATCH_KILL_GOAL, GameConfig, GameMode, GameStateData, HitConfirmationPolicy,
    SessionState, ShotRejection,
};
use crate::identity::{DeviceIdentity, PlayerId, TeamId};
use crate::time::{Deadline, Ticker};

/// Interval between heartbeats while connected to the server.
pub const HEARTBEAT_INTERVAL_MS: u64 = 5000;

/// How long an optimistic hit or kill waits for a server verdict before it
/// is considered final.
pub const PROVISIONAL_WINDOW_MS: u64 = 5000;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notifications for display and other observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameEvent {
    /// `ammo` is `None` with unlimited ammo.
    ShotFired { ammo: Option<u32> },
    ShotRejected(ShotRejection),
    HitTaken { hearts_remaining: u32 },
    KillScored { kills: u32 },
    Respawned,
    ConfigApplied { mode: GameMode },
    ServerLink { connected: bool },
    Corrected(Correction),
    GoalReached { kills: u32 },
}

/// A provisional update the server ruled out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    KillRevoked,
    DeathRevoked,
}

/// An accepted shot, ready for encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShotTicket {
    /// Per-device shot counter fed to the optical codec.
    pub counter: u32,
    /// Remaining ammo, `None` when unlimited.
    pub ammo: Option<u32>,
    pub shots_fired: u32,
}

/// Result of applying a wireless HIT_EVENT addressed to this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WirelessHitOutcome {
    /// TEAM mode, sender on our team.
    Suppressed { team_id: TeamId },
    Applied { hit_taken: bool, kill_scored: bool },
}

/// What a server hit verdict did to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictOutcome {
    /// Matched an optimistic update; nothing changed.
    Confirmed,
    /// No optimistic update existed; the verdict was applied directly.
    Applied,
    /// An optimistic update was reverted.
    RolledBack,
    /// The verdict does not concern this device or changes nothing.
    Ignored,
}

/// Wireless traffic counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    pub tx_count: u32,
    pub rx_count: u32,
    pub last_rx_ms_ago: Option<u64>,
}

/// Read-only view handed to display and metrics consumers.
pub trait GameMetrics: Send + Sync {
    fn snapshot(&self) -> GameStateData;
    fn identity(&self) -> DeviceIdentity;
    fn server_connected(&self) -> bool;
    fn link_stats(&self, now_ms: u64) -> LinkStats;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProvisionalKind {
    Kill,
    Death,
}

#[derive(Debug, Clone, Copy)]
struct Provisional {
    kind: ProvisionalKind,
    at_ms: u64,
}

struct StoreInner {
    identity: DeviceIdentity,
    config: GameConfig,
    data: GameStateData,
    shot_counter: u32,
    server_connected: bool,
    heartbeat: Ticker,
    goal_signalled: bool,
    tx_count: u32,
    rx_count: u32,
    last_rx_ms: Option<u64>,
    provisional: VecDeque<Provisional>,
    events: broadcast::Sender<GameEvent>,
}

impl StoreInner {
    fn emit(&self, event: GameEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn gate(&self) -> Result<(), ShotRejection> {
        if self.data.session_state == SessionState::Respawning {
            return Err(ShotRejection::Respawning);
        }
        if self.data.mode.requires_server() && !self.server_connected {
            return Err(ShotRejection::ServerRequired(self.data.mode));
        }
        if !self.config.unlimited_ammo && self.data.ammo == 0 {
            return Err(ShotRejection::OutOfAmmo);
        }
        Ok(())
    }

    fn ammo_view(&self) -> Option<u32> {
        (!self.config.unlimited_ammo).then_some(self.data.ammo)
    }

    /// Returns false if already respawning.
    fn take_hit(&mut self, now_ms: u64) -> bool {
        if self.data.session_state == SessionState::Respawning {
            return false;
        }
        let deadline = Deadline::after(now_ms, self.config.respawn_duration_ms);
        self.data.deaths = self.data.deaths.saturating_add(1);
        self.data.hearts_remaining = self.data.hearts_remaining.saturating_sub(1);
        self.data.session_state = SessionState::Respawning;
        self.data.respawn_deadline_ms = Some(deadline.at_ms());
        self.emit(GameEvent::HitTaken {
            hearts_remaining: self.data.hearts_remaining,
        });
        true
    }

    fn score_kill(&mut self) {
        self.data.kills = self.data.kills.saturating_add(1);
        self.data.hits_landed = self.data.hits_landed.saturating_add(1);
        self.emit(GameEvent::KillScored {
            kills: self.data.kills,
        });
    }

    fn finish_respawn(&mut self) {
        self.data.session_state = SessionState::Active;
        self.data.respawn_deadline_ms = None;
        self.data.ammo = self.config.max_ammo;
        self.emit(GameEvent::Respawned);
    }

    fn prune_provisional(&mut self, now_ms: u64) {
        self.provisional
            .retain(|p| now_ms.saturating_sub(p.at_ms) < PROVISIONAL_WINDOW_MS);
    }

    fn take_provisional(&mut self, kind: ProvisionalKind) -> bool {
        match self.provisional.iter().position(|p| p.kind == kind) {
            Some(idx) => {
                self.provisional.remove(idx);
                true
            },
            None => false,
        }
    }

    fn verdict_as_shooter(&mut self, valid: bool) -> VerdictOutcome {
        let pending = self.take_provisional(ProvisionalKind::Kill);
        match (valid, pending) {
            (true, true) => VerdictOutcome::Confirmed,
            (true, false) => {
                self.score_kill();
                VerdictOutcome::Applied
            },
            (false, true) => {
                self.data.kills = self.data.kills.saturating_sub(1);
                self.data.hits_landed = self.data.hits_landed.saturating_sub(1);
                self.emit(GameEvent::Corrected(Correction::KillRevoked));
                VerdictOutcome::RolledBack
            },
            (false, false) => VerdictOutcome::Ignored,
        }
    }

    fn verdict_as_target(&mut self, valid: bool, now_ms: u64) -> VerdictOutcome {
        let pending = self.take_provisional(ProvisionalKind::Death);
        match (valid, pending) {
            (true, true) => VerdictOutcome::Confirmed,
            (true, false) => {
                if self.take_hit(now_ms) {
                    VerdictOutcome::Applied
                } else {
                    VerdictOutcome::Ignored
                }
            },
            (false, true) => {
                self.data.deaths = self.data.deaths.saturating_sub(1);
                self.data.hearts_remaining =
                    (self.data.hearts_remaining + 1).min(self.config.max_hearts);
                if self.data.session_state == SessionState::Respawning {
                    self.data.session_state = SessionState::Active;
                    self.data.respawn_deadline_ms = None;
                }
                self.emit(GameEvent::Corrected(Correction::DeathRevoked));
                VerdictOutcome::RolledBack
            },
            (false, false) => VerdictOutcome::Ignored,
        }
    }
}

/// Shared handle to the game state.
#[derive(Clone)]
pub struct GameStateStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl GameStateStore {
    pub fn new(identity: DeviceIdentity, config: GameConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let data = GameStateData::new(&config);
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                identity,
                config,
                data,
                shot_counter: 0,
                server_connected: false,
                heartbeat: Ticker::new(HEARTBEAT_INTERVAL_MS),
                goal_signalled: false,
                tx_count: 0,
                rx_count: 0,
                last_rx_ms: None,
                provisional: VecDeque::new(),
                events,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to state change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.lock().events.subscribe()
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.lock().identity.clone()
    }

    pub fn config(&self) -> GameConfig {
        self.lock().config.clone()
    }

    pub fn snapshot(&self) -> GameStateData {
        self.lock().data.clone()
    }

    /// Gate and account for one trigger pull.
    pub fn try_fire(&self) -> Result<ShotTicket, ShotRejection> {
        let mut s = self.lock();
        if let Err(rejection) = s.gate() {
            s.emit(GameEvent::ShotRejected(rejection));
            return Err(rejection);
        }
        if !s.config.unlimited_ammo {
            s.data.ammo -= 1;
        }
        s.data.shots_fired = s.data.shots_fired.saturating_add(1);
        s.shot_counter = s.shot_counter.wrapping_add(1);
        let ticket = ShotTicket {
            counter: s.shot_counter,
            ammo: s.ammo_view(),
            shots_fired: s.data.shots_fired,
        };
        s.emit(GameEvent::ShotFired { ammo: ticket.ammo });
        Ok(ticket)
    }

    /// This device was hit: count the death and start the respawn timer.
    /// Returns false if a respawn was already in progress.
    pub fn record_hit(&self, now_ms: u64) -> bool {
        self.lock().take_hit(now_ms)
    }

    /// A valid optical message from another device reached this device's
    /// sensor. Counted like `record_hit` but held provisional until the
    /// server verdict.
    pub fn record_optical_hit(&self, now_ms: u64) -> bool {
        let mut s = self.lock();
        s.prune_provisional(now_ms);
        let taken = s.take_hit(now_ms);
        if taken {
            s.provisional.push_back(Provisional {
                kind: ProvisionalKind::Death,
                at_ms: now_ms,
            });
        }
        taken
    }

    /// This device scored a kill.
    pub fn record_kill(&self) {
        self.lock().score_kill();
    }

    /// Returns true exactly once when a running respawn timer expires.
    pub fn check_respawn(&self, now_ms: u64) -> bool {
        let mut s = self.lock();
        if s.data.session_state != SessionState::Respawning {
            return false;
        }
        let due = s
            .data
            .respawn_deadline_ms
            .is_none_or(|deadline| now_ms >= deadline);
        if due {
            s.finish_respawn();
        }
        due
    }

    /// Replace the configuration wholesale. Refills ammo and hearts.
    pub fn apply_config(&self, config: GameConfig) {
        let mut s = self.lock();
        if s.data.mode != config.mode {
            s.goal_signalled = false;
        }
        s.data.mode = config.mode;
        s.data.ammo = config.max_ammo;
        s.data.hearts_remaining = config.max_hearts;
        s.config = config;
        let mode = s.config.mode;
        s.emit(GameEvent::ConfigApplied { mode });
    }

    /// Apply the server's view of mode and session state. Returns true if
    /// the local session state changed.
    pub fn apply_server_state(&self, mode: GameMode, state: SessionState, now_ms: u64) -> bool {
        let mut s = self.lock();
        if s.data.mode != mode {
            s.goal_signalled = false;
        }
        s.data.mode = mode;
        s.config.mode = mode;
        match (s.data.session_state, state) {
            (SessionState::Active, SessionState::Respawning) => {
                let deadline = Deadline::after(now_ms, s.config.respawn_duration_ms);
                s.data.session_state = SessionState::Respawning;
                s.data.respawn_deadline_ms = Some(deadline.at_ms());
                true
            },
            (SessionState::Respawning, SessionState::Active) => {
                s.finish_respawn();
                true
            },
            _ => false,
        }
    }

    /// Apply a wireless HIT_EVENT that already passed the self-filter. Both
    /// mutations are provisional until the server rules on them.
    pub fn apply_wireless_hit(
        &self,
        sender_team: TeamId,
        policy: HitConfirmationPolicy,
        now_ms: u64,
    ) -> WirelessHitOutcome {
        let mut s = self.lock();
        if s.data.mode == GameMode::Team && sender_team == s.identity.team_id {
            return WirelessHitOutcome::Suppressed {
                team_id: sender_team,
            };
        }
        s.prune_provisional(now_ms);
        let hit_taken = policy.records_hit() && s.take_hit(now_ms);
        if hit_taken {
            s.provisional.push_back(Provisional {
                kind: ProvisionalKind::Death,
                at_ms: now_ms,
            });
        }
        let kill_scored = policy.records_kill();
        if kill_scored {
            s.score_kill();
            s.provisional.push_back(Provisional {
                kind: ProvisionalKind::Kill,
                at_ms: now_ms,
            });
        }
        WirelessHitOutcome::Applied {
            hit_taken,
            kill_scored,
        }
    }

    /// Reconcile local counters with an authoritative hit verdict.
    pub fn apply_verdict(
        &self,
        shooter_id: PlayerId,
        target_id: PlayerId,
        valid: bool,
        now_ms: u64,
    ) -> VerdictOutcome {
        let mut s = self.lock();
        s.prune_provisional(now_ms);
        let me = s.identity.player_id;
        if shooter_id == target_id {
            VerdictOutcome::Ignored
        } else if shooter_id == me {
            s.verdict_as_shooter(valid)
        } else if target_id == me {
            s.verdict_as_target(valid, now_ms)
        } else {
            VerdictOutcome::Ignored
        }
    }

    pub fn set_server_connected(&self, connected: bool) {
        let mut s = self.lock();
        if s.server_connected == connected {
            return;
        }
        s.server_connected = connected;
        if connected {
            s.heartbeat.reset();
        }
        s.emit(GameEvent::ServerLink { connected });
    }

    pub fn is_server_connected(&self) -> bool {
        self.lock().server_connected
    }

    /// True when a heartbeat should be sent now. Fires immediately after
    /// each reconnect.
    pub fn heartbeat_due(&self, now_ms: u64) -> bool {
        self.lock().heartbeat.poll(now_ms)
    }

    /// True while the deathmatch kill goal is met.
    pub fn goal_reached(&self) -> bool {
        self.lock().data.goal_reached()
    }

    /// Returns the kill count the first time the deathmatch goal is met in
    /// the current mode; `None` afterwards.
    pub fn deathmatch_goal_pending(&self) -> Option<u32> {
        let mut s = self.lock();
        if s.goal_signalled
            || s.data.mode != GameMode::Deathmatch
            || s.data.kills < DEATHMATCH_KILL_GOAL
        {
            return None;
        }
        s.goal_signalled = true;
        let kills = s.data.kills;
        s.emit(GameEvent::GoalReached { kills });
        Some(kills)
    }

    pub fn record_tx(&self) {
        let mut s = self.lock();
        s.tx_count = s.tx_count.wrapping_add(1);
    }

    pub fn record_rx(&self, now_ms: u64) {
        let mut s = self.lock();
        s.rx_count = s.rx_count.wrapping_add(1);
        s.last_rx_ms = Some(now_ms);
    }

    /// Set the display name if none exists yet. Returns false if a name was
    /// already present.
    pub fn set_display_name(&self, name: String) -> bool {
        let mut s = self.lock();
        if s.identity.has_display_name() {
            return false;
        }
        s.identity.display_name = name;
        true
    }
}

impl GameMetrics for GameStateStore {
    fn snapshot(&self) -> GameStateData {
        GameStateStore::snapshot(self)
    }

    fn identity(&self) -> DeviceIdentity {
        GameStateStore::identity(self)
    }

    fn server_connected(&self) -> bool {
        self.is_server_connected()
    }

    fn link_stats(&self, now_ms: u64) -> LinkStats {
        let s = self.lock();
        LinkStats {
            tx_count: s.tx_count,
            rx_count: s.rx_count,
            last_rx_ms_ago: s.last_rx_ms.map(|at| now_ms.saturating_sub(at)),
        }
    }
}
