//! Fixed-cadence game loop: respawn timer, deathmatch goal, periodic stats.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use phaser_core::envelope::{EnvelopeKind, ShotEnvelope};
use phaser_core::net::messages::{ClientMessage, RespawnCompleteMsg};
use phaser_core::store::{GameMetrics, GameStateStore};
use phaser_core::time::{Clock, Ticker, wire_timestamp};

use crate::wireless::{BroadcastMedium, WirelessLink};

/// Respawn poll period.
pub const GAME_TICK: Duration = Duration::from_millis(100);

/// How often a stats line is logged.
pub const STATS_INTERVAL_MS: u64 = 30_000;

pub struct GameLoop<M> {
    store: GameStateStore,
    clock: Arc<dyn Clock>,
    wireless: Option<Arc<WirelessLink<M>>>,
    outbox: Option<mpsc::Sender<ClientMessage>>,
    stats: Ticker,
}

impl<M: BroadcastMedium> GameLoop<M> {
    pub fn new(store: GameStateStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            wireless: None,
            outbox: None,
            stats: Ticker::new(STATS_INTERVAL_MS),
        }
    }

    pub fn with_wireless(mut self, link: Arc<WirelessLink<M>>) -> Self {
        self.wireless = Some(link);
        self
    }

    pub fn with_outbox(mut self, outbox: mpsc::Sender<ClientMessage>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(GAME_TICK);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                },
            }
        }
        tracing::debug!("game loop stopped");
    }

    /// One pass of the loop. Returns true if a respawn completed.
    pub async fn tick(&mut self) -> bool {
        let now = self.clock.now_ms();
        let respawned = self.store.check_respawn(now);
        if respawned {
            self.announce_respawn(now).await;
        }
        if let Some(kills) = self.store.deathmatch_goal_pending() {
            tracing::info!(kills, "deathmatch kill goal reached");
        }
        if self.stats.poll(now) {
            log_stats(&self.store, now);
        }
        respawned
    }

    async fn announce_respawn(&self, now: u64) {
        let identity = self.store.identity();
        tracing::info!(ammo = self.store.snapshot().ammo, "respawn complete");

        if let Some(outbox) = &self.outbox
            && self.store.is_server_connected()
        {
            let msg = ClientMessage::RespawnComplete(RespawnCompleteMsg {
                device_id: identity.device_id,
                timestamp_ms: wire_timestamp(now),
            });
            if outbox.try_send(msg).is_err() {
                tracing::warn!("server outbox full, respawn not relayed");
            }
        }

        if let Some(link) = &self.wireless {
            let envelope = ShotEnvelope::from_identity(
                EnvelopeKind::Respawn,
                &identity,
                0,
                wire_timestamp(now),
            );
            if link.broadcast(&envelope).await {
                self.store.record_tx();
            }
        }
    }
}

/// Log one line of counters. Takes the read-only view a display would get.
pub fn log_stats(metrics: &dyn GameMetrics, now_ms: u64) {
    let snap = metrics.snapshot();
    let link = metrics.link_stats(now_ms);
    tracing::info!(
        uptime_ms = now_ms,
        mode = %snap.mode,
        state = %snap.session_state,
        ammo = snap.ammo,
        kills = snap.kills,
        deaths = snap.deaths,
        shots = snap.shots_fired,
        hearts = snap.hearts_remaining,
        server = metrics.server_connected(),
        tx = link.tx_count,
        rx = link.rx_count,
        last_rx_ms_ago = ?link.last_rx_ms_ago,
        "stats"
    );
}
