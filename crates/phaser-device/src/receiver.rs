//! Wireless receive task: applies HIT_EVENTs addressed to this device and
//! submits credited kills to the server for arbitration.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use phaser_core::envelope::Envelope;
use phaser_core::game::HitConfirmationPolicy;
use phaser_core::net::messages::{ClientMessage, HitReportMsg};
use phaser_core::store::{GameStateStore, WirelessHitOutcome};
use phaser_core::time::Clock;

use crate::wireless::{BroadcastMedium, WirelessLink, addressed_to};

/// Default wait per receive call.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

pub struct WirelessReceiver<M> {
    link: Arc<WirelessLink<M>>,
    store: GameStateStore,
    clock: Arc<dyn Clock>,
    policy: HitConfirmationPolicy,
    timeout: Duration,
    outbox: Option<mpsc::Sender<ClientMessage>>,
}

impl<M: BroadcastMedium> WirelessReceiver<M> {
    pub fn new(
        link: Arc<WirelessLink<M>>,
        store: GameStateStore,
        clock: Arc<dyn Clock>,
        policy: HitConfirmationPolicy,
    ) -> Self {
        Self {
            link,
            store,
            clock,
            policy,
            timeout: RECEIVE_TIMEOUT,
            outbox: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_outbox(mut self, outbox: mpsc::Sender<ClientMessage>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                envelope = self.link.receive(self.timeout) => envelope,
            };
            if let Some(envelope) = envelope {
                self.handle(&envelope);
            }
        }
        tracing::debug!("wireless receiver stopped");
    }

    /// Apply one received envelope. Returns the hit outcome when the
    /// envelope passed the self-filter.
    pub fn handle(&self, envelope: &Envelope) -> Option<WirelessHitOutcome> {
        let now = self.clock.now_ms();
        self.store.record_rx(now);
        let identity = self.store.identity();
        let msg = &envelope.msg;
        if !addressed_to(&identity, msg) {
            tracing::trace!(
                src = %envelope.src,
                kind = ?msg.kind,
                device_id = msg.device_id,
                "envelope not addressed to this device"
            );
            return None;
        }

        let outcome = self.store.apply_wireless_hit(msg.team_id, self.policy, now);
        match outcome {
            WirelessHitOutcome::Suppressed { team_id } => {
                tracing::info!(team_id, player_id = msg.player_id, "friendly hit suppressed");
            },
            WirelessHitOutcome::Applied {
                hit_taken,
                kill_scored,
            } => {
                tracing::info!(
                    src = %envelope.src,
                    player_id = msg.player_id,
                    hit_taken,
                    kill_scored,
                    "hit event applied"
                );
                if kill_scored {
                    self.report_kill(identity.player_id, msg.player_id, msg.payload);
                }
            },
        }
        Some(outcome)
    }

    fn report_kill(&self, shooter_id: u16, target_id: u16, payload: u32) {
        let Some(outbox) = &self.outbox else {
            return;
        };
        if !self.store.is_server_connected() {
            tracing::debug!(target_id, "offline, hit report not sent");
            return;
        }
        let report = ClientMessage::HitReport(HitReportMsg {
            shooter_id,
            target_id,
            payload,
        });
        if outbox.try_send(report).is_err() {
            tracing::warn!(target_id, "server outbox full, hit report dropped");
        }
    }
}
