//! Physical input handling: debounced trigger, long-hold factory reset, and
//! optical samples from the hit sensor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use phaser_core::storage::PersistedState;
use phaser_core::time::Clock;

use crate::sensor::HitSensor;
use crate::shot::ShotHandler;
use crate::wireless::BroadcastMedium;

/// Events delivered by the board layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// Trigger edge.
    Trigger,
    ResetPressed,
    ResetReleased,
    /// A bit pattern sampled by the optical receiver.
    Optical { bits: u32 },
}

/// Rejects trigger edges closer together than the re-arm delay.
#[derive(Debug, Clone)]
pub struct Debouncer {
    rearm_ms: u64,
    last_accepted_ms: Option<u64>,
}

impl Debouncer {
    pub fn new(rearm_ms: u64) -> Self {
        Self {
            rearm_ms,
            last_accepted_ms: None,
        }
    }

    pub fn accept(&mut self, now_ms: u64) -> bool {
        match self.last_accepted_ms {
            Some(last) if now_ms.saturating_sub(last) < self.rearm_ms => false,
            _ => {
                self.last_accepted_ms = Some(now_ms);
                true
            },
        }
    }
}

/// Why the input task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputExit {
    Cancelled,
    /// The board layer went away.
    Disconnected,
    FactoryReset,
}

pub struct InputHandler<M> {
    shots: ShotHandler<M>,
    sensor: HitSensor<M>,
    persisted: PersistedState,
    clock: Arc<dyn Clock>,
    debouncer: Debouncer,
    reset_hold: Duration,
}

impl<M: BroadcastMedium> InputHandler<M> {
    pub fn new(
        shots: ShotHandler<M>,
        sensor: HitSensor<M>,
        persisted: PersistedState,
        clock: Arc<dyn Clock>,
        debounce_ms: u64,
        reset_hold_ms: u64,
    ) -> Self {
        Self {
            shots,
            sensor,
            persisted,
            clock,
            debouncer: Debouncer::new(debounce_ms),
            reset_hold: Duration::from_millis(reset_hold_ms),
        }
    }

    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<InputEvent>,
        cancel: CancellationToken,
    ) -> InputExit {
        let mut reset_deadline: Option<Instant> = None;
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return InputExit::Cancelled,
                _ = sleep_until(reset_deadline.unwrap_or_else(Instant::now)),
                    if reset_deadline.is_some() =>
                {
                    self.factory_reset();
                    return InputExit::FactoryReset;
                },
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return InputExit::Disconnected,
                },
            };
            match event {
                InputEvent::Trigger => {
                    if self.debouncer.accept(self.clock.now_ms()) {
                        // Rejections are logged by the handler.
                        let _ = self.shots.fire().await;
                    }
                },
                InputEvent::ResetPressed => {
                    reset_deadline.get_or_insert_with(|| Instant::now() + self.reset_hold);
                },
                InputEvent::ResetReleased => {
                    if reset_deadline.take().is_some() {
                        tracing::debug!("reset released before hold time");
                    }
                },
                InputEvent::Optical { bits } => {
                    self.sensor.on_optical(bits).await;
                },
            }
        }
    }

    fn factory_reset(&self) {
        tracing::warn!("reset held, erasing persisted state");
        if let Err(e) = self.persisted.factory_reset() {
            tracing::error!("factory reset failed: {e}");
        }
    }
}

/// Host emulation of a trigger pulled on a fixed period.
pub async fn auto_fire(
    events: mpsc::Sender<InputEvent>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if events.send(InputEvent::Trigger).await.is_err() {
                    break;
                }
            },
        }
    }
}
