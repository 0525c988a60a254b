//! Optical hit sensor: turns raw bit patterns sampled by the receiver into a
//! provisional local hit and a HIT_EVENT broadcast naming the shooter.

use std::sync::Arc;

use phaser_core::codec::{DecodedMessage, OpticalCodec};
use phaser_core::envelope::{EnvelopeKind, ShotEnvelope};
use phaser_core::store::GameStateStore;
use phaser_core::time::{Clock, wire_timestamp};

use crate::wireless::{BroadcastMedium, WirelessLink};

pub struct HitSensor<M> {
    store: GameStateStore,
    codec: OpticalCodec,
    clock: Arc<dyn Clock>,
    wireless: Option<Arc<WirelessLink<M>>>,
}

impl<M: BroadcastMedium> HitSensor<M> {
    pub fn new(
        store: GameStateStore,
        codec: OpticalCodec,
        clock: Arc<dyn Clock>,
        wireless: Option<Arc<WirelessLink<M>>>,
    ) -> Self {
        Self {
            store,
            codec,
            clock,
            wireless,
        }
    }

    /// Handle one sampled message. Returns the decoded shooter when the hit
    /// was accepted.
    pub async fn on_optical(&self, bits: u32) -> Option<DecodedMessage> {
        let decoded = match self.codec.decode(bits) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!(bits, "discarding optical message: {e}");
                return None;
            },
        };
        let identity = self.store.identity();
        if decoded.device_id == identity.device_id {
            tracing::debug!("ignoring own reflection");
            return None;
        }
        let now = self.clock.now_ms();
        if !self.store.record_optical_hit(now) {
            tracing::debug!(shooter = decoded.device_id, "hit while respawning ignored");
            return None;
        }
        tracing::info!(
            shooter = decoded.device_id,
            counter = decoded.counter,
            "hit by optical message"
        );

        if let Some(link) = &self.wireless {
            let mut envelope = ShotEnvelope::from_identity(
                EnvelopeKind::HitEvent,
                &identity,
                bits,
                wire_timestamp(now),
            );
            envelope.device_id = decoded.device_id;
            if link.broadcast(&envelope).await {
                self.store.record_tx();
            }
        }
        Some(decoded)
    }
}
