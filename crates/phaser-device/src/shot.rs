//! Trigger-to-transmission path.
//!
//! Gating and accounting happen atomically in the store; the accepted shot is
//! then handed to the optical queue, the wireless link, and the server outbox.
//! None of these steps blocks: a full optical queue drops the optical message
//! and leaves the other paths untouched.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use phaser_core::codec::{OpticalCodec, OpticalMessage};
use phaser_core::envelope::{EnvelopeKind, ShotEnvelope};
use phaser_core::game::ShotRejection;
use phaser_core::net::messages::{ClientMessage, ShotFiredMsg};
use phaser_core::store::{GameStateStore, ShotTicket};
use phaser_core::time::{Clock, wire_timestamp};

use crate::wireless::{BroadcastMedium, WirelessLink};

/// What happened to one accepted shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShotOutcome {
    pub ticket: ShotTicket,
    pub message: OpticalMessage,
    pub optical_enqueued: bool,
    /// `None` when no wireless link is up.
    pub wireless_sent: Option<bool>,
}

pub struct ShotHandler<M> {
    store: GameStateStore,
    codec: OpticalCodec,
    clock: Arc<dyn Clock>,
    optical: Option<mpsc::Sender<OpticalMessage>>,
    wireless: Option<Arc<WirelessLink<M>>>,
    outbox: Option<mpsc::Sender<ClientMessage>>,
}

impl<M: BroadcastMedium> ShotHandler<M> {
    pub fn new(store: GameStateStore, codec: OpticalCodec, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            codec,
            clock,
            optical: None,
            wireless: None,
            outbox: None,
        }
    }

    pub fn with_optical(mut self, queue: mpsc::Sender<OpticalMessage>) -> Self {
        self.optical = Some(queue);
        self
    }

    pub fn with_wireless(mut self, link: Arc<WirelessLink<M>>) -> Self {
        self.wireless = Some(link);
        self
    }

    pub fn with_outbox(mut self, outbox: mpsc::Sender<ClientMessage>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Handle one trigger pull.
    pub async fn fire(&self) -> Result<ShotOutcome, ShotRejection> {
        let ticket = match self.store.try_fire() {
            Ok(ticket) => ticket,
            Err(rejection) => {
                tracing::debug!(%rejection, "shot rejected");
                return Err(rejection);
            },
        };
        let identity = self.store.identity();
        let message = self.codec.encode(ticket.counter, identity.device_id);
        let timestamp_ms = wire_timestamp(self.clock.now_ms());

        let optical_enqueued = self.enqueue_optical(message);

        let wireless_sent = match &self.wireless {
            Some(link) => {
                let envelope = ShotEnvelope::from_identity(
                    EnvelopeKind::Shot,
                    &identity,
                    message.bits(),
                    timestamp_ms,
                );
                let sent = link.broadcast(&envelope).await;
                if sent {
                    self.store.record_tx();
                }
                Some(sent)
            },
            None => None,
        };

        if let Some(outbox) = &self.outbox
            && self.store.is_server_connected()
        {
            let msg = ClientMessage::ShotFired(ShotFiredMsg {
                device_id: identity.device_id,
                counter: ticket.counter,
                timestamp_ms,
            });
            if outbox.try_send(msg).is_err() {
                tracing::debug!(counter = ticket.counter, "server outbox full, shot not relayed");
            }
        }

        tracing::info!(
            counter = ticket.counter,
            ammo = ?ticket.ammo,
            optical_enqueued,
            ?wireless_sent,
            "shot fired"
        );
        Ok(ShotOutcome {
            ticket,
            message,
            optical_enqueued,
            wireless_sent,
        })
    }

    fn enqueue_optical(&self, message: OpticalMessage) -> bool {
        let Some(queue) = &self.optical else {
            return false;
        };
        match queue.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(bits = %message, "optical queue full, dropping message");
                false
            },
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(bits = %message, "optical transmitter gone, dropping message");
                false
            },
        }
    }
}
