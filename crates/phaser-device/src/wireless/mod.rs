//! Wireless broadcast layer: sealed envelopes over a shared medium, with a
//! peer allow-list and payload validation on receipt.

pub mod medium;

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use phaser_core::codec::OpticalCodec;
use phaser_core::envelope::{Envelope, EnvelopeKind, LinkAddr, PeerSet, ShotEnvelope};
use phaser_core::identity::DeviceIdentity;
use phaser_core::net::frame::{FrameError, open_envelope, seal_envelope};

pub use medium::{BroadcastMedium, LoopbackHub, LoopbackMedium, MediumError, UdpMedium};

/// Radio channels usable by the link.
pub const CHANNELS: std::ops::RangeInclusive<u8> = 1..=14;

#[derive(Debug)]
pub enum WirelessError {
    InvalidChannel(u8),
    NoKey,
    NoPeers,
    Medium(MediumError),
}

impl std::fmt::Display for WirelessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidChannel(ch) => write!(f, "invalid wireless channel {ch}"),
            Self::NoKey => write!(f, "no pre-shared key configured"),
            Self::NoPeers => write!(f, "no wireless peers configured"),
            Self::Medium(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WirelessError {}

impl From<MediumError> for WirelessError {
    fn from(e: MediumError) -> Self {
        Self::Medium(e)
    }
}

/// An initialized wireless link on one channel.
pub struct WirelessLink<M> {
    medium: M,
    key: Vec<u8>,
    peers: RwLock<PeerSet>,
    channel: u8,
    codec: OpticalCodec,
}

impl<M: BroadcastMedium> WirelessLink<M> {
    pub fn init(
        medium: M,
        channel: u8,
        key: Vec<u8>,
        peers: PeerSet,
        codec: OpticalCodec,
    ) -> Result<Self, WirelessError> {
        if !CHANNELS.contains(&channel) {
            return Err(WirelessError::InvalidChannel(channel));
        }
        if key.is_empty() {
            return Err(WirelessError::NoKey);
        }
        if peers.is_empty() {
            return Err(WirelessError::NoPeers);
        }
        tracing::info!(
            channel,
            peers = peers.len(),
            local = %medium.local_addr(),
            "wireless link up"
        );
        Ok(Self {
            medium,
            key,
            peers: RwLock::new(peers),
            channel,
            codec,
        })
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn medium(&self) -> &M {
        &self.medium
    }

    /// Replace the allow-list. Frames received after this call are checked
    /// against the new set.
    pub fn reload_peers(&self, peers: PeerSet) {
        if peers.is_empty() {
            tracing::warn!("peer reload leaves no authorized senders");
        }
        tracing::info!(peers = peers.len(), "wireless peers reloaded");
        *self.peers.write().unwrap_or_else(PoisonError::into_inner) = peers;
    }

    fn is_peer(&self, src: &LinkAddr) -> bool {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(src)
    }

    /// Best-effort broadcast. Failures are logged and never retried.
    pub async fn broadcast(&self, envelope: &ShotEnvelope) -> bool {
        let frame = match seal_envelope(envelope, &self.key) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(kind = ?envelope.kind, "failed to seal envelope: {e}");
                return false;
            },
        };
        match self.medium.send(&frame).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(kind = ?envelope.kind, "wireless broadcast failed: {e}");
                false
            },
        }
    }

    /// Wait up to `timeout` for the next valid envelope from a peer. Frames
    /// from unknown senders or failing validation are dropped.
    pub async fn receive(&self, timeout: Duration) -> Option<Envelope> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let received = tokio::time::timeout_at(deadline, self.medium.recv()).await;
            let (src, frame) = match received {
                Err(_) => return None,
                Ok(Err(e)) => {
                    tracing::debug!("wireless receive error: {e}");
                    // A failing medium waits out the timeout.
                    tokio::time::sleep_until(deadline).await;
                    return None;
                },
                Ok(Ok(received)) => received,
            };
            if !self.is_peer(&src) {
                tracing::debug!(%src, "dropping frame from unknown sender");
                continue;
            }
            match self.open(&frame) {
                Ok(msg) => return Some(Envelope { src, msg }),
                Err(e) => tracing::debug!(%src, "dropping invalid frame: {e}"),
            }
        }
    }

    fn open(&self, frame: &[u8]) -> Result<ShotEnvelope, ReceiveError> {
        let msg = open_envelope(frame, &self.key).map_err(ReceiveError::Frame)?;
        if msg.kind.carries_optical_payload() {
            let decoded = self
                .codec
                .decode(msg.payload)
                .map_err(|_| ReceiveError::Payload)?;
            if decoded.device_id != msg.device_id {
                return Err(ReceiveError::Payload);
            }
        }
        Ok(msg)
    }
}

#[derive(Debug)]
enum ReceiveError {
    Frame(FrameError),
    Payload,
}

impl std::fmt::Display for ReceiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "{e}"),
            Self::Payload => write!(f, "payload does not decode for the sender"),
        }
    }
}

/// The self-filter: only HIT_EVENTs naming this device are applied.
pub fn addressed_to(local: &DeviceIdentity, envelope: &ShotEnvelope) -> bool {
    envelope.kind == EnvelopeKind::HitEvent && envelope.device_id == local.device_id
}
