use serde::{Deserialize, Serialize};

use crate::identity::{DeviceId, DeviceIdentity, PlayerColor, PlayerId, TeamId};

/// Current wireless envelope version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Wireless event discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EnvelopeKind {
    Shot = 1,
    HitEvent = 2,
    Heartbeat = 3,
    Respawn = 4,
}

impl EnvelopeKind {
    /// Kinds whose payload mirrors an optical message.
    pub fn carries_optical_payload(self) -> bool {
        matches!(self, Self::Shot | Self::HitEvent)
    }
}

/// One event as broadcast on the wireless channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShotEnvelope {
    pub kind: EnvelopeKind,
    pub version: u8,
    pub player_id: PlayerId,
    pub device_id: DeviceId,
    pub team_id: TeamId,
    pub color: PlayerColor,
    /// Mirrors the optical message bits.
    pub payload: u32,
    pub timestamp_ms: u32,
}

impl ShotEnvelope {
    pub fn from_identity(
        kind: EnvelopeKind,
        identity: &DeviceIdentity,
        payload: u32,
        timestamp_ms: u32,
    ) -> Self {
        Self {
            kind,
            version: ENVELOPE_VERSION,
            player_id: identity.player_id,
            device_id: identity.device_id,
            team_id: identity.team_id,
            color: identity.color,
            payload,
            timestamp_ms,
        }
    }
}

/// A received envelope together with the link address it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub src: LinkAddr,
    pub msg: ShotEnvelope,
}

/// Six-byte radio link address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkAddr(pub [u8; 6]);

impl LinkAddr {
    pub const BROADCAST: LinkAddr = LinkAddr([0xFF; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl std::fmt::Display for LinkAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerParseError {
    InvalidAddress(String),
    Broadcast,
}

impl std::fmt::Display for PeerParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidAddress(s) => write!(f, "invalid link address: {s:?}"),
            Self::Broadcast => write!(f, "broadcast address cannot be a peer"),
        }
    }
}

impl std::error::Error for PeerParseError {}

impl std::str::FromStr for LinkAddr {
    type Err = PeerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PeerParseError::InvalidAddress(s.to_string());
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split([':', '-']);
        for octet in &mut octets {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(LinkAddr(octets))
    }
}

/// Ordered, duplicate-free allow-list of wireless peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSet {
    peers: Vec<LinkAddr>,
}

impl PeerSet {
    /// Parse a comma-separated address list. Blank entries are skipped and
    /// duplicates keep their first position.
    pub fn from_csv(csv: &str) -> Result<Self, PeerParseError> {
        let mut set = Self::default();
        for entry in csv.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let addr: LinkAddr = entry.parse()?;
            if addr == LinkAddr::BROADCAST {
                return Err(PeerParseError::Broadcast);
            }
            set.insert(addr);
        }
        Ok(set)
    }

    pub fn to_csv(&self) -> String {
        self.peers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Returns false if the address was already present.
    pub fn insert(&mut self, addr: LinkAddr) -> bool {
        if self.peers.contains(&addr) {
            return false;
        }
        self.peers.push(addr);
        true
    }

    pub fn contains(&self, addr: &LinkAddr) -> bool {
        self.peers.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LinkAddr> {
        self.peers.iter()
    }
}
