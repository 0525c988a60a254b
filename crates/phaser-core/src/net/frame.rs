//! Wireless frame sealing.
//!
//! A frame is the MessagePack-encoded envelope followed by a truncated
//! HMAC-SHA256 tag keyed with the pre-shared key. The tag keeps devices from
//! other sessions (different key) and line noise out of the game state; it is
//! a validity check, not an authentication scheme.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::envelope::{ENVELOPE_VERSION, ShotEnvelope};

type HmacSha256 = Hmac<Sha256>;

/// Largest frame the radio accepts in one transmission.
pub const MAX_FRAME_SIZE: usize = 250;

/// Truncated tag length in bytes.
pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    TooShort(usize),
    TooLarge(usize),
    BadTag,
    UnsupportedVersion(u8),
    InvalidKey,
    SerializeError(String),
    DeserializeError(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort(len) => write!(f, "frame too short: {len} bytes"),
            Self::TooLarge(len) => {
                write!(f, "frame too large: {len} bytes (max {MAX_FRAME_SIZE})")
            },
            Self::BadTag => write!(f, "frame tag mismatch"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported envelope version {v}"),
            Self::InvalidKey => write!(f, "invalid pre-shared key"),
            Self::SerializeError(e) => write!(f, "serialize error: {e}"),
            Self::DeserializeError(e) => write!(f, "deserialize error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

fn mac_for(key: &[u8], body: &[u8]) -> Result<HmacSha256, FrameError> {
    if key.is_empty() {
        return Err(FrameError::InvalidKey);
    }
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| FrameError::InvalidKey)?;
    mac.update(body);
    Ok(mac)
}

/// Serialize and seal an envelope for broadcast.
pub fn seal_envelope(envelope: &ShotEnvelope, key: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut frame =
        rmp_serde::to_vec(envelope).map_err(|e| FrameError::SerializeError(e.to_string()))?;
    let tag = mac_for(key, &frame)?.finalize().into_bytes();
    frame.extend_from_slice(&tag[..TAG_LEN]);
    if frame.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(frame.len()));
    }
    Ok(frame)
}

/// Verify and decode a received frame.
pub fn open_envelope(frame: &[u8], key: &[u8]) -> Result<ShotEnvelope, FrameError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(frame.len()));
    }
    if frame.len() <= TAG_LEN {
        return Err(FrameError::TooShort(frame.len()));
    }
    let (body, tag) = frame.split_at(frame.len() - TAG_LEN);
    mac_for(key, body)?
        .verify_truncated_left(tag)
        .map_err(|_| FrameError::BadTag)?;
    let envelope: ShotEnvelope =
        rmp_serde::from_slice(body).map_err(|e| FrameError::DeserializeError(e.to_string()))?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(FrameError::UnsupportedVersion(envelope.version));
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeKind;
    use crate::identity::PlayerColor;

    const KEY: &[u8] = b"phaser-test-key!";

    fn envelope() -> ShotEnvelope {
        ShotEnvelope {
            kind: EnvelopeKind::HitEvent,
            version: ENVELOPE_VERSION,
            player_id: 2,
            device_id: 5,
            team_id: 1,
            color: PlayerColor::for_team(1),
            payload: 0x5a13,
            timestamp_ms: 123_456,
        }
    }

    #[test]
    fn sealed_frame_opens_with_same_key() {
        let frame = seal_envelope(&envelope(), KEY).unwrap();
        assert!(frame.len() <= MAX_FRAME_SIZE);
        assert_eq!(open_envelope(&frame, KEY).unwrap(), envelope());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let frame = seal_envelope(&envelope(), KEY).unwrap();
        assert_eq!(
            open_envelope(&frame, b"another-session"),
            Err(FrameError::BadTag)
        );
    }

    #[test]
    fn tampered_body_is_rejected() {
        let mut frame = seal_envelope(&envelope(), KEY).unwrap();
        frame[1] ^= 0x01;
        assert_eq!(open_envelope(&frame, KEY), Err(FrameError::BadTag));
    }

    #[test]
    fn short_and_oversized_frames_are_rejected() {
        assert_eq!(open_envelope(&[0; 4], KEY), Err(FrameError::TooShort(4)));
        assert_eq!(
            open_envelope(&[0; MAX_FRAME_SIZE + 1], KEY),
            Err(FrameError::TooLarge(MAX_FRAME_SIZE + 1))
        );
    }

    #[test]
    fn future_version_is_rejected() {
        let mut env = envelope();
        env.version = ENVELOPE_VERSION + 1;
        let frame = seal_envelope(&env, KEY).unwrap();
        assert_eq!(
            open_envelope(&frame, KEY),
            Err(FrameError::UnsupportedVersion(ENVELOPE_VERSION + 1))
        );
    }

    #[test]
    fn empty_key_is_invalid() {
        assert_eq!(seal_envelope(&envelope(), b""), Err(FrameError::InvalidKey));
    }
}
