//! Optical message codec.
//!
//! An optical message is a fixed-width value: identity bits, then counter
//! bits, then a checksum over both. The receiver samples at the same fixed
//! bit period as the transmitter, so there is no framing; a message whose
//! checksum does not match is dropped.

use std::time::Duration;

use crc::{CRC_4_G_704, CRC_8_SMBUS, Crc};
use serde::{Deserialize, Serialize};

use crate::identity::DeviceId;

const CRC4: Crc<u8> = Crc::<u8>::new(&CRC_4_G_704);
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Checksum algorithm appended to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    Crc4,
    Crc8,
}

impl Checksum {
    pub const fn bits(self) -> u8 {
        match self {
            Self::Crc4 => 4,
            Self::Crc8 => 8,
        }
    }

    fn compute(self, data: &[u8]) -> u8 {
        match self {
            Self::Crc4 => CRC4.checksum(data),
            Self::Crc8 => CRC8.checksum(data),
        }
    }
}

/// Bit layout and timing of one device generation. Every device in a
/// deployment must use the same format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFormat {
    pub identity_bits: u8,
    pub counter_bits: u8,
    pub checksum: Checksum,
    /// XORed into the CRC so an idle (all-zero) line never decodes.
    pub checksum_seed: u8,
    pub bit_period_ms: u64,
}

impl MessageFormat {
    /// 16-bit message: 4 identity, 8 counter, 4 checksum bits.
    pub const COMPACT: Self = Self {
        identity_bits: 4,
        counter_bits: 8,
        checksum: Checksum::Crc4,
        checksum_seed: 0xA,
        bit_period_ms: 5,
    };

    /// 32-bit message: 8 identity, 16 counter, 8 checksum bits.
    pub const EXTENDED: Self = Self {
        identity_bits: 8,
        counter_bits: 16,
        checksum: Checksum::Crc8,
        checksum_seed: 0xA5,
        bit_period_ms: 3,
    };

    pub const fn data_bits(&self) -> u8 {
        self.identity_bits + self.counter_bits
    }

    /// Total message width `W`.
    pub const fn total_bits(&self) -> u8 {
        self.data_bits() + self.checksum.bits()
    }

    /// Bit period `T`.
    pub fn bit_period(&self) -> Duration {
        Duration::from_millis(self.bit_period_ms)
    }

    /// Time the pin is busy for one message (`W * T`).
    pub fn transmit_duration(&self) -> Duration {
        self.bit_period() * u32::from(self.total_bits())
    }

    /// Largest counter value before it wraps.
    pub const fn max_counter(&self) -> u32 {
        mask(self.counter_bits)
    }

    /// Whether a device id fits the identity field without truncation.
    pub const fn fits_device_id(&self, device_id: DeviceId) -> bool {
        device_id as u32 <= mask(self.identity_bits)
    }

    fn checksum_of(&self, data: u32) -> u32 {
        let len = usize::from(self.data_bits().div_ceil(8));
        let bytes = data.to_be_bytes();
        let crc = self.checksum.compute(&bytes[bytes.len() - len..]) ^ self.checksum_seed;
        u32::from(crc) & mask(self.checksum.bits())
    }
}

/// Named device generations, as selected in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageGeneration {
    #[default]
    Compact,
    Extended,
}

impl MessageGeneration {
    pub fn format(self) -> MessageFormat {
        match self {
            Self::Compact => MessageFormat::COMPACT,
            Self::Extended => MessageFormat::EXTENDED,
        }
    }
}

const fn mask(bits: u8) -> u32 {
    if bits >= 32 { u32::MAX } else { (1u32 << bits) - 1 }
}

/// An encoded optical message ready for transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpticalMessage {
    bits: u32,
    width: u8,
}

impl OpticalMessage {
    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    /// Bit levels in transmission order, most significant bit first.
    pub fn levels(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.width).rev().map(move |i| (self.bits >> i) & 1 == 1)
    }
}

impl std::fmt::Display for OpticalMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:0width$b}", self.bits, width = usize::from(self.width))
    }
}

/// Fields recovered from a valid optical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedMessage {
    pub device_id: DeviceId,
    pub counter: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    InvalidChecksum { expected: u32, actual: u32 },
    OutOfRange { bits: u32, width: u8 },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidChecksum { expected, actual } => {
                write!(f, "invalid checksum: expected 0x{expected:x}, got 0x{actual:x}")
            },
            Self::OutOfRange { bits, width } => {
                write!(f, "value 0x{bits:x} does not fit in {width} bits")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Pure encoder/decoder for one message format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpticalCodec {
    format: MessageFormat,
}

impl OpticalCodec {
    pub fn new(format: MessageFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> &MessageFormat {
        &self.format
    }

    /// Encode a shot counter for a device. Both fields are truncated to the
    /// format's widths; the counter wraps.
    pub fn encode(&self, counter: u32, device_id: DeviceId) -> OpticalMessage {
        let f = &self.format;
        let identity = u32::from(device_id) & mask(f.identity_bits);
        let data = (identity << f.counter_bits) | (counter & mask(f.counter_bits));
        let checksum = f.checksum_of(data);
        OpticalMessage {
            bits: (data << f.checksum.bits()) | checksum,
            width: f.total_bits(),
        }
    }

    /// Validate and unpack a received bit pattern.
    pub fn decode(&self, bits: u32) -> Result<DecodedMessage, CodecError> {
        let f = &self.format;
        let width = f.total_bits();
        if bits & !mask(width) != 0 {
            return Err(CodecError::OutOfRange { bits, width });
        }
        let actual = bits & mask(f.checksum.bits());
        let data = bits >> f.checksum.bits();
        let expected = f.checksum_of(data);
        if actual != expected {
            return Err(CodecError::InvalidChecksum { expected, actual });
        }
        Ok(DecodedMessage {
            device_id: (data >> f.counter_bits) as DeviceId,
            counter: data & mask(f.counter_bits),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn compact_layout_is_sixteen_bits() {
        assert_eq!(MessageFormat::COMPACT.total_bits(), 16);
        assert_eq!(MessageFormat::EXTENDED.total_bits(), 32);
        assert_eq!(
            MessageFormat::COMPACT.transmit_duration(),
            Duration::from_millis(80)
        );
    }

    #[test]
    fn compact_roundtrip_all_counters() {
        let codec = OpticalCodec::new(MessageFormat::COMPACT);
        for counter in 0..=codec.format().max_counter() {
            let msg = codec.encode(counter, 5);
            assert_eq!(
                codec.decode(msg.bits()),
                Ok(DecodedMessage {
                    device_id: 5,
                    counter
                })
            );
        }
    }

    #[test]
    fn compact_rejects_every_single_bit_flip() {
        let codec = OpticalCodec::new(MessageFormat::COMPACT);
        for device_id in 0..16u8 {
            for counter in 0..=codec.format().max_counter() {
                let msg = codec.encode(counter, device_id);
                for bit in 0..msg.width() {
                    let corrupted = msg.bits() ^ (1 << bit);
                    assert!(
                        matches!(
                            codec.decode(corrupted),
                            Err(CodecError::InvalidChecksum { .. })
                        ),
                        "flip of bit {bit} in {msg} accepted"
                    );
                }
            }
        }
    }

    #[test]
    fn idle_line_never_decodes() {
        for format in [MessageFormat::COMPACT, MessageFormat::EXTENDED] {
            let codec = OpticalCodec::new(format);
            assert!(codec.decode(0).is_err());
        }
    }

    #[test]
    fn counter_wraps_at_format_width() {
        let codec = OpticalCodec::new(MessageFormat::COMPACT);
        assert_eq!(codec.encode(256, 3), codec.encode(0, 3));
        assert_eq!(codec.decode(codec.encode(257, 3).bits()).unwrap().counter, 1);
    }

    #[test]
    fn identity_is_truncated_to_format_width() {
        let codec = OpticalCodec::new(MessageFormat::COMPACT);
        let decoded = codec.decode(codec.encode(9, 0x15).bits()).unwrap();
        assert_eq!(decoded.device_id, 0x5);
    }

    #[test]
    fn oversized_value_is_out_of_range() {
        let codec = OpticalCodec::new(MessageFormat::COMPACT);
        let msg = codec.encode(1, 1);
        assert_eq!(
            codec.decode(msg.bits() | 0x1_0000),
            Err(CodecError::OutOfRange {
                bits: msg.bits() | 0x1_0000,
                width: 16
            })
        );
    }

    #[test]
    fn levels_are_msb_first() {
        let codec = OpticalCodec::new(MessageFormat::COMPACT);
        let msg = codec.encode(0x81, 0x8);
        let levels: Vec<bool> = msg.levels().collect();
        assert_eq!(levels.len(), 16);
        // identity 0b1000 leads the message
        assert_eq!(&levels[..4], &[true, false, false, false]);
        // counter 0b1000_0001 follows
        assert_eq!(
            &levels[4..12],
            &[true, false, false, false, false, false, false, true]
        );
        assert_eq!(msg.to_string().len(), 16);
    }

    proptest! {
        #[test]
        fn extended_roundtrip(counter in 0u32..=0xFFFF, device_id in any::<u8>()) {
            let codec = OpticalCodec::new(MessageFormat::EXTENDED);
            let decoded = codec.decode(codec.encode(counter, device_id).bits()).unwrap();
            prop_assert_eq!(decoded, DecodedMessage { device_id, counter });
        }

        #[test]
        fn extended_rejects_single_bit_flip(
            counter in 0u32..=0xFFFF,
            device_id in any::<u8>(),
            bit in 0u8..32,
        ) {
            let codec = OpticalCodec::new(MessageFormat::EXTENDED);
            let msg = codec.encode(counter, device_id);
            let is_invalid_checksum = matches!(
                codec.decode(msg.bits() ^ (1 << bit)),
                Err(CodecError::InvalidChecksum { .. })
            );
            prop_assert!(is_invalid_checksum);
        }
    }
}
