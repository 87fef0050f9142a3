//! L2CAP Packet Structures and Parsing
//!
//! Basic frame header and the reserved channel identifiers. Every L2CAP PDU
//! starts with a 4-byte header holding the payload length and the
//! destination channel:
//!
//! ```text
//! length (2, LE) | channel id (2, LE) | payload
//! ```

use crate::Error;

/// L2CAP packet parsing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum L2capError {
    /// Packet data is too short for the header or the declared payload
    InsufficientData,
    /// The declared payload length does not match the frame
    LengthMismatch,
    /// Unrecognized signaling command code
    UnknownCode(u8),
}

impl core::fmt::Display for L2capError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data for L2CAP packet"),
            Self::LengthMismatch => write!(f, "L2CAP length mismatch"),
            Self::UnknownCode(code) => write!(f, "unknown signaling code 0x{code:02x}"),
        }
    }
}

impl From<L2capError> for Error {
    fn from(_: L2capError) -> Self {
        Self::InvalidPacket
    }
}

/// L2CAP Channel Identifier (CID)
///
/// - 0x0000: reserved
/// - 0x0001: BR/EDR signaling
/// - 0x0004: Attribute protocol
/// - 0x0005: LE signaling
/// - 0x0006: Security manager
/// - 0x0040 and up: dynamically allocated
pub type ChannelId = u16;

/// L2CAP Protocol Service Multiplexer (PSM)
pub type ProtocolServiceMultiplexer = u16;

/// L2CAP reserved channel identifiers
pub mod cid {
    use super::ChannelId;

    /// Reserved - shall not be used
    pub const NULL: ChannelId = 0x0000;
    /// BR/EDR signaling channel
    pub const SIGNALING: ChannelId = 0x0001;
    /// Attribute protocol
    pub const ATT: ChannelId = 0x0004;
    /// LE signaling channel
    pub const LE_SIGNALING: ChannelId = 0x0005;
    /// Security manager protocol
    pub const SMP: ChannelId = 0x0006;
}

/// Well-known Protocol Service Multiplexers
pub mod psm {
    use super::ProtocolServiceMultiplexer;

    /// Internet Protocol Support Profile
    pub const IPSP: ProtocolServiceMultiplexer = 0x0023;
    /// Object Transfer Service
    pub const OTS: ProtocolServiceMultiplexer = 0x0025;
}

/// L2CAP Basic Header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct L2capHeader {
    /// Length of the payload (not including the header itself)
    pub length: u16,
    /// Channel identifier of the intended recipient
    pub channel_id: ChannelId,
}

impl L2capHeader {
    /// Size of the L2CAP header in bytes
    pub const SIZE: usize = 4;

    /// Create a new L2CAP header
    #[must_use]
    pub fn new(length: u16, channel_id: ChannelId) -> Self {
        Self { length, channel_id }
    }

    /// Parse L2CAP header from byte slice
    ///
    /// # Errors
    /// Returns `L2capError::InsufficientData` if the slice is less than 4 bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, L2capError> {
        let [l0, l1, c0, c1, ..] = *bytes else {
            return Err(L2capError::InsufficientData);
        };
        Ok(Self::new(
            u16::from_le_bytes([l0, l1]),
            u16::from_le_bytes([c0, c1]),
        ))
    }

    /// Parse the header of a complete frame, checking the declared length
    ///
    /// # Errors
    /// Returns `L2capError::LengthMismatch` if the payload is not exactly
    /// `length` bytes long
    pub fn from_frame(frame: &[u8]) -> Result<Self, L2capError> {
        let header = Self::from_bytes(frame)?;
        if frame.len() - Self::SIZE == usize::from(header.length) {
            Ok(header)
        } else {
            Err(L2capError::LengthMismatch)
        }
    }

    /// Convert header to bytes (little-endian)
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        let [l0, l1] = self.length.to_le_bytes();
        let [c0, c1] = self.channel_id.to_le_bytes();
        [l0, l1, c0, c1]
    }
}
