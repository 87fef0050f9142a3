pub use bt_hci::param::{AddrKind, BdAddr};

use crate::Error;

/// Over-the-air (little-endian) bytes of a `BD_ADDR`
#[must_use]
pub(crate) fn addr_bytes(addr: &BdAddr) -> [u8; 6] {
    addr.raw().try_into().unwrap_or_default()
}

/// An LE address: type plus `BD_ADDR`. BR/EDR peers use [`AddrKind::PUBLIC`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Address {
    /// Address type
    pub kind: AddrKind,
    /// Device address
    pub addr: BdAddr,
}

impl Default for Address {
    fn default() -> Self {
        Self::public([0; 6])
    }
}

impl Address {
    /// Size of the wire encoding (type byte + 6 address bytes)
    pub const SIZE: usize = 7;

    /// Create a public address
    #[must_use]
    pub const fn public(addr: [u8; 6]) -> Self {
        Self {
            kind: AddrKind::PUBLIC,
            addr: BdAddr::new(addr),
        }
    }

    /// Create a random address
    #[must_use]
    pub const fn random(addr: [u8; 6]) -> Self {
        Self {
            kind: AddrKind::RANDOM,
            addr: BdAddr::new(addr),
        }
    }

    /// Address bytes, least significant first
    #[must_use]
    pub fn bytes(&self) -> [u8; 6] {
        addr_bytes(&self.addr)
    }

    /// True for a static random address (two most significant bits set)
    #[must_use]
    pub fn is_static_random(&self) -> bool {
        self.kind == AddrKind::RANDOM && is_static_random(&self.bytes())
    }

    /// Format the address as a colon-separated hex string, most significant byte first
    #[must_use]
    pub fn format_hex(&self) -> heapless::String<17> {
        const HEX: [char; 16] = [
            '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F',
        ];
        let mut result = heapless::String::new();
        for (i, byte) in self.bytes().iter().rev().enumerate() {
            if i > 0 {
                result.push(':').ok();
            }
            result.push(HEX[(byte >> 4) as usize]).ok();
            result.push(HEX[(byte & 0x0F) as usize]).ok();
        }
        result
    }

    /// Parse a type byte followed by six address bytes
    ///
    /// # Errors
    /// Returns [`Error::InvalidPacket`] on short input
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let [kind, a0, a1, a2, a3, a4, a5, ..] = *bytes else {
            return Err(Error::InvalidPacket);
        };
        let addr = [a0, a1, a2, a3, a4, a5];
        Ok(if kind & 0x01 == 0 {
            Self::public(addr)
        } else {
            Self::random(addr)
        })
    }

    /// Encode as type byte followed by six address bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = u8::from(self.kind == AddrKind::RANDOM);
        out[1..].copy_from_slice(&self.bytes());
        out
    }
}

pub(crate) const fn is_static_random(addr: &[u8; 6]) -> bool {
    addr[5] & 0xC0 == 0xC0
}
