//! Controller transport boundary
//!
//! The stack does not know how bytes reach the controller. A driver
//! implements [`Transport`] for the outbound direction and pushes every
//! received packet into [`Stack::deliver`](crate::Stack::deliver) (or
//! [`Stack::deliver_bytes`](crate::Stack::deliver_bytes)).

use crate::Error;

/// HCI packet indicator, as used by UART (H4) framing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketKind {
    /// HCI command packet
    Command = 0x01,
    /// HCI ACL data packet
    Acl = 0x02,
    /// HCI event packet
    Event = 0x04,
}

impl PacketKind {
    /// Convert from the H4 packet indicator
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Command),
            0x02 => Some(Self::Acl),
            0x04 => Some(Self::Event),
            _ => None,
        }
    }
}

/// Outbound half of a controller driver
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Bring the link to the controller up; called once by [`Stack::run`](crate::Stack::run)
    ///
    /// # Errors
    /// Returns [`Error::Transport`] if the controller cannot be reached
    async fn open(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Hand one complete HCI packet (without H4 indicator) to the controller
    ///
    /// # Errors
    /// Returns [`Error::Transport`] if the packet could not be sent
    async fn send(&self, kind: PacketKind, packet: &[u8]) -> Result<(), Error>;
}
