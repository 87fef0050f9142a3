//! HCI glue
//!
//! Commands, events and parameters are the `bt-hci` types. This module adds
//! the few things the stack layers on top of them: raw status codes, the
//! split between priority and regular events, and unit conversions between
//! the stack's plain `u16` fields and `bt-hci` handles and durations.
//!
//! Framing follows the HCI transport layout:
//!
//! ```text
//! command: opcode (2, LE) | parameter length (1) | parameters
//! event:   event code (1) | parameter length (1) | parameters
//! ACL:     handle + PB/BC flags (2, LE) | data length (2, LE) | data
//! ```

pub use bt_hci::cmd::{Cmd, Opcode};
pub use bt_hci::event::Event;
pub use bt_hci::event::le::LeEvent;
pub use bt_hci::param::{ConnHandle, Duration, Status};

use bt_hci::FromHciBytes;

use crate::Error;

/// Well-known HCI status codes
pub mod status {
    /// Success
    pub const SUCCESS: u8 = 0x00;
    /// Unknown connection identifier
    pub const UNKNOWN_CONN_ID: u8 = 0x02;
    /// PIN or key missing
    pub const PIN_OR_KEY_MISSING: u8 = 0x06;
    /// Pairing not allowed
    pub const PAIRING_NOT_ALLOWED: u8 = 0x18;
    /// Invalid LL parameters
    pub const INVALID_LL_PARAMS: u8 = 0x1E;
    /// Unspecified error, also used for local transport failures
    pub const UNSPECIFIED: u8 = 0x1F;
    /// Remote user terminated connection
    pub const REMOTE_USER_TERM_CONN: u8 = 0x13;
    /// Connection terminated by local host
    pub const LOCAL_HOST_TERM_CONN: u8 = 0x16;
    /// Unacceptable connection parameters
    pub const UNACCEPT_CONN_PARAM: u8 = 0x3B;
}

/// Event codes routed to the priority receiver
pub mod code {
    /// Command Complete
    pub const CMD_COMPLETE: u8 = 0x0E;
    /// Command Status
    pub const CMD_STATUS: u8 = 0x0F;
    /// Number Of Completed Packets
    pub const NUM_COMPLETED_PACKETS: u8 = 0x13;
}

/// True for events that gate the command queue or connection credits
#[must_use]
pub const fn is_priority(event_code: u8) -> bool {
    matches!(
        event_code,
        code::CMD_COMPLETE | code::CMD_STATUS | code::NUM_COMPLETED_PACKETS
    )
}

/// Decode an event packet, header included
///
/// # Errors
/// Returns [`Error::InvalidPacket`] if the packet is truncated or its
/// parameters do not decode
pub fn parse_event(packet: &[u8]) -> Result<Event<'_>, Error> {
    Event::from_hci_bytes(packet)
        .map(|(event, _)| event)
        .map_err(|_| Error::InvalidPacket)
}

/// Opcode at the start of a command packet
pub(crate) fn opcode_of(packet: &[u8]) -> Option<Opcode> {
    Opcode::from_hci_bytes(packet).ok().map(|(opcode, _)| opcode)
}

/// Raw status byte
#[must_use]
pub fn status_code(status: Status) -> u8 {
    status.into_inner()
}

pub(crate) fn handle(handle: u16) -> ConnHandle {
    ConnHandle::new(handle & 0x0FFF)
}

/// A duration in the controller's units of `N` microseconds
pub(crate) fn units<const N: u32>(value: u16) -> Duration<N> {
    Duration::from_u16(value)
}
