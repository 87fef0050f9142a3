#![no_std]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![allow(clippy::too_many_lines, clippy::module_name_repetitions)]

// Must come first so the logging macros are visible to every other module.
mod fmt;

mod acl;
mod address;
mod api;
pub mod att;
pub mod buffer;
mod codec;
pub mod connection;
pub mod constants;
pub mod gap;
pub mod gatt;
pub mod hci;
mod host;
pub mod l2cap;
mod processor;
pub mod security;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use address::{AddrKind, Address, BdAddr};
pub use att::{AttErrorCode, Uuid};
pub use bt_hci::param::DisconnectReason;
pub use buffer::{Buf, BufKind, BufPool, RawPool};
pub use connection::{
    ConnId, ConnParams, Connection, ConnectionInfo, ConnectionObserver, ConnectionState, LinkKind,
    Role,
};
pub use gap::{AdStructure, AdvParams, AdvReport, AdvType, ScanHandler, ScanParams, ScanType};
pub use host::{CommandResult, HostResources, LocalInfo, Stack};
pub use l2cap::LeConnResult;
pub use transport::{PacketKind, Transport};

use constants::{
    ATT_MAX_MTU, GAP_DEFAULT_SUPERVISION_TIMEOUT, GAP_INIT_CONN_INT_MAX, GAP_INIT_CONN_INT_MIN,
};

/// Errors reported by the stack
///
/// Resource exhaustion, local misuse, controller failures and peer protocol
/// errors each have their own variant so callers can tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// A buffer pool, table or queue is full
    NoResources,
    /// Another operation is already outstanding on this connection
    Busy,
    /// The requested state is already in effect
    Already,
    /// An argument is out of range or inconsistent
    InvalidParameter,
    /// The object is not in a state that allows the operation
    InvalidState,
    /// The connection is not established
    NotConnected,
    /// The link or channel went away while the operation was pending
    Disconnected,
    /// No such connection, channel, attribute or subscription
    NotFound,
    /// A packet could not be decoded
    InvalidPacket,
    /// The payload is larger than the negotiated MTU or the buffer
    MessageTooLong,
    /// The controller lacks a required feature
    NotSupported,
    /// The controller reported a non-zero status
    Hci(u8),
    /// The peer answered with an ATT error
    Att(AttErrorCode),
    /// The peer refused an L2CAP channel
    L2cap(LeConnResult),
    /// The transport failed to carry a packet
    Transport,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoResources => write!(f, "out of resources"),
            Self::Busy => write!(f, "operation in progress"),
            Self::Already => write!(f, "already in requested state"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::NotConnected => write!(f, "not connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::NotFound => write!(f, "not found"),
            Self::InvalidPacket => write!(f, "malformed packet"),
            Self::MessageTooLong => write!(f, "message too long"),
            Self::NotSupported => write!(f, "not supported by controller"),
            Self::Hci(status) => write!(f, "controller error 0x{status:02x}"),
            Self::Att(code) => write!(f, "ATT error {code:?}"),
            Self::L2cap(result) => write!(f, "L2CAP connection refused: {result:?}"),
            Self::Transport => write!(f, "transport error"),
        }
    }
}

impl core::error::Error for Error {}

impl embedded_io::Error for Error {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            Self::MessageTooLong | Self::NoResources => embedded_io::ErrorKind::OutOfMemory,
            Self::InvalidParameter => embedded_io::ErrorKind::InvalidInput,
            Self::InvalidPacket => embedded_io::ErrorKind::InvalidData,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

/// Runtime configuration for a [`Stack`]
///
/// # Examples
///
/// ```rust
/// use bluewren::Config;
///
/// let config = Config::default()
///     .with_att_mtu(65)
///     .with_host_flow_control(true);
/// assert_eq!(config.att_mtu, 65);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Parameters used for new LE connections
    pub conn_params: ConnParams,
    /// Report consumed inbound ACL packets to the controller
    pub host_flow_control: bool,
    /// Local ATT MTU offered during MTU exchange
    pub att_mtu: u16,
    /// Receive credits granted to the peer of an LE credit based channel
    pub l2cap_initial_credits: u16,
}

impl Config {
    /// Override the parameters used for new LE connections
    #[must_use]
    pub fn with_conn_params(mut self, params: ConnParams) -> Self {
        self.conn_params = params;
        self
    }

    /// Enable or disable controller-to-host flow control
    #[must_use]
    pub fn with_host_flow_control(mut self, enabled: bool) -> Self {
        self.host_flow_control = enabled;
        self
    }

    /// Override the local ATT MTU; clamped to what the stack can buffer
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_att_mtu(mut self, mtu: u16) -> Self {
        self.att_mtu = mtu.clamp(constants::ATT_DEFAULT_MTU, ATT_MAX_MTU as u16);
        self
    }

    /// Override the initial L2CAP receive credits
    #[must_use]
    pub fn with_l2cap_credits(mut self, credits: u16) -> Self {
        self.l2cap_initial_credits = credits.max(1);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            conn_params: ConnParams {
                interval_min: GAP_INIT_CONN_INT_MIN,
                interval_max: GAP_INIT_CONN_INT_MAX,
                latency: 0,
                timeout: GAP_DEFAULT_SUPERVISION_TIMEOUT,
            },
            host_flow_control: false,
            att_mtu: constants::ATT_DEFAULT_MTU,
            l2cap_initial_credits: 8,
        }
    }
}

/// Whether an iterating callback wants more results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IterAction {
    /// Keep delivering results
    Continue,
    /// Stop the iteration
    Stop,
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::string::ToString;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.att_mtu, 23);
        assert!(!config.host_flow_control);
        assert_eq!(config.conn_params.interval_min, 0x0018);
        assert_eq!(config.conn_params.interval_max, 0x0028);
        assert!(config.conn_params.is_valid());
    }

    #[test]
    fn test_config_builder_clamps() {
        let config = Config::default().with_att_mtu(1000).with_l2cap_credits(0);
        assert_eq!(usize::from(config.att_mtu), ATT_MAX_MTU);
        assert_eq!(config.l2cap_initial_credits, 1);

        let config = Config::default().with_att_mtu(5);
        assert_eq!(config.att_mtu, 23);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(Error::Hci(0x3e).to_string(), "controller error 0x3e");
        assert_eq!(Error::NoResources.to_string(), "out of resources");
    }
}
