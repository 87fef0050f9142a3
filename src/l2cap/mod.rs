//! L2CAP (Logical Link Control and Adaptation Protocol)
//!
//! Multiplexes fixed and dynamic channels over one ACL link. Fixed channels
//! (signaling, ATT, and any registered by the application) are bound when a
//! link comes up. Dynamic channels use LE credit based flow control: every
//! PDU costs the sender one credit, the receiver hands credits back once it
//! consumed half of what it granted, and SDUs larger than the peer's MPS are
//! segmented with a 2-byte SDU length in front of the first PDU.
//!
//! Applications reach channels through a [`ChannelHandler`], registered
//! either for a fixed CID or for a PSM, and send through the [`Stack`]
//! (see [`Stack::l2cap_connect`] and [`Stack::l2cap_send`]).
//!
//! [`Stack`]: crate::Stack
//! [`Stack::l2cap_connect`]: crate::Stack::l2cap_connect
//! [`Stack::l2cap_send`]: crate::Stack::l2cap_send

use core::cell::{Cell, RefCell};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use heapless::Vec;

use crate::connection::{ConnId, ConnectionInfo, LinkKind};
use crate::constants::{MAX_CONNECTIONS, MAX_FIXED_CHANNELS, MAX_L2CAP_SERVERS};

pub(crate) mod channel;
pub mod packet;
mod processor;
pub mod signaling;

use channel::ChannelManager;
pub use packet::{ChannelId, L2capError, L2capHeader, ProtocolServiceMultiplexer, cid, psm};
pub use signaling::LeConnResult;

type CS = CriticalSectionRawMutex;

/// An open channel: the link it lives on and its local CID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Channel {
    /// Connection carrying the channel
    pub conn: ConnId,
    /// Local (receive) channel identifier
    pub cid: ChannelId,
}

/// Application side of a channel
///
/// Callbacks run on the stack's receive task and must not block.
pub trait ChannelHandler {
    /// Decide whether to bind a channel on `conn`
    ///
    /// Asked once per new link for fixed channels, and for every incoming
    /// connection request naming the registered PSM. Refusing a request
    /// answers it with "no resources".
    fn accept(&self, conn: &ConnectionInfo) -> bool {
        let _ = conn;
        true
    }

    /// The channel is open
    fn connected(&self, chan: Channel) {
        let _ = chan;
    }

    /// A complete SDU arrived
    fn received(&self, chan: Channel, sdu: &[u8]);

    /// The channel was closed, locally, by the peer or with the link
    fn disconnected(&self, chan: Channel) {
        let _ = chan;
    }
}

#[derive(Clone, Copy)]
pub(crate) struct Server<'d> {
    pub psm: ProtocolServiceMultiplexer,
    pub handler: &'d dyn ChannelHandler,
}

#[derive(Clone, Copy)]
pub(crate) struct FixedChannel<'d> {
    pub kind: LinkKind,
    pub cid: ChannelId,
    pub handler: &'d dyn ChannelHandler,
}

/// L2CAP state of the stack
pub(crate) struct L2cap<'d> {
    pub channels: Mutex<CS, RefCell<ChannelManager<'d>>>,
    pub servers: Mutex<CS, RefCell<Vec<Server<'d>, MAX_L2CAP_SERVERS>>>,
    pub fixed: Mutex<CS, RefCell<Vec<FixedChannel<'d>, MAX_FIXED_CHANNELS>>>,
    idents: Mutex<CS, Cell<[u8; MAX_CONNECTIONS]>>,
}

impl<'d> L2cap<'d> {
    pub const fn new() -> Self {
        Self {
            channels: Mutex::new(RefCell::new(ChannelManager::new())),
            servers: Mutex::new(RefCell::new(Vec::new())),
            fixed: Mutex::new(RefCell::new(Vec::new())),
            idents: Mutex::new(Cell::new([0; MAX_CONNECTIONS])),
        }
    }

    /// Next signaling identifier of a link; 0 is never handed out
    pub fn next_ident(&self, conn: ConnId) -> u8 {
        self.idents.lock(|cell| {
            let mut idents = cell.get();
            let ident = idents[conn.index()].wrapping_add(1).max(1);
            idents[conn.index()] = ident;
            cell.set(idents);
            ident
        })
    }

    pub fn reset_ident(&self, conn: ConnId) {
        self.idents.lock(|cell| {
            let mut idents = cell.get();
            idents[conn.index()] = 0;
            cell.set(idents);
        });
    }

    pub fn server(&self, psm: ProtocolServiceMultiplexer) -> Option<&'d dyn ChannelHandler> {
        self.servers.lock(|s| {
            s.borrow()
                .iter()
                .find(|server| server.psm == psm)
                .map(|server| server.handler)
        })
    }

    /// Application fixed channels registered for `kind` links
    pub fn fixed_for(&self, kind: LinkKind) -> Vec<FixedChannel<'d>, MAX_FIXED_CHANNELS> {
        self.fixed.lock(|f| {
            f.borrow()
                .iter()
                .filter(|fixed| fixed.kind == kind)
                .copied()
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_skip_zero_and_are_per_link() {
        let l2cap = L2cap::new();
        let a = ConnId::new(0);
        let b = ConnId::new(1);

        assert_eq!(l2cap.next_ident(a), 1);
        assert_eq!(l2cap.next_ident(a), 2);
        assert_eq!(l2cap.next_ident(b), 1);

        for _ in 2..255 {
            l2cap.next_ident(a);
        }
        // 255 wraps to 1
        assert_eq!(l2cap.next_ident(a), 1);

        l2cap.reset_ident(a);
        assert_eq!(l2cap.next_ident(a), 1);
    }
}
