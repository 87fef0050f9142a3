//! L2CAP Channel Management
//!
//! One table holds the channels of every connection, keyed by connection and
//! local (receive) CID. Fixed channels are bound when a link comes up;
//! dynamic channels are added by LE credit based connection requests in
//! either direction and take the lowest free CID of the link's dynamic range.

use core::task::Context;

use embassy_sync::waitqueue::WakerRegistration;
use heapless::FnvIndexMap;

use super::ChannelHandler;
use super::packet::{ChannelId, ProtocolServiceMultiplexer};
use crate::buffer::Buf;
use crate::connection::{ConnId, LinkKind};
use crate::constants::{
    L2CAP_BR_DYN_CID_END, L2CAP_BR_DYN_CID_START, L2CAP_LE_DYN_CID_END, L2CAP_LE_DYN_CID_START,
    MAX_L2CAP_CHANNELS,
};
use crate::{Error, LeConnResult};

/// Who consumes the frames of a channel
#[derive(Clone, Copy)]
pub(crate) enum Owner<'d> {
    /// Signaling channel, handled by the stack
    Signaling,
    /// Attribute protocol, handled by the GATT layer
    Att,
    /// Application fixed channel
    Fixed(&'d dyn ChannelHandler),
    /// LE credit based channel
    Dynamic(&'d dyn ChannelHandler),
}

/// Channel states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ChannelState {
    /// Connection request sent with this identifier
    WaitConnectRsp(u8),
    /// Peer refused the connection request
    Refused(LeConnResult),
    /// Data may flow
    Open,
    /// Disconnection request sent
    WaitDisconnect,
}

/// Receive or transmit parameters of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct Endpoint {
    pub cid: ChannelId,
    pub mtu: u16,
    pub mps: u16,
    pub credits: u16,
}

pub(crate) struct L2capChannel<'d> {
    pub owner: Owner<'d>,
    pub psm: ProtocolServiceMultiplexer,
    pub state: ChannelState,
    pub rx: Endpoint,
    pub tx: Endpoint,
    /// SDU being reassembled and its declared length
    pub sdu: Option<(Buf<'d>, u16)>,
    /// An SDU is being segmented onto the channel
    pub sending: bool,
    waker: WakerRegistration,
}

impl<'d> L2capChannel<'d> {
    pub fn fixed(cid: ChannelId, owner: Owner<'d>) -> Self {
        let endpoint = Endpoint {
            cid,
            ..Endpoint::default()
        };
        Self {
            owner,
            psm: 0,
            state: ChannelState::Open,
            rx: endpoint,
            tx: endpoint,
            sdu: None,
            sending: false,
            waker: WakerRegistration::new(),
        }
    }

    pub fn dynamic(
        handler: &'d dyn ChannelHandler,
        psm: ProtocolServiceMultiplexer,
        state: ChannelState,
        rx: Endpoint,
        tx: Endpoint,
    ) -> Self {
        Self {
            owner: Owner::Dynamic(handler),
            psm,
            state,
            rx,
            tx,
            sdu: None,
            sending: false,
            waker: WakerRegistration::new(),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.owner, Owner::Dynamic(_))
    }

    pub fn handler(&self) -> Option<&'d dyn ChannelHandler> {
        match self.owner {
            Owner::Fixed(h) | Owner::Dynamic(h) => Some(h),
            Owner::Signaling | Owner::Att => None,
        }
    }

    /// Park a task until the channel changes
    pub fn register(&mut self, cx: &Context<'_>) {
        self.waker.register(cx.waker());
    }

    pub fn wake(&mut self) {
        self.waker.wake();
    }
}

/// Channels of every connection
pub(crate) struct ChannelManager<'d> {
    channels: FnvIndexMap<(ConnId, ChannelId), L2capChannel<'d>, MAX_L2CAP_CHANNELS>,
}

impl<'d> ChannelManager<'d> {
    pub const fn new() -> Self {
        Self {
            channels: FnvIndexMap::new(),
        }
    }

    /// Lowest free CID in the link's dynamic range
    ///
    /// # Errors
    /// Returns `Error::NoResources` if the range or the table is exhausted
    pub fn allocate_cid(&self, conn: ConnId, kind: LinkKind) -> Result<ChannelId, Error> {
        if self.channels.len() == self.channels.capacity() {
            return Err(Error::NoResources);
        }
        let (start, end) = match kind {
            LinkKind::Le => (L2CAP_LE_DYN_CID_START, L2CAP_LE_DYN_CID_END),
            LinkKind::BrEdr => (L2CAP_BR_DYN_CID_START, L2CAP_BR_DYN_CID_END),
        };
        (start..=end)
            .find(|cid| !self.channels.contains_key(&(conn, *cid)))
            .ok_or(Error::NoResources)
    }

    /// # Errors
    /// Returns `Error::NoResources` if the table is full
    pub fn insert(&mut self, conn: ConnId, channel: L2capChannel<'d>) -> Result<(), Error> {
        let cid = channel.rx.cid;
        self.channels
            .insert((conn, cid), channel)
            .map(drop)
            .map_err(|_| Error::NoResources)
    }

    pub fn get(&self, conn: ConnId, cid: ChannelId) -> Option<&L2capChannel<'d>> {
        self.channels.get(&(conn, cid))
    }

    pub fn get_mut(&mut self, conn: ConnId, cid: ChannelId) -> Option<&mut L2capChannel<'d>> {
        self.channels.get_mut(&(conn, cid))
    }

    /// Remove a channel, waking whoever waits on it
    pub fn remove(&mut self, conn: ConnId, cid: ChannelId) -> Option<L2capChannel<'d>> {
        let mut channel = self.channels.remove(&(conn, cid))?;
        channel.wake();
        channel.sdu = None;
        Some(channel)
    }

    /// Local CID of the channel whose peer CID is `tx_cid`
    pub fn find_by_tx_cid(&self, conn: ConnId, tx_cid: ChannelId) -> Option<ChannelId> {
        self.channels
            .iter()
            .find(|((c, _), ch)| *c == conn && ch.is_dynamic() && ch.tx.cid == tx_cid)
            .map(|((_, cid), _)| *cid)
    }

    /// Local CID of the channel waiting for the response to `identifier`
    pub fn find_by_ident(&self, conn: ConnId, identifier: u8) -> Option<ChannelId> {
        self.channels
            .iter()
            .find(|((c, _), ch)| {
                *c == conn && ch.state == ChannelState::WaitConnectRsp(identifier)
            })
            .map(|((_, cid), _)| *cid)
    }

    /// Local CIDs of every channel of `conn`
    pub fn cids(&self, conn: ConnId) -> heapless::Vec<ChannelId, MAX_L2CAP_CHANNELS> {
        self.channels
            .keys()
            .filter(|(c, _)| *c == conn)
            .map(|(_, cid)| *cid)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l2cap::Channel;
    use crate::l2cap::packet::cid;

    struct Sink;
    impl ChannelHandler for Sink {
        fn received(&self, _chan: Channel, _sdu: &[u8]) {}
    }

    fn open(handler: &dyn ChannelHandler, rx_cid: u16, tx_cid: u16) -> L2capChannel<'_> {
        L2capChannel::dynamic(
            handler,
            0x80,
            ChannelState::Open,
            Endpoint {
                cid: rx_cid,
                mtu: 64,
                mps: 64,
                credits: 4,
            },
            Endpoint {
                cid: tx_cid,
                mtu: 64,
                mps: 64,
                credits: 4,
            },
        )
    }

    #[test]
    fn test_cid_allocation_is_lowest_free_per_link() {
        let sink = Sink;
        let mut manager = ChannelManager::new();
        let a = ConnId::new(0);
        let b = ConnId::new(1);

        assert_eq!(manager.allocate_cid(a, LinkKind::Le), Ok(0x0040));
        manager.insert(a, open(&sink, 0x0040, 0x0050)).unwrap();
        manager.insert(a, open(&sink, 0x0041, 0x0051)).unwrap();
        assert_eq!(manager.allocate_cid(a, LinkKind::Le), Ok(0x0042));
        // ranges are per connection
        assert_eq!(manager.allocate_cid(b, LinkKind::Le), Ok(0x0040));

        manager.remove(a, 0x0040).unwrap();
        assert_eq!(manager.allocate_cid(a, LinkKind::Le), Ok(0x0040));
    }

    #[test]
    fn test_full_table_refuses_allocation() {
        let sink = Sink;
        let mut manager = ChannelManager::new();
        let conn = ConnId::new(0);
        for rx in 0..MAX_L2CAP_CHANNELS as u16 {
            manager
                .insert(conn, open(&sink, L2CAP_LE_DYN_CID_START + rx, 0x40 + rx))
                .unwrap();
        }
        assert_eq!(
            manager.allocate_cid(conn, LinkKind::Le),
            Err(Error::NoResources)
        );
    }

    #[test]
    fn test_lookup_by_peer_cid_and_ident() {
        let sink = Sink;
        let mut manager = ChannelManager::new();
        let conn = ConnId::new(0);
        manager
            .insert(conn, L2capChannel::fixed(cid::ATT, Owner::Att))
            .unwrap();
        manager.insert(conn, open(&sink, 0x0040, 0x0077)).unwrap();
        let mut pending = open(&sink, 0x0041, 0);
        pending.state = ChannelState::WaitConnectRsp(5);
        manager.insert(conn, pending).unwrap();

        assert_eq!(manager.find_by_tx_cid(conn, 0x0077), Some(0x0040));
        // fixed channels never match a peer CID
        assert_eq!(manager.find_by_tx_cid(conn, cid::ATT), None);
        assert_eq!(manager.find_by_ident(conn, 5), Some(0x0041));
        assert_eq!(manager.cids(conn).len(), 3);
    }
}
