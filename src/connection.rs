//! Connection Manager
//!
//! Tracks every active or pending link in a fixed table of slots. A slot is
//! addressed by its [`ConnId`], looked up by controller handle or by peer
//! address, and freed once its state is `Disconnected` and the last
//! reference is gone.
//!
//! ## State machine
//!
//! ```text
//! Disconnected -> ConnectScan -> Connecting -> Connected -> Disconnecting -> Disconnected
//! ```
//!
//! `ConnectScan` waits for the peer to show up in a background scan,
//! `Connecting` waits for the controller's connection complete event.
//! A Disconnection Complete event always ends in `Disconnected`; a slot
//! flagged for auto-connect goes straight back to `ConnectScan`.
//!
//! ## Flow control
//!
//! Each slot owns a counting semaphore holding the controller's free ACL
//! buffers for that link. A sender acquires one permit per fragment; Number
//! Of Completed Packets events release them again. Leaving `Connected` floods
//! the semaphore so blocked senders wake up and observe the disconnect.
//!
//! ## References
//!
//! [`Connection`] is a counted handle to a slot: cloning retains, dropping
//! releases. The stack holds one reference while a link is established and
//! one for as long as auto-connect is enabled.

use core::cell::RefCell;
use core::future::poll_fn;
use core::task::Poll;

use bt_hci::param::LeConnRole;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex as AsyncMutex;
use embassy_sync::semaphore::{GreedySemaphore, Semaphore};
use embassy_sync::waitqueue::WakerRegistration;

use crate::constants::{ATT_DEFAULT_MTU, MAX_CONNECTIONS};
use crate::{Address, BdAddr, Error};

/// Permits handed to a link's credit semaphore once it leaves `Connected`
const CREDITS_DRAINED: usize = u16::MAX as usize;

/// Index of a connection slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnId(u8);

impl ConnId {
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn new(index: usize) -> Self {
        Self(index as u8)
    }

    /// Slot index
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    /// No link
    #[default]
    Disconnected,
    /// Waiting for the peer to be seen by the background scan
    ConnectScan,
    /// Connection requested, waiting for the controller
    Connecting,
    /// Link established
    Connected,
    /// Local disconnect requested
    Disconnecting,
}

/// Local role on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    /// Initiator of the link
    #[default]
    Central,
    /// Advertiser that accepted the link
    Peripheral,
}

impl From<LeConnRole> for Role {
    fn from(role: LeConnRole) -> Self {
        match role {
            LeConnRole::Central => Self::Central,
            LeConnRole::Peripheral => Self::Peripheral,
        }
    }
}

/// Transport of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkKind {
    /// Bluetooth Low Energy
    #[default]
    Le,
    /// Classic BR/EDR
    BrEdr,
}

/// LE connection parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnParams {
    /// Minimum connection interval (N * 1.25 ms)
    pub interval_min: u16,
    /// Maximum connection interval (N * 1.25 ms)
    pub interval_max: u16,
    /// Peripheral latency in connection events
    pub latency: u16,
    /// Supervision timeout (N * 10 ms)
    pub timeout: u16,
}

impl ConnParams {
    /// Check the parameters against the ranges allowed by the Core specification
    ///
    /// # Examples
    ///
    /// ```rust
    /// use bluewren::ConnParams;
    ///
    /// let params = ConnParams { interval_min: 0x18, interval_max: 0x28, latency: 0, timeout: 0x2A };
    /// assert!(params.is_valid());
    /// assert!(!ConnParams { timeout: 5, ..params }.is_valid());
    /// ```
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.interval_min > self.interval_max
            || self.interval_min < 6
            || self.interval_max > 3200
        {
            return false;
        }
        if self.latency > 499 {
            return false;
        }
        if self.timeout < 10 || self.timeout > 3200 {
            return false;
        }
        // the link must survive `latency` skipped events at the longest interval
        u32::from(self.timeout) * 4 > (1 + u32::from(self.latency)) * u32::from(self.interval_max)
    }
}

/// Snapshot of a connection slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionInfo {
    /// Slot
    pub id: Option<ConnId>,
    /// Controller handle, valid from `Connected` on
    pub handle: u16,
    /// Peer address
    pub peer: Address,
    /// Local role
    pub role: Role,
    /// Link transport
    pub kind: LinkKind,
    /// Current state
    pub state: ConnectionState,
    /// Connection interval
    pub interval: u16,
    /// Peripheral latency
    pub latency: u16,
    /// Supervision timeout
    pub timeout: u16,
    /// Link encryption on
    pub encrypted: bool,
    /// Encryption key size in bytes, 0 when not encrypted
    pub key_size: u8,
    /// Negotiated ATT MTU
    pub att_mtu: u16,
    /// Peer LE features, zero until read
    pub features: [u8; 8],
    /// Last disconnect or failure reason
    pub reason: u8,
}

/// Receives connection lifecycle notifications
///
/// Callbacks run on the stack's event task and must not block.
pub trait ConnectionObserver {
    /// A link reached `Connected`
    fn connected(&self, conn: &ConnectionInfo) {
        let _ = conn;
    }

    /// A link went away, or a connection attempt failed
    fn disconnected(&self, conn: &ConnectionInfo, reason: u8) {
        let _ = (conn, reason);
    }

    /// Connection parameters changed
    fn param_updated(&self, conn: &ConnectionInfo) {
        let _ = conn;
    }

    /// Encryption state or key size changed
    fn security_changed(&self, conn: &ConnectionInfo) {
        let _ = conn;
    }
}

/// Controller ACL buffer quota
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct ControllerBuffers {
    pub mtu: u16,
    pub pkts: u16,
}

struct ConnSlot {
    refs: u8,
    info: ConnectionInfo,
    auto_connect: bool,
    pending: u16,
    tx_aborted: bool,
    params: ConnParams,
    waker: WakerRegistration,
}

struct ConnTable {
    slots: [Option<ConnSlot>; MAX_CONNECTIONS],
    le_buffers: ControllerBuffers,
    acl_buffers: ControllerBuffers,
}

impl ConnTable {
    fn slot(&mut self, id: ConnId) -> Option<&mut ConnSlot> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    fn find(&self, pred: impl Fn(&ConnSlot) -> bool) -> Option<ConnId> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(&pred))
            .map(ConnId::new)
    }
}

/// Connection table shared by every layer of the stack
pub struct ConnectionManager {
    table: Mutex<CriticalSectionRawMutex, RefCell<ConnTable>>,
    credits: [GreedySemaphore<CriticalSectionRawMutex>; MAX_CONNECTIONS],
    tx_lock: [AsyncMutex<CriticalSectionRawMutex, ()>; MAX_CONNECTIONS],
}

impl ConnectionManager {
    pub(crate) fn new() -> Self {
        Self {
            table: Mutex::new(RefCell::new(ConnTable {
                slots: [const { None }; MAX_CONNECTIONS],
                le_buffers: ControllerBuffers { mtu: 27, pkts: 1 },
                acl_buffers: ControllerBuffers { mtu: 27, pkts: 1 },
            })),
            credits: [const { GreedySemaphore::new(0) }; MAX_CONNECTIONS],
            tx_lock: [const { AsyncMutex::new(()) }; MAX_CONNECTIONS],
        }
    }

    /// Take a free slot; the caller owns the single reference
    pub(crate) fn alloc(
        &self,
        peer: Address,
        kind: LinkKind,
        role: Role,
        params: ConnParams,
    ) -> Result<ConnId, Error> {
        self.table.lock(|t| {
            let mut t = t.borrow_mut();
            let Some(index) = t.slots.iter().position(Option::is_none) else {
                warn!("[CONN] connection table full");
                return Err(Error::NoResources);
            };
            let id = ConnId::new(index);
            t.slots[index] = Some(ConnSlot {
                refs: 1,
                info: ConnectionInfo {
                    id: Some(id),
                    peer,
                    role,
                    kind,
                    att_mtu: ATT_DEFAULT_MTU,
                    ..ConnectionInfo::default()
                },
                auto_connect: false,
                pending: 0,
                tx_aborted: false,
                params,
                waker: WakerRegistration::new(),
            });
            debug!("[CONN] allocated {:?} for {:?}", id, peer);
            Ok(id)
        })
    }

    pub(crate) fn retain(&self, id: ConnId) {
        self.table.lock(|t| {
            if let Some(slot) = t.borrow_mut().slot(id) {
                slot.refs += 1;
            }
        });
    }

    pub(crate) fn release(&self, id: ConnId) {
        self.table.lock(|t| {
            let mut t = t.borrow_mut();
            let Some(slot) = t.slot(id) else {
                return;
            };
            slot.refs = slot.refs.saturating_sub(1);
            if slot.refs == 0 && slot.info.state == ConnectionState::Disconnected {
                debug!("[CONN] freed {:?}", id);
                t.slots[id.index()] = None;
            }
        });
    }

    /// A counted handle to a live slot
    pub(crate) fn connection(&self, id: ConnId) -> Option<Connection<'_>> {
        self.table.lock(|t| {
            let slot = t.borrow_mut().slot(id).map(|slot| slot.refs += 1);
            slot.map(|()| Connection { manager: self, id })
        })
    }

    /// Move a slot to `new`, returning the previous state
    ///
    /// Leaving `Connected` drops the outstanding packet count and wakes
    /// blocked senders; entering it grants the controller's buffer quota.
    pub(crate) fn set_state(&self, id: ConnId, new: ConnectionState) -> Option<ConnectionState> {
        let (old, grant) = self.table.lock(|t| {
            let mut t = t.borrow_mut();
            let quota = t.le_buffers.pkts;
            let acl_quota = t.acl_buffers.pkts;
            let slot = t.slot(id)?;
            let old = slot.info.state;
            if old == new {
                return None;
            }
            slot.info.state = new;
            slot.waker.wake();
            let grant = if new == ConnectionState::Connected {
                slot.pending = 0;
                slot.tx_aborted = false;
                Some(usize::from(match slot.info.kind {
                    LinkKind::Le => quota,
                    LinkKind::BrEdr => acl_quota,
                }))
            } else if old == ConnectionState::Connected {
                slot.pending = 0;
                Some(CREDITS_DRAINED)
            } else {
                None
            };
            if new == ConnectionState::Disconnected {
                slot.info.handle = 0;
                slot.info.encrypted = false;
                slot.info.key_size = 0;
                slot.info.att_mtu = ATT_DEFAULT_MTU;
            }
            Some((old, grant))
        })?;

        debug!("[CONN] {:?}: {:?} -> {:?}", id, old, new);
        if let Some(permits) = grant {
            self.credits[id.index()].set(permits);
        }
        if new == ConnectionState::Disconnected {
            self.free_if_unused(id);
        }
        Some(old)
    }

    fn free_if_unused(&self, id: ConnId) {
        self.table.lock(|t| {
            let mut t = t.borrow_mut();
            if t.slot(id).is_some_and(|s| s.refs == 0) {
                debug!("[CONN] freed {:?}", id);
                t.slots[id.index()] = None;
            }
        });
    }

    /// Snapshot of a slot
    pub(crate) fn info(&self, id: ConnId) -> Option<ConnectionInfo> {
        self.table.lock(|t| t.borrow_mut().slot(id).map(|s| s.info))
    }

    /// Mutate a slot's public fields
    pub(crate) fn update<R>(&self, id: ConnId, f: impl FnOnce(&mut ConnectionInfo) -> R) -> Option<R> {
        self.table.lock(|t| t.borrow_mut().slot(id).map(|s| f(&mut s.info)))
    }

    pub(crate) fn state(&self, id: ConnId) -> ConnectionState {
        self.info(id).map_or(ConnectionState::Disconnected, |i| i.state)
    }

    /// Connection parameters requested for this slot
    pub(crate) fn params(&self, id: ConnId) -> Option<ConnParams> {
        self.table.lock(|t| t.borrow_mut().slot(id).map(|s| s.params))
    }

    pub(crate) fn set_params(&self, id: ConnId, params: ConnParams) {
        self.table.lock(|t| {
            if let Some(slot) = t.borrow_mut().slot(id) {
                slot.params = params;
            }
        });
    }

    pub(crate) fn auto_connect(&self, id: ConnId) -> bool {
        self.table
            .lock(|t| t.borrow_mut().slot(id).is_some_and(|s| s.auto_connect))
    }

    /// Change the auto-connect flag, returning the previous value
    pub(crate) fn set_auto_connect(&self, id: ConnId, enable: bool) -> bool {
        self.table.lock(|t| {
            t.borrow_mut().slot(id).map_or(false, |s| {
                core::mem::replace(&mut s.auto_connect, enable)
            })
        })
    }

    /// Established (or closing) link with this controller handle
    pub(crate) fn find_by_handle(&self, handle: u16) -> Option<ConnId> {
        self.table.lock(|t| {
            t.borrow().find(|s| {
                s.info.handle == handle
                    && matches!(
                        s.info.state,
                        ConnectionState::Connected | ConnectionState::Disconnecting
                    )
            })
        })
    }

    /// Slot for `peer` in `state`
    pub(crate) fn find_by_addr_state(
        &self,
        peer: &Address,
        state: ConnectionState,
    ) -> Option<ConnId> {
        self.table
            .lock(|t| t.borrow().find(|s| s.info.peer == *peer && s.info.state == state))
    }

    /// Any slot for `peer`
    pub(crate) fn find_by_addr(&self, peer: &Address) -> Option<ConnId> {
        self.table.lock(|t| t.borrow().find(|s| s.info.peer == *peer))
    }

    /// Any slot for a BR/EDR peer in `state`, matched on the device address only
    pub(crate) fn find_br_by_addr_state(
        &self,
        addr: &BdAddr,
        state: ConnectionState,
    ) -> Option<ConnId> {
        self.table.lock(|t| {
            t.borrow().find(|s| {
                s.info.kind == LinkKind::BrEdr && s.info.peer.addr == *addr && s.info.state == state
            })
        })
    }

    /// True if some slot is in `state`
    pub(crate) fn any_in_state(&self, state: ConnectionState) -> bool {
        self.table.lock(|t| t.borrow().find(|s| s.info.state == state).is_some())
    }

    /// Number of occupied slots
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.table
            .lock(|t| t.borrow().slots.iter().filter(|s| s.is_some()).count())
    }

    pub(crate) fn le_buffers(&self) -> ControllerBuffers {
        self.table.lock(|t| t.borrow().le_buffers)
    }

    pub(crate) fn acl_buffers(&self) -> ControllerBuffers {
        self.table.lock(|t| t.borrow().acl_buffers)
    }

    pub(crate) fn set_le_buffers(&self, mtu: u16, pkts: u16) {
        self.table
            .lock(|t| t.borrow_mut().le_buffers = ControllerBuffers { mtu, pkts });
    }

    pub(crate) fn set_acl_buffers(&self, mtu: u16, pkts: u16) {
        self.table
            .lock(|t| t.borrow_mut().acl_buffers = ControllerBuffers { mtu, pkts });
    }

    /// Take one controller buffer for an outbound fragment, waiting for a
    /// Number Of Completed Packets event if none is free
    ///
    /// # Errors
    /// Returns [`Error::Disconnected`] if the link left `Connected` meanwhile
    pub(crate) async fn acquire_credit(&self, id: ConnId) -> Result<(), Error> {
        let Ok(permit) = self.credits[id.index()].acquire(1).await;
        permit.disarm();
        self.table.lock(|t| match t.borrow_mut().slot(id) {
            Some(slot) if slot.info.state == ConnectionState::Connected && !slot.tx_aborted => {
                slot.pending += 1;
                Ok(())
            }
            _ => Err(Error::Disconnected),
        })
    }

    /// Fail senders of a link the controller reported gone
    ///
    /// Called as soon as a Disconnection Complete is received, before it is
    /// processed in order with the rest of the inbound traffic, so a sender
    /// blocked on credits cannot stall the receive path.
    pub(crate) fn abort_tx(&self, handle: u16) {
        let id = self.table.lock(|t| {
            let mut t = t.borrow_mut();
            let id = t.find(|s| s.info.handle == handle && s.info.state == ConnectionState::Connected)?;
            let slot = t.slot(id)?;
            slot.tx_aborted = true;
            Some(id)
        });
        if let Some(id) = id {
            self.credits[id.index()].set(CREDITS_DRAINED);
        }
    }

    /// Return controller buffers reported by a Number Of Completed Packets event
    pub(crate) fn packets_completed(&self, handle: u16, count: u16) {
        let released = self.table.lock(|t| {
            let mut t = t.borrow_mut();
            let id = t.find(|s| s.info.handle == handle && s.info.state == ConnectionState::Connected)?;
            let slot = t.slot(id)?;
            let n = if count > slot.pending {
                error!(
                    "[CONN] handle {:#x}: {} packets completed, only {} pending",
                    handle, count, slot.pending
                );
                slot.pending
            } else {
                count
            };
            slot.pending -= n;
            Some((id, n))
        });

        match released {
            Some((id, n)) => self.credits[id.index()].release(usize::from(n)),
            None => warn!("[CONN] completed packets for unknown handle {:#x}", handle),
        }
    }

    /// Serializes fragment trains on one link
    pub(crate) fn tx_lock(&self, id: ConnId) -> &AsyncMutex<CriticalSectionRawMutex, ()> {
        &self.tx_lock[id.index()]
    }

    /// Wait until `pred` holds for the slot's state
    async fn wait_state(
        &self,
        id: ConnId,
        pred: impl Fn(ConnectionState) -> bool,
    ) -> ConnectionInfo {
        poll_fn(|cx| {
            self.table.lock(|t| {
                let mut t = t.borrow_mut();
                match t.slot(id) {
                    Some(slot) if pred(slot.info.state) => Poll::Ready(slot.info),
                    Some(slot) => {
                        slot.waker.register(cx.waker());
                        Poll::Pending
                    }
                    None => Poll::Ready(ConnectionInfo::default()),
                }
            })
        })
        .await
    }
}

/// Counted handle to a connection slot
pub struct Connection<'a> {
    manager: &'a ConnectionManager,
    id: ConnId,
}

impl<'a> Connection<'a> {
    /// Slot id, usable with the stack's connection-scoped calls
    #[must_use]
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Snapshot of the connection
    #[must_use]
    pub fn info(&self) -> ConnectionInfo {
        self.manager.info(self.id).unwrap_or_default()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.manager.state(self.id)
    }

    /// Controller handle
    #[must_use]
    pub fn handle(&self) -> u16 {
        self.info().handle
    }

    /// Peer address
    #[must_use]
    pub fn peer(&self) -> Address {
        self.info().peer
    }

    /// Wait for the link to be established
    ///
    /// # Errors
    /// Returns [`Error::Hci`] with the failure reason, or
    /// [`Error::Disconnected`], if the attempt ended in `Disconnected`
    pub async fn wait_connected(&self) -> Result<(), Error> {
        let info = self
            .manager
            .wait_state(self.id, |s| {
                matches!(s, ConnectionState::Connected | ConnectionState::Disconnected)
            })
            .await;
        match info.state {
            ConnectionState::Connected => Ok(()),
            _ if info.reason != 0 => Err(Error::Hci(info.reason)),
            _ => Err(Error::Disconnected),
        }
    }

    /// Wait for the link to go away, returning the reason
    pub async fn wait_disconnected(&self) -> u8 {
        self.manager
            .wait_state(self.id, |s| {
                matches!(s, ConnectionState::Disconnected | ConnectionState::ConnectScan)
            })
            .await
            .reason
    }
}

impl Clone for Connection<'_> {
    fn clone(&self) -> Self {
        self.manager.retain(self.id);
        Self {
            manager: self.manager,
            id: self.id,
        }
    }
}

impl Drop for Connection<'_> {
    fn drop(&mut self) {
        self.manager.release(self.id);
    }
}

impl core::fmt::Debug for Connection<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Connection<'_> {
    fn format(&self, f: defmt::Formatter<'_>) {
        defmt::write!(f, "Connection({:?}, {:?})", self.id, self.state());
    }
}
