//! Bluewren Host - the stack context object
//!
//! [`Stack`] owns every piece of host state: device information, the command
//! dispatcher, the connection table, and the L2CAP, GATT and GAP layers. It
//! borrows its packet buffers from a user-owned [`HostResources`] so the
//! stack type does not carry pool dimensions.
//!
//! ## Architecture
//!
//! The stack is driven by [`Stack::run`], which joins five processing tasks
//! (see the `processor` module):
//!
//! 1. **Command sender** - pulls queued commands and hands them to the transport,
//!    one at a time, gated by the controller's command credits
//! 2. **ACL sender** - forwards outbound ACL fragments and bypass commands
//! 3. **Priority receiver** - Command Complete, Command Status and Number Of
//!    Completed Packets events
//! 4. **Receiver** - every other event plus inbound ACL data
//! 5. **Internal command processor** - follow-up commands triggered by events
//!
//! Event handlers never wait on the controller themselves. Anything that
//! needs a command round trip is queued as an [`InternalCommand`] and run on
//! the internal command processor, so the receivers stay live to deliver the
//! completion.
//!
//! ## Usage
//!
//! ```rust,ignore
//! static RESOURCES: HostResources<4, 8, 8, 8, 255, 2, 512> = HostResources::new();
//! let stack = Stack::new(&RESOURCES, Config::default());
//! join(stack.run(&transport), async {
//!     stack.enable().await?;
//!     // scan, advertise, connect ...
//! }).await;
//! ```

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use heapless::Vec;

use crate::acl::AclRx;
use crate::buffer::{Buf, BufKind, BufPool, RawPool};
use crate::connection::{ConnId, ConnParams, Connection, ConnectionInfo, ConnectionManager, ConnectionObserver};
use crate::constants::{
    HCI_CMD_BUF_SIZE, HCI_EVT_BUF_SIZE, INTERNAL_COMMAND_QUEUE_DEPTH, MAX_OBSERVERS,
    RX_PRIO_QUEUE_DEPTH, RX_QUEUE_DEPTH, TX_QUEUE_DEPTH,
};
use crate::gap::Gap;
use crate::gatt::Gatt;
use crate::hci::{is_priority, status};
use crate::l2cap::L2cap;
use crate::security::{KeyStore, SecurityManager};
use crate::{Address, BdAddr, Config, Error, PacketKind};

mod dispatch;
mod events;
mod init;
mod internal_command_processor;
mod rng;

pub use dispatch::CommandResult;
pub(crate) use dispatch::Dispatcher;
pub(crate) use rng::HostRng;

/// Packet buffers used by one [`Stack`]
///
/// * `CMD` - outbound command buffers
/// * `EVT` - inbound event buffers
/// * `ACL_IN` / `ACL_OUT` - inbound and outbound ACL buffers of `ACL_SIZE` bytes,
///   HCI header included
/// * `SDU` - reassembly buffers of `SDU_SIZE` bytes, one per L2CAP frame or
///   SDU being assembled
pub struct HostResources<
    const CMD: usize,
    const EVT: usize,
    const ACL_IN: usize,
    const ACL_OUT: usize,
    const ACL_SIZE: usize,
    const SDU: usize,
    const SDU_SIZE: usize,
> {
    cmd: BufPool<CMD, HCI_CMD_BUF_SIZE>,
    evt: BufPool<EVT, HCI_EVT_BUF_SIZE>,
    acl_in: BufPool<ACL_IN, ACL_SIZE>,
    acl_out: BufPool<ACL_OUT, ACL_SIZE>,
    sdu: BufPool<SDU, SDU_SIZE>,
}

impl<
    const CMD: usize,
    const EVT: usize,
    const ACL_IN: usize,
    const ACL_OUT: usize,
    const ACL_SIZE: usize,
    const SDU: usize,
    const SDU_SIZE: usize,
> HostResources<CMD, EVT, ACL_IN, ACL_OUT, ACL_SIZE, SDU, SDU_SIZE>
{
    /// Create empty pools
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cmd: BufPool::new(),
            evt: BufPool::new(),
            acl_in: BufPool::new(),
            acl_out: BufPool::new(),
            sdu: BufPool::new(),
        }
    }
}

impl<
    const CMD: usize,
    const EVT: usize,
    const ACL_IN: usize,
    const ACL_OUT: usize,
    const ACL_SIZE: usize,
    const SDU: usize,
    const SDU_SIZE: usize,
> Default for HostResources<CMD, EVT, ACL_IN, ACL_OUT, ACL_SIZE, SDU, SDU_SIZE>
{
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct Pools<'d> {
    pub cmd: &'d dyn RawPool,
    pub evt: &'d dyn RawPool,
    pub acl_in: &'d dyn RawPool,
    pub acl_out: &'d dyn RawPool,
    pub sdu: &'d dyn RawPool,
}

/// What the controller told us about itself during [`Stack::enable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LocalInfo {
    /// Identity address
    pub address: Address,
    /// HCI version
    pub hci_version: u8,
    /// HCI revision
    pub hci_revision: u16,
    /// LMP version
    pub lmp_version: u8,
    /// Company identifier
    pub manufacturer: u16,
    /// LMP subversion
    pub lmp_subversion: u16,
    /// LMP features page 0
    pub features: [u8; 8],
    /// LE features
    pub le_features: [u8; 8],
    /// Supported commands bitmap
    pub supported_commands: [u8; 64],
}

impl LocalInfo {
    const fn new() -> Self {
        Self {
            address: Address::public([0; 6]),
            hci_version: 0,
            hci_revision: 0,
            lmp_version: 0,
            manufacturer: 0,
            lmp_subversion: 0,
            features: [0; 8],
            le_features: [0; 8],
            supported_commands: [0; 64],
        }
    }

    /// True if the controller supports BR/EDR
    #[must_use]
    pub const fn supports_br_edr(&self) -> bool {
        // byte 4 bit 5: "BR/EDR Not Supported"
        self.features[4] & 0x20 == 0
    }

    /// True if the controller supports LE
    #[must_use]
    pub const fn supports_le(&self) -> bool {
        self.features[4] & 0x40 != 0
    }
}

impl Default for LocalInfo {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct DeviceState {
    pub info: LocalInfo,
    pub enabled: bool,
}

/// Follow-up work requested by an event handler
///
/// Event handlers run on the receive tasks and must not wait for a command
/// round trip; they queue one of these instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum InternalCommand {
    AcceptConnection { bd_addr: BdAddr },
    LinkKeyReply { bd_addr: BdAddr, key: [u8; 16] },
    LinkKeyNegativeReply { bd_addr: BdAddr },
    PinCodeNegativeReply { bd_addr: BdAddr },
    IoCapabilityNegativeReply { bd_addr: BdAddr },
    UserConfirmationNegativeReply { bd_addr: BdAddr },
    LtkReply { handle: u16, ltk: [u8; 16] },
    LtkNegativeReply { handle: u16 },
    ConnParamReply { handle: u16, params: ConnParams },
    ConnParamNegativeReply { handle: u16 },
    ConnUpdate { handle: u16, params: ConnParams },
    ReadRemoteFeatures { handle: u16 },
    UpdateConnParams { id: ConnId },
    ScanUpdate { fast: bool },
    CreateConnection { id: ConnId },
    ReenableAdvertising,
}

type CS = CriticalSectionRawMutex;

// event code checked before the priority split
const DISCONNECTION_COMPLETE: u8 = 0x05;

/// The host stack
pub struct Stack<'d> {
    pub(crate) config: Config,
    pub(crate) pools: Pools<'d>,
    pub(crate) device: Mutex<CS, RefCell<DeviceState>>,
    pub(crate) dispatcher: Dispatcher<'d>,
    pub(crate) rx_queue: Channel<CS, Buf<'d>, RX_QUEUE_DEPTH>,
    pub(crate) rx_prio_queue: Channel<CS, Buf<'d>, RX_PRIO_QUEUE_DEPTH>,
    pub(crate) tx_queue: Channel<CS, Buf<'d>, TX_QUEUE_DEPTH>,
    pub(crate) internal: Channel<CS, InternalCommand, INTERNAL_COMMAND_QUEUE_DEPTH>,
    pub(crate) connections: ConnectionManager,
    pub(crate) acl: AclRx<'d>,
    pub(crate) l2cap: L2cap<'d>,
    pub(crate) gatt: Gatt<'d>,
    pub(crate) gap: Gap<'d>,
    pub(crate) rng: Mutex<CS, RefCell<Option<HostRng>>>,
    security: Option<&'d dyn SecurityManager>,
    store: Option<&'d dyn KeyStore>,
    observers: Mutex<CS, RefCell<Vec<&'d dyn ConnectionObserver, MAX_OBSERVERS>>>,
}

impl<'d> Stack<'d> {
    /// Create a stack over `resources`
    #[must_use]
    pub fn new<
        const CMD: usize,
        const EVT: usize,
        const ACL_IN: usize,
        const ACL_OUT: usize,
        const ACL_SIZE: usize,
        const SDU: usize,
        const SDU_SIZE: usize,
    >(
        resources: &'d HostResources<CMD, EVT, ACL_IN, ACL_OUT, ACL_SIZE, SDU, SDU_SIZE>,
        config: Config,
    ) -> Self {
        Self {
            config,
            pools: Pools {
                cmd: &resources.cmd,
                evt: &resources.evt,
                acl_in: &resources.acl_in,
                acl_out: &resources.acl_out,
                sdu: &resources.sdu,
            },
            device: Mutex::new(RefCell::new(DeviceState {
                info: LocalInfo::new(),
                enabled: false,
            })),
            dispatcher: Dispatcher::new(),
            rx_queue: Channel::new(),
            rx_prio_queue: Channel::new(),
            tx_queue: Channel::new(),
            internal: Channel::new(),
            connections: ConnectionManager::new(),
            acl: AclRx::new(),
            l2cap: L2cap::new(),
            gatt: Gatt::new(),
            gap: Gap::new(),
            rng: Mutex::new(RefCell::new(None)),
            security: None,
            store: None,
            observers: Mutex::new(RefCell::new(Vec::new())),
        }
    }

    /// Use `security` for key material lookups
    #[must_use]
    pub fn with_security_manager(mut self, security: &'d dyn SecurityManager) -> Self {
        self.security = Some(security);
        self
    }

    /// Persist the identity address through `store`
    #[must_use]
    pub fn with_key_store(mut self, store: &'d dyn KeyStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a connection observer
    ///
    /// # Errors
    /// Returns [`Error::NoResources`] if the observer list is full
    pub fn add_observer(&self, observer: &'d dyn ConnectionObserver) -> Result<(), Error> {
        self.observers.lock(|o| {
            o.borrow_mut()
                .push(observer)
                .map_err(|_| Error::NoResources)
        })
    }

    /// Runtime configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Controller information gathered by [`enable`](Self::enable)
    #[must_use]
    pub fn local_info(&self) -> LocalInfo {
        self.device.lock(|d| d.borrow().info)
    }

    /// True once [`enable`](Self::enable) succeeded
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.device.lock(|d| d.borrow().enabled)
    }

    /// Number of occupied connection slots
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.connection_count()
    }

    /// Handle to the connection in slot `id`
    #[must_use]
    pub fn connection(&self, id: ConnId) -> Option<Connection<'_>> {
        self.connections.connection(id)
    }

    /// Handle to the established connection with `peer`
    #[must_use]
    pub fn connection_by_addr(&self, peer: &Address) -> Option<Connection<'_>> {
        let id = self
            .connections
            .find_by_addr_state(peer, crate::ConnectionState::Connected)?;
        self.connections.connection(id)
    }

    /// Take an empty buffer for an inbound packet of `kind`
    ///
    /// # Errors
    /// Returns [`Error::NoResources`] if the pool is exhausted and
    /// [`Error::InvalidParameter`] for command packets
    pub fn rx_buffer(&self, kind: PacketKind) -> Result<Buf<'d>, Error> {
        match kind {
            PacketKind::Event => Buf::try_alloc(self.pools.evt, BufKind::Event),
            PacketKind::Acl => Buf::try_alloc(self.pools.acl_in, BufKind::AclIn),
            PacketKind::Command => Err(Error::InvalidParameter),
        }
    }

    /// Hand a received event or ACL packet to the stack
    ///
    /// Command Complete, Command Status and Number Of Completed Packets go to
    /// the priority queue, everything else to the regular one.
    ///
    /// # Errors
    /// Returns [`Error::NoResources`] if the queue is full (the packet is
    /// dropped) and [`Error::InvalidPacket`] for an empty event
    pub fn deliver(&self, buf: Buf<'d>) -> Result<(), Error> {
        if buf.kind() == BufKind::Event {
            if let &[DISCONNECTION_COMPLETE, _, status::SUCCESS, lo, hi, ..] = buf.data() {
                self.connections.abort_tx(u16::from_le_bytes([lo, hi]) & 0x0FFF);
            }
        }

        let priority = match buf.kind() {
            BufKind::Event => match buf.data().first() {
                Some(&code) => is_priority(code),
                None => {
                    warn!("[HOST] empty event dropped");
                    return Err(Error::InvalidPacket);
                }
            },
            BufKind::AclIn => false,
            other => {
                warn!("[HOST] cannot deliver {:?} buffer", other);
                return Err(Error::InvalidParameter);
            }
        };

        let queued = if priority {
            self.rx_prio_queue.try_send(buf).is_ok()
        } else {
            self.rx_queue.try_send(buf).is_ok()
        };
        if queued {
            Ok(())
        } else {
            warn!("[HOST] inbound queue full, packet dropped");
            Err(Error::NoResources)
        }
    }

    /// Copy a received packet into a stack buffer and deliver it
    ///
    /// # Errors
    /// See [`rx_buffer`](Self::rx_buffer) and [`deliver`](Self::deliver);
    /// [`Error::MessageTooLong`] if the packet does not fit a buffer
    pub fn deliver_bytes(&self, kind: PacketKind, packet: &[u8]) -> Result<(), Error> {
        let mut buf = self.rx_buffer(kind)?;
        buf.put_slice(packet)?;
        self.deliver(buf)
    }

    pub(crate) fn security(&self) -> &'d dyn SecurityManager {
        self.security.unwrap_or(&())
    }

    pub(crate) fn key_store(&self) -> Option<&'d dyn KeyStore> {
        self.store
    }

    pub(crate) fn for_each_observer(&self, f: impl Fn(&dyn ConnectionObserver)) {
        let observers = self.observers.lock(|o| o.borrow().clone());
        for observer in observers {
            f(observer);
        }
    }

    /// Queue follow-up work for the internal command processor
    pub(crate) async fn queue_internal(&self, command: InternalCommand) {
        self.internal.send(command).await;
    }

    pub(crate) fn conn_info(&self, id: ConnId) -> Option<ConnectionInfo> {
        self.connections.info(id)
    }
}
