//! GATT (Generic Attribute Profile)
//!
//! The server side serves one attribute table, built by
//! [`Stack::gatt_register`], to every connected peer. The client side runs
//! discovery, reads, writes and subscriptions against a peer's server.
//!
//! ATT allows one outstanding request per direction on a link, so each
//! connection has a single client operation slot. Starting a second
//! discovery, read or write while one is pending fails with
//! [`Error::Busy`](crate::Error::Busy). Server notifications go out
//! immediately; an indication waits for the peer's confirmation and only one
//! may be outstanding per connection.
//!
//! [`Stack::gatt_register`]: crate::Stack::gatt_register

use core::cell::{Cell, RefCell};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use heapless::Vec;

use crate::connection::ConnId;
use crate::constants::{ATT_MAX_MTU, MAX_CONNECTIONS, MAX_PREPARED_WRITES, MAX_SUBSCRIPTIONS};
use crate::Error;

mod client;
mod db;
mod server;
mod subscription;

pub use client::{DiscoverKind, DiscoverParams, Discovered};
pub use db::{
    Attribute, AttributeValue, CccHandler, Permissions, ServiceHandles, properties, read_slice,
};
pub use subscription::{NotificationHandler, SubscribeParams};

use db::AttributeTable;
use server::PreparedWrite;
use subscription::Subscription;

type CS = CriticalSectionRawMutex;

/// Client Characteristic Configuration: notifications enabled
pub const CCC_NOTIFY: u16 = 0x0001;

/// Client Characteristic Configuration: indications enabled
pub const CCC_INDICATE: u16 = 0x0002;

/// Response PDU handed from the receive task to a waiting client call
pub(crate) type Response = Result<Vec<u8, ATT_MAX_MTU>, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum ClientState {
    Idle,
    /// Claimed by an operation, no request on the air
    Busy,
    /// Request with this opcode sent, response pending
    Waiting(u8),
}

/// The ATT client transaction of one connection
pub(crate) struct ClientSlot {
    state: Mutex<CS, Cell<ClientState>>,
    response: Signal<CS, Response>,
}

impl ClientSlot {
    const fn new() -> Self {
        Self {
            state: Mutex::new(Cell::new(ClientState::Idle)),
            response: Signal::new(),
        }
    }
}

/// Outstanding server indication of one connection
pub(crate) struct IndicateSlot {
    busy: Mutex<CS, Cell<bool>>,
    confirmed: Signal<CS, Result<(), Error>>,
}

impl IndicateSlot {
    const fn new() -> Self {
        Self {
            busy: Mutex::new(Cell::new(false)),
            confirmed: Signal::new(),
        }
    }
}

/// GATT state of the stack
pub(crate) struct Gatt<'d> {
    table: Mutex<CS, RefCell<AttributeTable<'d>>>,
    prepared: Mutex<CS, RefCell<Vec<PreparedWrite, MAX_PREPARED_WRITES>>>,
    subscriptions: Mutex<CS, RefCell<Vec<Subscription<'d>, MAX_SUBSCRIPTIONS>>>,
    clients: [ClientSlot; MAX_CONNECTIONS],
    indications: [IndicateSlot; MAX_CONNECTIONS],
}

impl<'d> Gatt<'d> {
    pub const fn new() -> Self {
        Self {
            table: Mutex::new(RefCell::new(AttributeTable::new())),
            prepared: Mutex::new(RefCell::new(Vec::new())),
            subscriptions: Mutex::new(RefCell::new(Vec::new())),
            clients: [const { ClientSlot::new() }; MAX_CONNECTIONS],
            indications: [const { IndicateSlot::new() }; MAX_CONNECTIONS],
        }
    }

    fn client(&self, conn: ConnId) -> &ClientSlot {
        &self.clients[conn.index()]
    }

    fn indication(&self, conn: ConnId) -> &IndicateSlot {
        &self.indications[conn.index()]
    }
}
