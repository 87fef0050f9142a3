//! Attribute table
//!
//! One flat table ordered by handle. Registration appends a service's
//! attributes with consecutive handles; nothing is ever removed, so a handle
//! is never reused. Values are produced on demand: declarations from their
//! own description, characteristic values through an [`AttributeValue`],
//! and CCC descriptors from a per-peer value kept in the table entry.

use heapless::Vec;

use super::Gatt;
use crate::att::{AttErrorCode, Uuid};
use crate::codec::Writer;
use crate::connection::ConnectionInfo;
use crate::constants::{MAX_ATTRIBUTES, MAX_CONNECTIONS, MAX_SERVICES};
use crate::{Address, Error};

/// Source and sink of a characteristic value
///
/// Both methods run on the stack's receive task with no lock held.
pub trait AttributeValue {
    /// Copy the value from `offset` into `out`, returning the bytes copied
    ///
    /// # Errors
    /// The ATT error reported to the peer
    fn read(
        &self,
        conn: &ConnectionInfo,
        offset: usize,
        out: &mut [u8],
    ) -> Result<usize, AttErrorCode> {
        let _ = (conn, offset, out);
        Err(AttErrorCode::ReadNotPermitted)
    }

    /// Store `data` at `offset`
    ///
    /// # Errors
    /// The ATT error reported to the peer
    fn write(&self, conn: &ConnectionInfo, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
        let _ = (conn, offset, data);
        Err(AttErrorCode::WriteNotPermitted)
    }
}

/// Serve `value` from `offset`, truncated to `out`
///
/// # Errors
/// [`AttErrorCode::InvalidOffset`] if `offset` is past the end of `value`
///
/// # Examples
///
/// ```rust
/// use bluewren::gatt::read_slice;
///
/// let mut out = [0u8; 4];
/// assert_eq!(read_slice(b"bluewren", 6, &mut out), Ok(2));
/// assert_eq!(&out[..2], b"en");
/// assert!(read_slice(b"bluewren", 9, &mut out).is_err());
/// ```
pub fn read_slice(value: &[u8], offset: usize, out: &mut [u8]) -> Result<usize, AttErrorCode> {
    let rest = value.get(offset..).ok_or(AttErrorCode::InvalidOffset)?;
    let n = rest.len().min(out.len());
    out[..n].copy_from_slice(&rest[..n]);
    Ok(n)
}

/// Told when a peer changes its Client Characteristic Configuration
pub trait CccHandler {
    /// `value` is the peer's new configuration ([`CCC_NOTIFY`](super::CCC_NOTIFY),
    /// [`CCC_INDICATE`](super::CCC_INDICATE))
    fn changed(&self, conn: &ConnectionInfo, value: u16);
}

/// Access permissions of an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Permissions(u8);

impl Permissions {
    /// No access
    pub const NONE: Self = Self(0);
    /// Readable
    pub const READ: Self = Self(0x01);
    /// Writable
    pub const WRITE: Self = Self(0x02);
    /// Readable over an encrypted link only
    pub const READ_ENCRYPT: Self = Self(0x04);
    /// Writable over an encrypted link only
    pub const WRITE_ENCRYPT: Self = Self(0x08);

    /// True if every bit of `other` is set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    fn readable(self) -> bool {
        self.0 & (Self::READ.0 | Self::READ_ENCRYPT.0) != 0
    }

    fn writable(self) -> bool {
        self.0 & (Self::WRITE.0 | Self::WRITE_ENCRYPT.0) != 0
    }
}

impl core::ops::BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Characteristic properties, as carried in the declaration
pub mod properties {
    /// Broadcast
    pub const BROADCAST: u8 = 0x01;
    /// Read
    pub const READ: u8 = 0x02;
    /// Write Without Response
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    /// Write
    pub const WRITE: u8 = 0x08;
    /// Notify
    pub const NOTIFY: u8 = 0x10;
    /// Indicate
    pub const INDICATE: u8 = 0x20;
}

/// Handle range of a registered service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceHandles {
    /// First handle
    pub start: u16,
    /// Last handle
    pub end: u16,
}

#[derive(Clone, Copy)]
pub(crate) enum AttrKind<'d> {
    Service(Uuid),
    Include { start: u16, end: u16, uuid: Uuid },
    Characteristic { properties: u8, uuid: Uuid },
    Value(&'d dyn AttributeValue),
    Ccc(Option<&'d dyn CccHandler>),
    UserDescription(&'d str),
}

/// One attribute of a service definition
///
/// ```rust,ignore
/// let service = [
///     Attribute::primary_service(Uuid::Uuid16(0x180F)),
///     Attribute::characteristic(Uuid::Uuid16(0x2A19), properties::READ | properties::NOTIFY),
///     Attribute::value(Uuid::Uuid16(0x2A19), Permissions::READ, &BATTERY),
///     Attribute::ccc(None),
/// ];
/// let handles = stack.gatt_register(&service)?;
/// ```
#[derive(Clone, Copy)]
pub struct Attribute<'d> {
    uuid: Uuid,
    perms: Permissions,
    pub(crate) kind: AttrKind<'d>,
}

impl<'d> Attribute<'d> {
    /// Primary Service declaration
    #[must_use]
    pub const fn primary_service(uuid: Uuid) -> Self {
        Self {
            uuid: Uuid::PRIMARY_SERVICE,
            perms: Permissions::READ,
            kind: AttrKind::Service(uuid),
        }
    }

    /// Secondary Service declaration
    #[must_use]
    pub const fn secondary_service(uuid: Uuid) -> Self {
        Self {
            uuid: Uuid::SECONDARY_SERVICE,
            perms: Permissions::READ,
            kind: AttrKind::Service(uuid),
        }
    }

    /// Include declaration pointing at an already registered service
    #[must_use]
    pub const fn include(service: ServiceHandles, uuid: Uuid) -> Self {
        Self {
            uuid: Uuid::INCLUDE,
            perms: Permissions::READ,
            kind: AttrKind::Include {
                start: service.start,
                end: service.end,
                uuid,
            },
        }
    }

    /// Characteristic declaration; the value attribute must follow it
    #[must_use]
    pub const fn characteristic(uuid: Uuid, properties: u8) -> Self {
        Self {
            uuid: Uuid::CHARACTERISTIC,
            perms: Permissions::READ,
            kind: AttrKind::Characteristic { properties, uuid },
        }
    }

    /// Characteristic value served by `value`
    #[must_use]
    pub const fn value(uuid: Uuid, perms: Permissions, value: &'d dyn AttributeValue) -> Self {
        Self {
            uuid,
            perms,
            kind: AttrKind::Value(value),
        }
    }

    /// Client Characteristic Configuration descriptor
    #[must_use]
    pub const fn ccc(handler: Option<&'d dyn CccHandler>) -> Self {
        Self {
            uuid: Uuid::CLIENT_CHARACTERISTIC_CONFIGURATION,
            perms: Permissions(Permissions::READ.0 | Permissions::WRITE.0),
            kind: AttrKind::Ccc(handler),
        }
    }

    /// Characteristic User Description descriptor
    #[must_use]
    pub const fn user_description(text: &'d str) -> Self {
        Self {
            uuid: Uuid::USER_DESCRIPTION,
            perms: Permissions::READ,
            kind: AttrKind::UserDescription(text),
        }
    }

    /// Attribute type
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Access permissions
    #[must_use]
    pub fn permissions(&self) -> Permissions {
        self.perms
    }

    /// Service UUID, if this is a service declaration
    pub(crate) fn service_uuid(&self) -> Option<Uuid> {
        match self.kind {
            AttrKind::Service(uuid) => Some(uuid),
            _ => None,
        }
    }

    fn is_declaration(&self) -> bool {
        matches!(
            self.kind,
            AttrKind::Service(_) | AttrKind::Characteristic { .. }
        )
    }
}

pub(crate) struct Entry<'d> {
    pub handle: u16,
    pub attr: Attribute<'d>,
    /// CCC value per peer, only for CCC descriptors
    ccc: Vec<(Address, u16), MAX_CONNECTIONS>,
}

pub(crate) struct AttributeTable<'d> {
    entries: Vec<Entry<'d>, MAX_ATTRIBUTES>,
    services: Vec<ServiceHandles, MAX_SERVICES>,
}

impl<'d> AttributeTable<'d> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            services: Vec::new(),
        }
    }

    fn last_handle(&self) -> u16 {
        self.entries.last().map_or(0, |e| e.handle)
    }

    /// Append `attrs` with consecutive handles
    fn register(&mut self, attrs: &[Attribute<'d>]) -> Result<ServiceHandles, Error> {
        if attrs.is_empty() {
            return Err(Error::InvalidParameter);
        }
        if self.entries.len() + attrs.len() > self.entries.capacity() || self.services.is_full() {
            return Err(Error::NoResources);
        }
        let start = self.last_handle().checked_add(1).ok_or(Error::NoResources)?;
        let count = u16::try_from(attrs.len() - 1).map_err(|_| Error::NoResources)?;
        let end = start.checked_add(count).ok_or(Error::NoResources)?;

        for (handle, attr) in (start..=end).zip(attrs) {
            let entry = Entry {
                handle,
                attr: *attr,
                ccc: Vec::new(),
            };
            self.entries
                .push(entry)
                .map_err(|_| Error::NoResources)?;
        }
        let span = ServiceHandles { start, end };
        self.services.push(span).map_err(|_| Error::NoResources)?;
        Ok(span)
    }

    fn entry(&self, handle: u16) -> Option<&Entry<'d>> {
        let index = self
            .entries
            .binary_search_by_key(&handle, |e| e.handle)
            .ok()?;
        self.entries.get(index)
    }

    fn entry_mut(&mut self, handle: u16) -> Option<&mut Entry<'d>> {
        let index = self
            .entries
            .binary_search_by_key(&handle, |e| e.handle)
            .ok()?;
        self.entries.get_mut(index)
    }

    /// First attribute with a handle in `start..=end`
    fn next(&self, start: u16, end: u16) -> Option<(u16, Attribute<'d>)> {
        let index = self.entries.partition_point(|e| e.handle < start);
        self.entries
            .get(index)
            .filter(|e| e.handle <= end)
            .map(|e| (e.handle, e.attr))
    }

    /// Last handle of the group opened by the service declaration at `handle`
    fn group_end(&self, handle: u16) -> u16 {
        let index = self.entries.partition_point(|e| e.handle <= handle);
        self.entries[index..]
            .iter()
            .find(|e| e.attr.service_uuid().is_some())
            .map_or(self.last_handle(), |e| e.handle - 1)
    }

    /// CCC descriptor of the characteristic whose value is at `value_handle`
    fn ccc_for_value(&self, value_handle: u16) -> Option<u16> {
        let index = self.entries.partition_point(|e| e.handle <= value_handle);
        self.entries[index..]
            .iter()
            .take_while(|e| !e.attr.is_declaration())
            .find(|e| matches!(e.attr.kind, AttrKind::Ccc(_)))
            .map(|e| e.handle)
    }

    fn ccc_value(&self, handle: u16, peer: &Address) -> u16 {
        self.entry(handle)
            .and_then(|e| e.ccc.iter().find(|(p, _)| p == peer))
            .map_or(0, |(_, value)| *value)
    }

    /// Store a peer's CCC value, returning true if it changed
    fn set_ccc(&mut self, handle: u16, peer: Address, value: u16) -> Result<bool, AttErrorCode> {
        let entry = self.entry_mut(handle).ok_or(AttErrorCode::InvalidHandle)?;
        match entry.ccc.iter().position(|(p, _)| *p == peer) {
            Some(i) if value == 0 => {
                entry.ccc.swap_remove(i);
                Ok(true)
            }
            Some(i) => Ok(core::mem::replace(&mut entry.ccc[i].1, value) != value),
            None if value == 0 => Ok(false),
            None => entry
                .ccc
                .push((peer, value))
                .map(|()| true)
                .map_err(|_| AttErrorCode::InsufficientResources),
        }
    }

    fn clear_ccc(&mut self, peer: &Address) {
        for entry in &mut self.entries {
            entry.ccc.retain(|(p, _)| p != peer);
        }
    }
}

/// Whether `conn` may write `attr` at all
pub(crate) fn check_writable(conn: &ConnectionInfo, attr: &Attribute<'_>) -> Result<(), AttErrorCode> {
    if !attr.perms.writable() {
        return Err(AttErrorCode::WriteNotPermitted);
    }
    if attr.perms.contains(Permissions::WRITE_ENCRYPT) && !conn.encrypted {
        return Err(AttErrorCode::InsufficientEncryption);
    }
    Ok(())
}

impl<'d> Gatt<'d> {
    pub(crate) fn register(&self, attrs: &[Attribute<'d>]) -> Result<ServiceHandles, Error> {
        let span = self.table.lock(|t| t.borrow_mut().register(attrs))?;
        debug!("[GATT] registered handles {:#x}..={:#x}", span.start, span.end);
        Ok(span)
    }

    pub(crate) fn attribute(&self, handle: u16) -> Option<Attribute<'d>> {
        self.table.lock(|t| t.borrow().entry(handle).map(|e| e.attr))
    }

    pub(crate) fn next_attribute(&self, start: u16, end: u16) -> Option<(u16, Attribute<'d>)> {
        self.table.lock(|t| t.borrow().next(start, end))
    }

    pub(crate) fn group_end(&self, handle: u16) -> u16 {
        self.table.lock(|t| t.borrow().group_end(handle))
    }

    pub(crate) fn ccc_for_value(&self, value_handle: u16) -> Option<u16> {
        self.table.lock(|t| t.borrow().ccc_for_value(value_handle))
    }

    pub(crate) fn ccc_value(&self, handle: u16, peer: &Address) -> u16 {
        self.table.lock(|t| t.borrow().ccc_value(handle, peer))
    }

    /// Forget every CCC value stored for `peer`
    pub(crate) fn clear_ccc(&self, peer: &Address) {
        self.table.lock(|t| t.borrow_mut().clear_ccc(peer));
    }

    /// Read an attribute value on behalf of `conn`
    pub(crate) fn read_attribute(
        &self,
        conn: &ConnectionInfo,
        handle: u16,
        attr: &Attribute<'d>,
        offset: usize,
        out: &mut [u8],
    ) -> Result<usize, AttErrorCode> {
        if !attr.perms.readable() {
            return Err(AttErrorCode::ReadNotPermitted);
        }
        if attr.perms.contains(Permissions::READ_ENCRYPT) && !conn.encrypted {
            return Err(AttErrorCode::InsufficientEncryption);
        }

        let mut declaration = [0u8; 21];
        let mut w = Writer::new(&mut declaration);
        // every declaration fits 21 bytes
        let _ = match attr.kind {
            AttrKind::Value(value) => return value.read(conn, offset, out),
            AttrKind::UserDescription(text) => return read_slice(text.as_bytes(), offset, out),
            AttrKind::Ccc(_) => {
                let value = self.ccc_value(handle, &conn.peer);
                return read_slice(&value.to_le_bytes(), offset, out);
            }
            AttrKind::Service(uuid) => uuid.write(&mut w),
            AttrKind::Include { start, end, uuid } => w
                .le16(start)
                .and_then(|()| w.le16(end))
                .and_then(|()| match uuid.as_short() {
                    Some(short) => w.le16(short),
                    None => Ok(()),
                }),
            AttrKind::Characteristic { properties, uuid } => w
                .u8(properties)
                .and_then(|()| w.le16(handle.wrapping_add(1)))
                .and_then(|()| uuid.write(&mut w)),
        };
        read_slice(w.written(), offset, out)
    }

    /// Write an attribute value on behalf of `conn`
    pub(crate) fn write_attribute(
        &self,
        conn: &ConnectionInfo,
        handle: u16,
        attr: &Attribute<'d>,
        offset: usize,
        data: &[u8],
    ) -> Result<(), AttErrorCode> {
        check_writable(conn, attr)?;
        match attr.kind {
            AttrKind::Value(value) => value.write(conn, offset, data),
            AttrKind::Ccc(handler) => {
                if offset != 0 {
                    return Err(AttErrorCode::InvalidOffset);
                }
                let &[lo, hi] = data else {
                    return Err(AttErrorCode::InvalidAttributeValueLength);
                };
                let value = u16::from_le_bytes([lo, hi]);
                let changed = self
                    .table
                    .lock(|t| t.borrow_mut().set_ccc(handle, conn.peer, value))?;
                debug!("[GATT] CCC {:#x} of {:?} = {:#x}", handle, conn.peer, value);
                if let (true, Some(handler)) = (changed, handler) {
                    handler.changed(conn, value);
                }
                Ok(())
            }
            _ => Err(AttErrorCode::WriteNotPermitted),
        }
    }
}
