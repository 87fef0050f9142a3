//! ATT bearer and GATT server
//!
//! [`Stack::att_recv`] takes every PDU arriving on the ATT channel. Requests
//! are served from the attribute table and always answered, with an Error
//! Response when they fail. Responses go to the waiting client operation,
//! notifications and indications to the subscriptions.

use heapless::Vec;

use super::db::{AttrKind, Attribute, ServiceHandles, check_writable};
use super::{CCC_INDICATE, CCC_NOTIFY, Gatt, IndicateSlot};
use crate::att::{AttErrorCode, AttPdu, EXECUTE_CANCEL, EXECUTE_WRITE, Uuid, opcode};
use crate::codec::Writer;
use crate::connection::{ConnId, Connection, ConnectionInfo, ConnectionState};
use crate::constants::{ATT_DEFAULT_MTU, ATT_MAX_MTU, MAX_PREPARED_WRITES, MAX_PREPARED_WRITE_LEN};
use crate::host::Stack;
use crate::l2cap::cid;
use crate::Error;

/// Read By Type entries carry their length in one byte
const MAX_LIST_VALUE: usize = 253;

/// One queued Prepare Write segment
pub(crate) struct PreparedWrite {
    conn: ConnId,
    handle: u16,
    offset: u16,
    data: Vec<u8, MAX_PREPARED_WRITE_LEN>,
}

/// Error Response to answer a request with: attribute handle and code
struct Reject(u16, AttErrorCode);

impl From<Error> for Reject {
    // only a response overflowing its buffer gets here
    fn from(_: Error) -> Self {
        Self(0, AttErrorCode::UnlikelyError)
    }
}

/// Frees the indication slot when the indication completes or is dropped
struct IndicateGuard<'a>(&'a IndicateSlot);

impl Drop for IndicateGuard<'_> {
    fn drop(&mut self) {
        self.0.busy.lock(|busy| busy.set(false));
    }
}

fn check_range(start: u16, end: u16) -> Result<(), Reject> {
    if start == 0 || start > end {
        return Err(Reject(start, AttErrorCode::InvalidHandle));
    }
    Ok(())
}

impl<'d> Gatt<'d> {
    /// Attributes in `start..=end`, fetched one at a time so accessors never
    /// run with the table locked
    fn attributes(&self, start: u16, end: u16) -> impl Iterator<Item = (u16, Attribute<'d>)> + '_ {
        let mut next = Some(start);
        core::iter::from_fn(move || {
            let (handle, attr) = self.next_attribute(next?, end)?;
            next = handle.checked_add(1);
            Some((handle, attr))
        })
    }

    /// Remove and return the queued writes of `conn`, oldest first
    fn take_prepared(&self, conn: ConnId) -> Vec<PreparedWrite, MAX_PREPARED_WRITES> {
        self.prepared.lock(|p| {
            let mut p = p.borrow_mut();
            let mut taken = Vec::new();
            while let Some(i) = p.iter().position(|w| w.conn == conn) {
                // same capacity as the queue
                let _ = taken.push(p.remove(i));
            }
            taken
        })
    }

    pub(crate) fn drop_prepared(&self, conn: ConnId) {
        self.prepared.lock(|p| p.borrow_mut().retain(|w| w.conn != conn));
    }

    fn confirmed(&self, conn: ConnId) {
        let slot = self.indication(conn);
        if slot.busy.lock(|busy| busy.get()) {
            slot.confirmed.signal(Ok(()));
        } else {
            warn!("[ATT] unexpected confirmation on {:?}", conn);
        }
    }

    /// Fail a pending indication of `conn`
    pub(crate) fn abort_indication(&self, conn: ConnId, error: Error) {
        let slot = self.indication(conn);
        if slot.busy.lock(|busy| busy.get()) {
            slot.confirmed.signal(Err(error));
        }
    }
}

impl<'d> Stack<'d> {
    /// Add a service to the attribute table
    ///
    /// Handles are assigned in order, continuing after the last registered
    /// attribute. Values and CCC handlers are borrowed for the stack's
    /// lifetime.
    ///
    /// # Errors
    /// * `Error::InvalidParameter` for an empty list
    /// * `Error::NoResources` when the table or the handle space is full;
    ///   nothing is registered then
    pub fn gatt_register(&self, attrs: &[Attribute<'d>]) -> Result<ServiceHandles, Error> {
        self.gatt.register(attrs)
    }

    /// Send a Handle Value Notification for `value_handle`
    ///
    /// Nothing is sent, and `Ok` returned, when the peer has not enabled
    /// notifications in the characteristic's CCC.
    ///
    /// # Errors
    /// * `Error::NotFound` if `value_handle` is not a characteristic value
    /// * `Error::InvalidParameter` if the characteristic has no CCC
    /// * `Error::MessageTooLong` if `data` exceeds ATT MTU - 3
    /// * `Error::NotConnected` if the link is down
    pub async fn gatt_notify(
        &self,
        conn: &Connection<'_>,
        value_handle: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        if !self.ccc_enabled(conn.id(), value_handle, CCC_NOTIFY)? {
            trace!("[GATT] notifications of {:#x} not enabled", value_handle);
            return Ok(());
        }
        self.att_send(
            conn.id(),
            &AttPdu::Notification {
                handle: value_handle,
                value: data,
            },
        )
        .await
    }

    /// Send a Handle Value Indication and wait for the peer's confirmation
    ///
    /// # Errors
    /// Those of [`Stack::gatt_notify`], and
    /// * `Error::InvalidState` when the peer has not enabled indications
    /// * `Error::Busy` while another indication on the link is unconfirmed
    /// * `Error::Disconnected` if the link drops before the confirmation
    pub async fn gatt_indicate(
        &self,
        conn: &Connection<'_>,
        value_handle: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        let id = conn.id();
        if !self.ccc_enabled(id, value_handle, CCC_INDICATE)? {
            return Err(Error::InvalidState);
        }
        let slot = self.gatt.indication(id);
        if slot.busy.lock(|busy| busy.replace(true)) {
            return Err(Error::Busy);
        }
        let _guard = IndicateGuard(slot);
        slot.confirmed.reset();

        self.att_send(
            id,
            &AttPdu::Indication {
                handle: value_handle,
                value: data,
            },
        )
        .await?;
        slot.confirmed.wait().await
    }

    fn ccc_enabled(&self, id: ConnId, value_handle: u16, bit: u16) -> Result<bool, Error> {
        let info = self.conn_info(id).ok_or(Error::NotConnected)?;
        if info.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        match self.gatt.attribute(value_handle) {
            Some(Attribute {
                kind: AttrKind::Value(_),
                ..
            }) => {}
            _ => return Err(Error::NotFound),
        }
        let ccc = self
            .gatt
            .ccc_for_value(value_handle)
            .ok_or(Error::InvalidParameter)?;
        Ok(self.gatt.ccc_value(ccc, &info.peer) & bit != 0)
    }

    /// Encode `pdu` within the link's ATT MTU and send it
    pub(crate) async fn att_send(&self, id: ConnId, pdu: &AttPdu<'_>) -> Result<(), Error> {
        let info = self.conn_info(id).ok_or(Error::NotConnected)?;
        let mtu = usize::from(info.att_mtu).min(ATT_MAX_MTU);
        let mut out = [0u8; ATT_MAX_MTU];
        let mut w = Writer::new(&mut out[..mtu]);
        pdu.encode(&mut w)?;
        self.send_acl_pdu(id, cid::ATT, &[w.written()]).await
    }

    async fn att_reply_error(&self, id: ConnId, request: u8, handle: u16, code: AttErrorCode) {
        debug!(
            "[ATT] request {:#x} on {:?} failed: {:?} at {:#x}",
            request,
            id,
            code,
            handle
        );
        let rsp = AttPdu::ErrorRsp {
            request,
            handle,
            code,
        };
        if let Err(e) = self.att_send(id, &rsp).await {
            warn!("[ATT] error response not sent: {:?}", e);
        }
    }

    /// Process one PDU received on the ATT channel of `id`
    pub(crate) async fn att_recv(&self, id: ConnId, pdu: &[u8]) {
        let Some(info) = self.conn_info(id) else {
            return;
        };
        let decoded = match AttPdu::decode(pdu) {
            Ok(decoded) => decoded,
            Err(_) => {
                let op = pdu.first().copied().unwrap_or_default();
                warn!("[ATT] malformed PDU {:#x} from {:?}", op, info.peer);
                if opcode::is_request(op) {
                    self.att_reply_error(id, op, 0, AttErrorCode::InvalidPdu).await;
                }
                return;
            }
        };
        trace!("[ATT] opcode {:#x} from {:?}", decoded.opcode(), info.peer);

        match decoded {
            AttPdu::Notification { handle, value } => {
                self.gatt_notification(id, &info, handle, value).await;
            }
            AttPdu::Indication { handle, value } => {
                self.gatt_notification(id, &info, handle, value).await;
                if let Err(e) = self.att_send(id, &AttPdu::Confirmation).await {
                    warn!("[ATT] confirmation not sent: {:?}", e);
                }
            }
            AttPdu::Confirmation => self.gatt.confirmed(id),
            AttPdu::WriteCmd { handle, value } => {
                let written = self
                    .gatt
                    .attribute(handle)
                    .ok_or(AttErrorCode::InvalidHandle)
                    .and_then(|attr| self.gatt.write_attribute(&info, handle, &attr, 0, value));
                if let Err(code) = written {
                    debug!("[ATT] write command to {:#x} dropped: {:?}", handle, code);
                }
            }
            AttPdu::Unknown { opcode: op } if op & opcode::COMMAND_FLAG != 0 => {
                debug!("[ATT] ignoring command {:#x}", op);
            }
            AttPdu::Unknown { opcode: op } => {
                self.att_reply_error(id, op, 0, AttErrorCode::RequestNotSupported)
                    .await;
            }
            rsp if rsp.is_response() => self.gatt.client_response(id, &rsp, pdu),
            request => self.att_serve(id, &info, &request).await,
        }
    }

    async fn att_serve(&self, id: ConnId, info: &ConnectionInfo, request: &AttPdu<'_>) {
        let mtu = usize::from(info.att_mtu).min(ATT_MAX_MTU);
        let mut out = [0u8; ATT_MAX_MTU];
        let mut w = Writer::new(&mut out[..mtu]);

        let served = match *request {
            AttPdu::ExchangeMtuReq { mtu } => self.exchange_mtu(id, mtu, &mut w),
            AttPdu::FindInformationReq { start, end } => self.find_information(&mut w, start, end),
            AttPdu::FindByTypeValueReq {
                start,
                end,
                att_type,
                value,
            } => self.find_by_type_value(&mut w, start, end, att_type, value),
            AttPdu::ReadByTypeReq {
                start,
                end,
                att_type,
            } => self.read_by_type(&mut w, info, start, end, att_type),
            AttPdu::ReadReq { handle } => self.read_value(&mut w, info, handle, 0, opcode::READ_RSP),
            AttPdu::ReadBlobReq { handle, offset } => {
                self.read_value(&mut w, info, handle, offset, opcode::READ_BLOB_RSP)
            }
            AttPdu::ReadByGroupTypeReq {
                start,
                end,
                group_type,
            } => self.read_by_group_type(&mut w, start, end, group_type),
            AttPdu::WriteReq { handle, value } => self.write_value(&mut w, info, handle, value),
            AttPdu::PrepareWriteReq {
                handle,
                offset,
                value,
            } => self.prepare_write(&mut w, id, info, handle, offset, value),
            AttPdu::ExecuteWriteReq { flags } => self.execute_write(&mut w, id, info, flags),
            _ => Err(Reject(0, AttErrorCode::RequestNotSupported)),
        };

        match served {
            Ok(()) => {
                if let Err(e) = self.send_acl_pdu(id, cid::ATT, &[w.written()]).await {
                    warn!("[ATT] response to {:?} not sent: {:?}", info.peer, e);
                }
            }
            Err(Reject(handle, code)) => {
                self.att_reply_error(id, request.opcode(), handle, code).await;
            }
        }
    }

    fn exchange_mtu(&self, id: ConnId, client: u16, w: &mut Writer<'_>) -> Result<(), Reject> {
        let ours = self.config.att_mtu;
        AttPdu::ExchangeMtuRsp { mtu: ours }.encode(w)?;
        let mtu = client.min(ours).max(ATT_DEFAULT_MTU);
        self.connections.update(id, |info| info.att_mtu = mtu);
        debug!("[ATT] MTU {} on {:?}", mtu, id);
        Ok(())
    }

    fn find_information(&self, w: &mut Writer<'_>, start: u16, end: u16) -> Result<(), Reject> {
        check_range(start, end)?;
        let mut format = 0;
        for (handle, attr) in self.gatt.attributes(start, end) {
            let uuid = attr.uuid();
            let this = if uuid.as_short().is_some() { 0x01 } else { 0x02 };
            if format == 0 {
                format = this;
                w.u8(opcode::FIND_INFORMATION_RSP)?;
                w.u8(format)?;
            } else if this != format || w.available() < 2 + uuid.len() {
                break;
            }
            w.le16(handle)?;
            uuid.write(w)?;
        }
        if format == 0 {
            return Err(Reject(start, AttErrorCode::AttributeNotFound));
        }
        Ok(())
    }

    fn find_by_type_value(
        &self,
        w: &mut Writer<'_>,
        start: u16,
        end: u16,
        att_type: u16,
        value: &[u8],
    ) -> Result<(), Reject> {
        check_range(start, end)?;
        w.u8(opcode::FIND_BY_TYPE_VALUE_RSP)?;
        // only service discovery by UUID is served
        let target = if Uuid::Uuid16(att_type) == Uuid::PRIMARY_SERVICE {
            Uuid::from_bytes(value).ok()
        } else {
            None
        };
        if let Some(target) = target {
            for (handle, attr) in self.gatt.attributes(start, end) {
                if attr.uuid() != Uuid::PRIMARY_SERVICE || attr.service_uuid() != Some(target) {
                    continue;
                }
                if w.available() < 4 {
                    break;
                }
                w.le16(handle)?;
                w.le16(self.gatt.group_end(handle))?;
            }
        }
        if w.len() == 1 {
            return Err(Reject(start, AttErrorCode::AttributeNotFound));
        }
        Ok(())
    }

    fn read_by_type(
        &self,
        w: &mut Writer<'_>,
        info: &ConnectionInfo,
        start: u16,
        end: u16,
        att_type: Uuid,
    ) -> Result<(), Reject> {
        check_range(start, end)?;
        let mut items = [0u8; ATT_MAX_MTU];
        let room = w.available().saturating_sub(2);
        let mut list = Writer::new(&mut items[..room]);
        let mut entry_len = 0;

        for (handle, attr) in self.gatt.attributes(start, end) {
            if attr.uuid() != att_type {
                continue;
            }
            let mut value = [0u8; MAX_LIST_VALUE];
            let fits = list.available().saturating_sub(2).min(MAX_LIST_VALUE);
            match self
                .gatt
                .read_attribute(info, handle, &attr, 0, &mut value[..fits])
            {
                Err(code) if entry_len == 0 => return Err(Reject(handle, code)),
                Err(_) => break,
                Ok(n) if entry_len == 0 => entry_len = 2 + n,
                Ok(n) if 2 + n != entry_len => break,
                Ok(_) => {}
            }
            list.le16(handle)?;
            list.put_slice(&value[..entry_len - 2])?;
            if list.available() < entry_len {
                break;
            }
        }
        if entry_len == 0 {
            return Err(Reject(start, AttErrorCode::AttributeNotFound));
        }

        w.u8(opcode::READ_BY_TYPE_RSP)?;
        #[allow(clippy::cast_possible_truncation)]
        w.u8(entry_len as u8)?;
        w.put_slice(list.written())?;
        Ok(())
    }

    fn read_by_group_type(
        &self,
        w: &mut Writer<'_>,
        start: u16,
        end: u16,
        group_type: Uuid,
    ) -> Result<(), Reject> {
        check_range(start, end)?;
        if group_type != Uuid::PRIMARY_SERVICE && group_type != Uuid::SECONDARY_SERVICE {
            return Err(Reject(start, AttErrorCode::UnsupportedGroupType));
        }
        let mut items = [0u8; ATT_MAX_MTU];
        let room = w.available().saturating_sub(2);
        let mut list = Writer::new(&mut items[..room]);
        let mut entry_len = 0;

        for (handle, attr) in self.gatt.attributes(start, end) {
            if attr.uuid() != group_type {
                continue;
            }
            let Some(uuid) = attr.service_uuid() else {
                continue;
            };
            let len = 4 + uuid.len();
            if entry_len == 0 {
                entry_len = len;
            } else if len != entry_len {
                break;
            }
            if list.available() < len {
                break;
            }
            list.le16(handle)?;
            list.le16(self.gatt.group_end(handle))?;
            uuid.write(&mut list)?;
        }
        if entry_len == 0 {
            return Err(Reject(start, AttErrorCode::AttributeNotFound));
        }

        w.u8(opcode::READ_BY_GROUP_TYPE_RSP)?;
        #[allow(clippy::cast_possible_truncation)]
        w.u8(entry_len as u8)?;
        w.put_slice(list.written())?;
        Ok(())
    }

    fn read_value(
        &self,
        w: &mut Writer<'_>,
        info: &ConnectionInfo,
        handle: u16,
        offset: u16,
        rsp: u8,
    ) -> Result<(), Reject> {
        let attr = self
            .gatt
            .attribute(handle)
            .ok_or(Reject(handle, AttErrorCode::InvalidHandle))?;
        w.u8(rsp)?;
        let n = self
            .gatt
            .read_attribute(info, handle, &attr, usize::from(offset), w.spare())
            .map_err(|code| Reject(handle, code))?;
        w.advance(n);
        Ok(())
    }

    fn write_value(
        &self,
        w: &mut Writer<'_>,
        info: &ConnectionInfo,
        handle: u16,
        value: &[u8],
    ) -> Result<(), Reject> {
        let attr = self
            .gatt
            .attribute(handle)
            .ok_or(Reject(handle, AttErrorCode::InvalidHandle))?;
        self.gatt
            .write_attribute(info, handle, &attr, 0, value)
            .map_err(|code| Reject(handle, code))?;
        w.u8(opcode::WRITE_RSP)?;
        Ok(())
    }

    fn prepare_write(
        &self,
        w: &mut Writer<'_>,
        id: ConnId,
        info: &ConnectionInfo,
        handle: u16,
        offset: u16,
        value: &[u8],
    ) -> Result<(), Reject> {
        let attr = self
            .gatt
            .attribute(handle)
            .ok_or(Reject(handle, AttErrorCode::InvalidHandle))?;
        check_writable(info, &attr).map_err(|code| Reject(handle, code))?;

        let full = Reject(handle, AttErrorCode::PrepareQueueFull);
        let data = Vec::from_slice(value).map_err(|()| full)?;
        let queued = PreparedWrite {
            conn: id,
            handle,
            offset,
            data,
        };
        self.gatt
            .prepared
            .lock(|p| p.borrow_mut().push(queued))
            .map_err(|_| Reject(handle, AttErrorCode::PrepareQueueFull))?;

        AttPdu::PrepareWriteRsp {
            handle,
            offset,
            value,
        }
        .encode(w)?;
        Ok(())
    }

    fn execute_write(
        &self,
        w: &mut Writer<'_>,
        id: ConnId,
        info: &ConnectionInfo,
        flags: u8,
    ) -> Result<(), Reject> {
        let queued = self.gatt.take_prepared(id);
        match flags {
            EXECUTE_CANCEL => debug!("[ATT] {} prepared writes cancelled", queued.len()),
            EXECUTE_WRITE => {
                for write in &queued {
                    let attr = self
                        .gatt
                        .attribute(write.handle)
                        .ok_or(Reject(write.handle, AttErrorCode::InvalidHandle))?;
                    self.gatt
                        .write_attribute(info, write.handle, &attr, usize::from(write.offset), &write.data)
                        .map_err(|code| Reject(write.handle, code))?;
                }
            }
            _ => return Err(Reject(0, AttErrorCode::InvalidPdu)),
        }
        w.u8(opcode::EXECUTE_WRITE_RSP)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::cell::RefCell;
    use std::vec::Vec;

    use embassy_futures::join::join;

    use super::*;
    use crate::gatt::{AttributeValue, Permissions, properties, read_slice};
    use crate::test_support::{
        MockTransport, TestResources, connect_peer, deliver_att, disconnection_complete,
        num_completed, run,
    };
    use crate::{Address, Config, PacketKind};

    const PEER: Address = Address::public([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    const HANDLE: u16 = 0x0040;

    /// Value backed by a byte vector, writable at any offset
    #[derive(Default)]
    struct Stored(RefCell<Vec<u8>>);

    impl Stored {
        fn with(data: &[u8]) -> Self {
            Self(RefCell::new(data.to_vec()))
        }
    }

    impl AttributeValue for Stored {
        fn read(
            &self,
            _conn: &ConnectionInfo,
            offset: usize,
            out: &mut [u8],
        ) -> Result<usize, AttErrorCode> {
            read_slice(&self.0.borrow(), offset, out)
        }

        fn write(&self, _conn: &ConnectionInfo, offset: usize, data: &[u8]) -> Result<(), AttErrorCode> {
            let mut value = self.0.borrow_mut();
            if offset > value.len() {
                return Err(AttErrorCode::InvalidOffset);
            }
            value.truncate(offset);
            value.extend_from_slice(data);
            Ok(())
        }
    }

    /// Two services: battery (1-5) with a notifying level, device info (6-9)
    fn register<'d>(stack: &Stack<'d>, level: &'d Stored, name: &'d Stored) {
        stack
            .gatt_register(&[
                Attribute::primary_service(Uuid::Uuid16(0x180F)),
                Attribute::characteristic(
                    Uuid::Uuid16(0x2A19),
                    properties::READ | properties::NOTIFY | properties::INDICATE,
                ),
                Attribute::value(Uuid::Uuid16(0x2A19), Permissions::READ, level),
                Attribute::ccc(None),
                Attribute::user_description("level"),
            ])
            .unwrap();
        stack
            .gatt_register(&[
                Attribute::primary_service(Uuid::Uuid16(0x180A)),
                Attribute::characteristic(
                    Uuid::Uuid16(0x2A29),
                    properties::READ | properties::WRITE,
                ),
                Attribute::value(
                    Uuid::Uuid16(0x2A29),
                    Permissions::READ | Permissions::WRITE,
                    name,
                ),
                Attribute::characteristic(Uuid::Uuid16(0x2A24), properties::READ),
            ])
            .unwrap();
    }

    #[test]
    fn test_primary_service_discovery_is_served() {
        let level = Stored::with(&[90]);
        let name = Stored::with(b"wren");
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();
        register(&stack, &level, &name);

        run(&stack, &mock, async {
            connect_peer(&stack, &mock, HANDLE, PEER).await;

            deliver_att(&stack, HANDLE, &[0x10, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28]);
            assert_eq!(
                mock.next_att().await,
                [0x11, 6, 0x01, 0x00, 0x05, 0x00, 0x0F, 0x18, 0x06, 0x00, 0x09, 0x00, 0x0A, 0x18]
            );
            deliver_att(&stack, HANDLE, &[0x10, 0x0A, 0x00, 0xFF, 0xFF, 0x00, 0x28]);
            assert_eq!(mock.next_att().await, [0x01, 0x10, 0x0A, 0x00, 0x0A]);

            // by service UUID
            deliver_att(&stack, HANDLE, &[0x06, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28, 0x0A, 0x18]);
            assert_eq!(mock.next_att().await, [0x07, 0x06, 0x00, 0x09, 0x00]);

            // characteristics of the battery service
            deliver_att(&stack, HANDLE, &[0x08, 0x01, 0x00, 0x05, 0x00, 0x03, 0x28]);
            assert_eq!(mock.next_att().await, [0x09, 7, 0x02, 0x00, 0x32, 0x03, 0x00, 0x19, 0x2A]);

            // descriptors of the level
            deliver_att(&stack, HANDLE, &[0x04, 0x04, 0x00, 0x05, 0x00]);
            assert_eq!(
                mock.next_att().await,
                [0x05, 0x01, 0x04, 0x00, 0x02, 0x29, 0x05, 0x00, 0x01, 0x29]
            );

            // start above end
            deliver_att(&stack, HANDLE, &[0x04, 0x05, 0x00, 0x04, 0x00]);
            assert_eq!(mock.next_att().await, [0x01, 0x04, 0x05, 0x00, 0x01]);
            deliver_att(&stack, HANDLE, &[0x10, 0x01, 0x00, 0xFF, 0xFF, 0x03, 0x28]);
            assert_eq!(mock.next_att().await, [0x01, 0x10, 0x01, 0x00, 0x10]);
            mock.assert_idle().await;
        });
    }

    #[test]
    fn test_read_and_read_blob() {
        let long: Vec<u8> = (0..30).collect();
        let level = Stored::with(&[90]);
        let name = Stored::with(&long);
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();
        register(&stack, &level, &name);

        run(&stack, &mock, async {
            connect_peer(&stack, &mock, HANDLE, PEER).await;

            deliver_att(&stack, HANDLE, &[0x0A, 0x08, 0x00]);
            let rsp = mock.next_att().await;
            assert_eq!(rsp[0], 0x0B);
            assert_eq!(rsp[1..], long[..22]);

            deliver_att(&stack, HANDLE, &[0x0C, 0x08, 0x00, 22, 0x00]);
            let rsp = mock.next_att().await;
            assert_eq!(rsp[0], 0x0D);
            assert_eq!(rsp[1..], long[22..]);

            deliver_att(&stack, HANDLE, &[0x0C, 0x08, 0x00, 31, 0x00]);
            assert_eq!(mock.next_att().await, [0x01, 0x0C, 0x08, 0x00, 0x07]);
            deliver_att(&stack, HANDLE, &[0x0A, 0x30, 0x00]);
            assert_eq!(mock.next_att().await, [0x01, 0x0A, 0x30, 0x00, 0x01]);
            // a characteristic declaration
            deliver_att(&stack, HANDLE, &[0x0A, 0x09, 0x00]);
            assert_eq!(mock.next_att().await, [0x0B, 0x02, 0x0A, 0x00, 0x24, 0x2A]);
            mock.assert_idle().await;
        });
    }

    #[test]
    fn test_unsupported_and_malformed_requests() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            connect_peer(&stack, &mock, HANDLE, PEER).await;

            // Read Multiple is not served
            deliver_att(&stack, HANDLE, &[0x0E, 0x01, 0x00, 0x02, 0x00]);
            assert_eq!(mock.next_att().await, [0x01, 0x0E, 0x00, 0x00, 0x06]);
            // unknown command: dropped silently
            deliver_att(&stack, HANDLE, &[0x7F, 0x01]);
            mock.assert_idle().await;
            // truncated Read Request
            deliver_att(&stack, HANDLE, &[0x0A, 0x01]);
            assert_eq!(mock.next_att().await, [0x01, 0x0A, 0x00, 0x00, 0x04]);
            // a response nothing waits for
            deliver_att(&stack, HANDLE, &[0x0B]);
            mock.assert_idle().await;
        });
    }

    #[test]
    fn test_exchange_mtu() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default().with_att_mtu(65));
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let id = connect_peer(&stack, &mock, HANDLE, PEER).await;

            deliver_att(&stack, HANDLE, &[0x02, 100, 0x00]);
            assert_eq!(mock.next_att().await, [0x03, 65, 0x00]);
            assert_eq!(stack.conn_info(id).unwrap().att_mtu, 65);

            deliver_att(&stack, HANDLE, &[0x02, 10, 0x00]);
            assert_eq!(mock.next_att().await, [0x03, 65, 0x00]);
            assert_eq!(stack.conn_info(id).unwrap().att_mtu, 23);
        });
    }

    #[test]
    fn test_writes_and_notifications() {
        let level = Stored::with(&[90]);
        let name = Stored::with(b"wren");
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();
        register(&stack, &level, &name);

        run(&stack, &mock, async {
            let id = connect_peer(&stack, &mock, HANDLE, PEER).await;
            let conn = stack.connection(id).unwrap();

            // not enabled yet: nothing sent
            stack.gatt_notify(&conn, 3, &[80]).await.unwrap();
            mock.assert_idle().await;
            assert_eq!(stack.gatt_notify(&conn, 8, &[1]).await, Err(Error::InvalidParameter));
            assert_eq!(stack.gatt_notify(&conn, 2, &[1]).await, Err(Error::NotFound));

            deliver_att(&stack, HANDLE, &[0x12, 0x04, 0x00, 0x01, 0x00]);
            assert_eq!(mock.next_att().await, [0x13]);
            stack.gatt_notify(&conn, 3, &[80]).await.unwrap();
            assert_eq!(mock.next_att().await, [0x1B, 0x03, 0x00, 80]);
            assert_eq!(
                stack.gatt_notify(&conn, 3, &[0; 21]).await,
                Err(Error::MessageTooLong)
            );

            deliver_att(&stack, HANDLE, &[0x12, 0x08, 0x00, b'k', b'i', b't', b'e']);
            assert_eq!(mock.next_att().await, [0x13]);
            assert_eq!(*name.0.borrow(), b"kite");
            // write command without a response, and a rejected one
            deliver_att(&stack, HANDLE, &[0x52, 0x08, 0x00, b'o', b'w', b'l']);
            deliver_att(&stack, HANDLE, &[0x52, 0x03, 0x00, 0x00]);
            mock.assert_idle().await;
            assert_eq!(*name.0.borrow(), b"owl");
            deliver_att(&stack, HANDLE, &[0x12, 0x03, 0x00, 0x00]);
            assert_eq!(mock.next_att().await, [0x01, 0x12, 0x03, 0x00, 0x03]);
        });
    }

    #[test]
    fn test_prepared_writes() {
        let level = Stored::with(&[90]);
        let name = Stored::default();
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();
        register(&stack, &level, &name);

        run(&stack, &mock, async {
            connect_peer(&stack, &mock, HANDLE, PEER).await;

            deliver_att(&stack, HANDLE, &[0x16, 0x08, 0x00, 0x00, 0x00, b'b', b'l', b'u', b'e']);
            assert_eq!(
                mock.next_att().await,
                [0x17, 0x08, 0x00, 0x00, 0x00, b'b', b'l', b'u', b'e']
            );
            deliver_att(&stack, HANDLE, &[0x16, 0x08, 0x00, 0x04, 0x00, b'w', b'r', b'e', b'n']);
            assert_eq!(mock.next_att().await[..5], [0x17, 0x08, 0x00, 0x04, 0x00]);
            assert!(name.0.borrow().is_empty());

            deliver_att(&stack, HANDLE, &[0x18, 0x01]);
            assert_eq!(mock.next_att().await, [0x19]);
            assert_eq!(*name.0.borrow(), b"bluewren");

            // cancelled queue is dropped
            deliver_att(&stack, HANDLE, &[0x16, 0x08, 0x00, 0x00, 0x00, b'x']);
            mock.next_att().await;
            deliver_att(&stack, HANDLE, &[0x18, 0x00]);
            assert_eq!(mock.next_att().await, [0x19]);
            assert_eq!(*name.0.borrow(), b"bluewren");

            // not writable
            deliver_att(&stack, HANDLE, &[0x16, 0x03, 0x00, 0x00, 0x00, 0x01]);
            assert_eq!(mock.next_att().await, [0x01, 0x16, 0x03, 0x00, 0x03]);
            deliver_att(&stack, HANDLE, &[0x18, 0x05]);
            assert_eq!(mock.next_att().await, [0x01, 0x18, 0x00, 0x00, 0x04]);
            mock.assert_idle().await;
        });
    }

    #[test]
    fn test_prepare_queue_full() {
        let level = Stored::with(&[90]);
        let name = Stored::default();
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();
        register(&stack, &level, &name);

        run(&stack, &mock, async {
            connect_peer(&stack, &mock, HANDLE, PEER).await;
            for _ in 0..MAX_PREPARED_WRITES {
                deliver_att(&stack, HANDLE, &[0x16, 0x08, 0x00, 0x00, 0x00, 0x01]);
                assert_eq!(mock.next_att().await[0], 0x17);
            }
            // every controller buffer went to a response
            stack
                .deliver_bytes(PacketKind::Event, &num_completed(HANDLE, 8))
                .unwrap();
            deliver_att(&stack, HANDLE, &[0x16, 0x08, 0x00, 0x00, 0x00, 0x01]);
            assert_eq!(mock.next_att().await, [0x01, 0x16, 0x08, 0x00, 0x09]);
        });
    }

    #[test]
    fn test_indication_waits_for_confirmation() {
        let level = Stored::with(&[90]);
        let name = Stored::default();
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();
        register(&stack, &level, &name);

        run(&stack, &mock, async {
            let id = connect_peer(&stack, &mock, HANDLE, PEER).await;
            let conn = stack.connection(id).unwrap();
            assert_eq!(stack.gatt_indicate(&conn, 3, &[1]).await, Err(Error::InvalidState));

            deliver_att(&stack, HANDLE, &[0x12, 0x04, 0x00, 0x02, 0x00]);
            assert_eq!(mock.next_att().await, [0x13]);

            let (first, ()) = join(stack.gatt_indicate(&conn, 3, &[70]), async {
                assert_eq!(mock.next_att().await, [0x1D, 0x03, 0x00, 70]);
                assert_eq!(stack.gatt_indicate(&conn, 3, &[71]).await, Err(Error::Busy));
                deliver_att(&stack, HANDLE, &[0x1E]);
            })
            .await;
            assert_eq!(first, Ok(()));

            let (second, ()) = join(stack.gatt_indicate(&conn, 3, &[60]), async {
                mock.next_att().await;
                stack
                    .deliver_bytes(PacketKind::Event, &disconnection_complete(HANDLE, 0x13))
                    .unwrap();
            })
            .await;
            assert_eq!(second, Err(Error::Disconnected));
        });
    }
}
