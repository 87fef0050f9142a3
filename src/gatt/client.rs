//! GATT client procedures
//!
//! Every procedure claims the connection's client slot for its whole run,
//! so requests of two procedures never interleave on one link.

use heapless::Vec;

use super::{ClientSlot, ClientState, Gatt, Response};
use crate::att::{AttErrorCode, AttPdu, EXECUTE_CANCEL, EXECUTE_WRITE, Uuid};
use crate::codec::Reader;
use crate::connection::{ConnId, Connection};
use crate::constants::ATT_DEFAULT_MTU;
use crate::host::Stack;
use crate::{Error, IterAction};

/// What [`Stack::gatt_discover`] looks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscoverKind {
    /// Primary services, optionally only those with a given UUID
    Primary,
    /// Include declarations
    Included,
    /// Characteristic declarations, optionally filtered by value UUID
    Characteristic,
    /// Every attribute in the range with its type
    Descriptor,
}

/// Discovery request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DiscoverParams {
    /// What to look for
    pub kind: DiscoverKind,
    /// Filter for `Primary` and `Characteristic`
    pub uuid: Option<Uuid>,
    /// First handle searched
    pub start: u16,
    /// Last handle searched
    pub end: u16,
}

impl DiscoverParams {
    /// Discover over the whole handle range
    #[must_use]
    pub const fn new(kind: DiscoverKind) -> Self {
        Self {
            kind,
            uuid: None,
            start: 0x0001,
            end: 0xFFFF,
        }
    }

    /// Only report results with `uuid`
    #[must_use]
    pub const fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    /// Search `start..=end` only
    #[must_use]
    pub const fn with_range(mut self, start: u16, end: u16) -> Self {
        self.start = start;
        self.end = end;
        self
    }
}

/// One discovery result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Discovered {
    /// Primary service spanning `handle..=end`
    Service { handle: u16, end: u16, uuid: Uuid },
    /// Include declaration at `handle` naming the service `start..=end`;
    /// `uuid` is only reported for 16-bit service UUIDs
    Include {
        handle: u16,
        start: u16,
        end: u16,
        uuid: Option<Uuid>,
    },
    /// Characteristic declaration at `handle`
    Characteristic {
        handle: u16,
        properties: u8,
        value_handle: u16,
        uuid: Uuid,
    },
    /// Any attribute with its type
    Descriptor { handle: u16, uuid: Uuid },
}

/// Claim on a connection's client slot, released on drop
struct ClientOp<'a>(&'a ClientSlot);

impl<'a> ClientOp<'a> {
    fn claim(slot: &'a ClientSlot) -> Result<Self, Error> {
        slot.state.lock(|state| {
            if state.get() != ClientState::Idle {
                return Err(Error::Busy);
            }
            state.set(ClientState::Busy);
            Ok(Self(slot))
        })
    }
}

impl Drop for ClientOp<'_> {
    fn drop(&mut self) {
        self.0.state.lock(|state| state.set(ClientState::Idle));
    }
}

/// How a discovery page ended
enum Page {
    /// Last handle covered by the page
    Done(u16),
    Stopped,
}

impl Gatt<'_> {
    /// Hand a response PDU to the request waiting on `conn`
    pub(crate) fn client_response(&self, conn: ConnId, rsp: &AttPdu<'_>, raw: &[u8]) {
        let slot = self.client(conn);
        let request = match slot.state.lock(|state| state.get()) {
            ClientState::Waiting(request) => request,
            _ => {
                warn!("[ATT] unexpected response {:#x} on {:?}", rsp.opcode(), conn);
                return;
            }
        };
        let matches = match *rsp {
            AttPdu::ErrorRsp { request: failed, .. } => failed == request,
            _ => rsp.opcode() == request.wrapping_add(1),
        };
        if !matches {
            warn!("[ATT] response {:#x} does not answer {:#x}", rsp.opcode(), request);
            return;
        }
        slot.state.lock(|state| state.set(ClientState::Busy));
        slot.response
            .signal(Vec::from_slice(raw).map_err(|()| Error::MessageTooLong));
    }

    /// Fail the request in flight on `conn`
    pub(crate) fn abort_client(&self, conn: ConnId, error: Error) {
        let slot = self.client(conn);
        let waiting = slot.state.lock(|state| {
            let waiting = matches!(state.get(), ClientState::Waiting(_));
            if waiting {
                state.set(ClientState::Busy);
            }
            waiting
        });
        if waiting {
            slot.response.signal(Err(error));
        }
    }
}

fn entry_len(len: u8, short: usize, long: usize) -> Result<usize, Error> {
    let len = usize::from(len);
    if len == short || len == long {
        Ok(len)
    } else {
        Err(Error::InvalidPacket)
    }
}

impl Stack<'_> {
    /// Send `request` and wait for its response; the caller holds the slot
    async fn att_request(&self, id: ConnId, request: &AttPdu<'_>) -> Response {
        let slot = self.gatt.client(id);
        slot.response.reset();
        slot.state
            .lock(|state| state.set(ClientState::Waiting(request.opcode())));
        if let Err(e) = self.att_send(id, request).await {
            slot.state.lock(|state| state.set(ClientState::Busy));
            return Err(e);
        }

        let rsp = slot.response.wait().await?;
        if let Ok(AttPdu::ErrorRsp { handle, code, .. }) = AttPdu::decode(&rsp) {
            debug!("[GATT] request {:#x} failed at {:#x}: {:?}", request.opcode(), handle, code);
            return Err(Error::Att(code));
        }
        Ok(rsp)
    }

    fn att_mtu(&self, id: ConnId) -> usize {
        usize::from(self.conn_info(id).map_or(ATT_DEFAULT_MTU, |info| info.att_mtu))
    }

    /// Negotiate the ATT MTU with the peer's server
    ///
    /// Offers [`Config::att_mtu`](crate::Config::att_mtu) and returns the
    /// MTU now in use on the link.
    ///
    /// # Errors
    /// * `Error::Busy` while another client procedure runs on the link
    /// * `Error::Att` if the server refuses
    /// * `Error::Disconnected` if the link drops
    pub async fn gatt_exchange_mtu(&self, conn: &Connection<'_>) -> Result<u16, Error> {
        let id = conn.id();
        let _op = ClientOp::claim(self.gatt.client(id))?;
        let ours = self.config.att_mtu;
        let rsp = self
            .att_request(id, &AttPdu::ExchangeMtuReq { mtu: ours })
            .await?;
        let AttPdu::ExchangeMtuRsp { mtu: server } = AttPdu::decode(&rsp)? else {
            return Err(Error::InvalidPacket);
        };
        let mtu = server.min(ours).max(ATT_DEFAULT_MTU);
        self.connections.update(id, |info| info.att_mtu = mtu);
        debug!("[GATT] MTU {} on {:?}", mtu, id);
        Ok(mtu)
    }

    /// Discover services, includes, characteristics or descriptors
    ///
    /// `f` gets every result in handle order and then `None` once the range
    /// is exhausted or the procedure fails. Returning
    /// [`IterAction::Stop`] ends the procedure at once, without the final
    /// `None`.
    ///
    /// # Errors
    /// * `Error::InvalidParameter` for an empty or zero-based range
    /// * `Error::Busy` while another client procedure runs on the link
    /// * `Error::Att` for a server error other than Attribute Not Found
    /// * `Error::InvalidPacket` for a malformed response
    pub async fn gatt_discover(
        &self,
        conn: &Connection<'_>,
        params: &DiscoverParams,
        mut f: impl FnMut(Option<Discovered>) -> IterAction,
    ) -> Result<(), Error> {
        if params.start == 0 || params.start > params.end {
            return Err(Error::InvalidParameter);
        }
        let id = conn.id();
        let _op = ClientOp::claim(self.gatt.client(id))?;

        let mut start = params.start;
        loop {
            let page = match self.discover_page(id, params, start, &mut f).await {
                Ok(Page::Stopped) => return Ok(()),
                Ok(Page::Done(last)) if last < start => Err(Error::InvalidPacket),
                other => other,
            };
            match page {
                Ok(Page::Done(last)) if last < params.end => start = last + 1,
                Ok(_) | Err(Error::Att(AttErrorCode::AttributeNotFound)) => {
                    f(None);
                    return Ok(());
                }
                Err(e) => {
                    f(None);
                    return Err(e);
                }
            }
        }
    }

    async fn discover_page(
        &self,
        id: ConnId,
        params: &DiscoverParams,
        start: u16,
        f: &mut impl FnMut(Option<Discovered>) -> IterAction,
    ) -> Result<Page, Error> {
        let end = params.end;
        let mut last = start;
        match (params.kind, params.uuid) {
            (DiscoverKind::Primary, None) => {
                let request = AttPdu::ReadByGroupTypeReq {
                    start,
                    end,
                    group_type: Uuid::PRIMARY_SERVICE,
                };
                let rsp = self.att_request(id, &request).await?;
                let AttPdu::ReadByGroupTypeRsp { len, data } = AttPdu::decode(&rsp)? else {
                    return Err(Error::InvalidPacket);
                };
                for entry in data.chunks_exact(entry_len(len, 6, 20)?) {
                    let mut r = Reader::new(entry);
                    let handle = r.le16()?;
                    let group_end = r.le16()?;
                    let uuid = Uuid::from_bytes(r.rest())?;
                    last = group_end;
                    let found = Discovered::Service {
                        handle,
                        end: group_end,
                        uuid,
                    };
                    if f(Some(found)) == IterAction::Stop {
                        return Ok(Page::Stopped);
                    }
                }
            }
            (DiscoverKind::Primary, Some(uuid)) => {
                let value = uuid.to_bytes();
                let request = AttPdu::FindByTypeValueReq {
                    start,
                    end,
                    att_type: 0x2800,
                    value: &value,
                };
                let rsp = self.att_request(id, &request).await?;
                let AttPdu::FindByTypeValueRsp { data } = AttPdu::decode(&rsp)? else {
                    return Err(Error::InvalidPacket);
                };
                for entry in data.chunks_exact(4) {
                    let mut r = Reader::new(entry);
                    let handle = r.le16()?;
                    let group_end = r.le16()?;
                    last = group_end;
                    let found = Discovered::Service {
                        handle,
                        end: group_end,
                        uuid,
                    };
                    if f(Some(found)) == IterAction::Stop {
                        return Ok(Page::Stopped);
                    }
                }
            }
            (DiscoverKind::Included, _) => {
                let request = AttPdu::ReadByTypeReq {
                    start,
                    end,
                    att_type: Uuid::INCLUDE,
                };
                let rsp = self.att_request(id, &request).await?;
                let AttPdu::ReadByTypeRsp { len, data } = AttPdu::decode(&rsp)? else {
                    return Err(Error::InvalidPacket);
                };
                for entry in data.chunks_exact(entry_len(len, 6, 8)?) {
                    let mut r = Reader::new(entry);
                    let handle = r.le16()?;
                    let included_start = r.le16()?;
                    let included_end = r.le16()?;
                    let uuid = if r.is_empty() {
                        None
                    } else {
                        Some(Uuid::Uuid16(r.le16()?))
                    };
                    last = handle;
                    let found = Discovered::Include {
                        handle,
                        start: included_start,
                        end: included_end,
                        uuid,
                    };
                    if f(Some(found)) == IterAction::Stop {
                        return Ok(Page::Stopped);
                    }
                }
            }
            (DiscoverKind::Characteristic, filter) => {
                let request = AttPdu::ReadByTypeReq {
                    start,
                    end,
                    att_type: Uuid::CHARACTERISTIC,
                };
                let rsp = self.att_request(id, &request).await?;
                let AttPdu::ReadByTypeRsp { len, data } = AttPdu::decode(&rsp)? else {
                    return Err(Error::InvalidPacket);
                };
                for entry in data.chunks_exact(entry_len(len, 7, 21)?) {
                    let mut r = Reader::new(entry);
                    let handle = r.le16()?;
                    let properties = r.u8()?;
                    let value_handle = r.le16()?;
                    let uuid = Uuid::from_bytes(r.rest())?;
                    last = handle;
                    if filter.is_some_and(|wanted| wanted != uuid) {
                        continue;
                    }
                    let found = Discovered::Characteristic {
                        handle,
                        properties,
                        value_handle,
                        uuid,
                    };
                    if f(Some(found)) == IterAction::Stop {
                        return Ok(Page::Stopped);
                    }
                }
            }
            (DiscoverKind::Descriptor, _) => {
                let rsp = self
                    .att_request(id, &AttPdu::FindInformationReq { start, end })
                    .await?;
                let AttPdu::FindInformationRsp { format, data } = AttPdu::decode(&rsp)? else {
                    return Err(Error::InvalidPacket);
                };
                let size = if format == 0x01 { 4 } else { 18 };
                for entry in data.chunks_exact(size) {
                    let mut r = Reader::new(entry);
                    let handle = r.le16()?;
                    let uuid = Uuid::from_bytes(r.rest())?;
                    last = handle;
                    if f(Some(Discovered::Descriptor { handle, uuid })) == IterAction::Stop {
                        return Ok(Page::Stopped);
                    }
                }
            }
        }
        Ok(Page::Done(last))
    }

    /// Read an attribute value, following up with Read Blob until the end
    ///
    /// `f` gets the value in chunks as they arrive, starting at `offset`.
    ///
    /// # Errors
    /// * `Error::InvalidParameter` for handle 0
    /// * `Error::Busy` while another client procedure runs on the link
    /// * `Error::Att` if the server refuses the read
    pub async fn gatt_read(
        &self,
        conn: &Connection<'_>,
        handle: u16,
        offset: u16,
        mut f: impl FnMut(&[u8]) -> IterAction,
    ) -> Result<(), Error> {
        if handle == 0 {
            return Err(Error::InvalidParameter);
        }
        let id = conn.id();
        let _op = ClientOp::claim(self.gatt.client(id))?;

        let mut offset = offset;
        loop {
            let request = if offset == 0 {
                AttPdu::ReadReq { handle }
            } else {
                AttPdu::ReadBlobReq { handle, offset }
            };
            let rsp = match self.att_request(id, &request).await {
                Err(Error::Att(AttErrorCode::AttributeNotLong)) if offset > 0 => return Ok(()),
                rsp => rsp?,
            };
            let (AttPdu::ReadRsp { value } | AttPdu::ReadBlobRsp { value }) = AttPdu::decode(&rsp)?
            else {
                return Err(Error::InvalidPacket);
            };
            if f(value) == IterAction::Stop || value.len() < self.att_mtu(id) - 1 {
                return Ok(());
            }
            let read = u16::try_from(value.len()).map_err(|_| Error::InvalidPacket)?;
            offset = offset.checked_add(read).ok_or(Error::InvalidPacket)?;
        }
    }

    /// Write an attribute value and wait for the server's acknowledgement
    ///
    /// Values longer than ATT MTU - 3 go out as a prepared write sequence.
    /// A segment the server echoes back altered cancels the sequence.
    ///
    /// # Errors
    /// * `Error::InvalidParameter` for handle 0
    /// * `Error::MessageTooLong` for values over 65535 bytes
    /// * `Error::Busy` while another client procedure runs on the link
    /// * `Error::Att` if the server refuses a segment or the write
    /// * `Error::InvalidPacket` if a segment comes back altered
    pub async fn gatt_write(
        &self,
        conn: &Connection<'_>,
        handle: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        if handle == 0 {
            return Err(Error::InvalidParameter);
        }
        if data.len() > usize::from(u16::MAX) {
            return Err(Error::MessageTooLong);
        }
        let id = conn.id();
        let _op = ClientOp::claim(self.gatt.client(id))?;

        let mtu = self.att_mtu(id);
        if data.len() <= mtu - 3 {
            let rsp = self
                .att_request(id, &AttPdu::WriteReq { handle, value: data })
                .await?;
            return match AttPdu::decode(&rsp)? {
                AttPdu::WriteRsp => Ok(()),
                _ => Err(Error::InvalidPacket),
            };
        }

        let mut offset = 0u16;
        for segment in data.chunks(mtu - 5) {
            let request = AttPdu::PrepareWriteReq {
                handle,
                offset,
                value: segment,
            };
            let echoed = match self.att_request(id, &request).await {
                Ok(rsp) => AttPdu::decode(&rsp).is_ok_and(|echo| {
                    echo == AttPdu::PrepareWriteRsp {
                        handle,
                        offset,
                        value: segment,
                    }
                }),
                Err(e @ (Error::Disconnected | Error::NotConnected)) => return Err(e),
                Err(e) => {
                    self.cancel_prepared(id).await;
                    return Err(e);
                }
            };
            if !echoed {
                warn!("[GATT] prepared segment at {} came back altered", offset);
                self.cancel_prepared(id).await;
                return Err(Error::InvalidPacket);
            }
            // bounded by the length check above
            #[allow(clippy::cast_possible_truncation)]
            let advance = segment.len() as u16;
            offset = offset.wrapping_add(advance);
        }

        let rsp = self
            .att_request(id, &AttPdu::ExecuteWriteReq { flags: EXECUTE_WRITE })
            .await?;
        match AttPdu::decode(&rsp)? {
            AttPdu::ExecuteWriteRsp => Ok(()),
            _ => Err(Error::InvalidPacket),
        }
    }

    async fn cancel_prepared(&self, id: ConnId) {
        let cancel = AttPdu::ExecuteWriteReq {
            flags: EXECUTE_CANCEL,
        };
        if let Err(e) = self.att_request(id, &cancel).await {
            debug!("[GATT] cancelling prepared writes failed: {:?}", e);
        }
    }

    /// Send a Write Command; nothing acknowledges it
    ///
    /// Does not claim the client slot, so it may run alongside another
    /// procedure.
    ///
    /// # Errors
    /// * `Error::MessageTooLong` if `data` exceeds ATT MTU - 3
    /// * `Error::NotConnected` if the link is down
    pub async fn gatt_write_without_response(
        &self,
        conn: &Connection<'_>,
        handle: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        if handle == 0 {
            return Err(Error::InvalidParameter);
        }
        self.att_send(conn.id(), &AttPdu::WriteCmd { handle, value: data })
            .await
    }
}
