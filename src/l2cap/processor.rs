//! L2CAP Frame and Signaling Processing
//!
//! Routes reassembled frames to their channel, answers signaling commands
//! and runs LE credit based flow control in both directions. Callbacks into
//! channel handlers are made with the channel table unlocked.

use core::cmp::Ordering;
use core::future::poll_fn;
use core::task::Poll;

use heapless::Vec;

use super::channel::{ChannelState, Endpoint, L2capChannel, Owner};
use super::packet::{ChannelId, L2capHeader, ProtocolServiceMultiplexer, cid};
use super::signaling::{
    CommandReject, DisconnectionRequest, DisconnectionResponse, FlowControlCredit,
    LeCreditConnRequest, LeCreditConnResponse, SignalingCommand, SignalingHeader, conn_param,
    reject,
};
use super::{Channel, ChannelHandler, FixedChannel, LeConnResult, Server};
use crate::buffer::{Buf, BufKind};
use crate::connection::{ConnId, ConnectionInfo, ConnectionState, LinkKind, Role};
use crate::constants::{
    L2CAP_HEADER_SIZE, L2CAP_LE_DYN_CID_END, L2CAP_LE_DYN_CID_START, L2CAP_LE_MIN_MTU,
    L2CAP_LE_PSM_END, L2CAP_LE_PSM_START, L2CAP_SDU_HEADER_SIZE, MAX_FIXED_CHANNELS,
    MAX_L2CAP_CHANNELS,
};
use crate::host::{InternalCommand, Stack};
use crate::{ConnParams, Error};

/// What one inbound PDU did to a credit based channel
enum Reassembly<'d> {
    /// Channel gone or not open
    Ignored,
    /// Protocol violation by the peer; the channel has to be closed
    Violation,
    Progress {
        complete: Option<(&'d dyn ChannelHandler, Buf<'d>)>,
        grant: Option<(ChannelId, u16)>,
    },
}

/// Removes a channel whose connection request was abandoned
struct PendingConnect<'s, 'd> {
    stack: &'s Stack<'d>,
    chan: Channel,
    armed: bool,
}

impl Drop for PendingConnect<'_, '_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Channel { conn, cid } = self.chan;
        self.stack.l2cap.channels.lock(|c| {
            let mut c = c.borrow_mut();
            if c.get(conn, cid).is_some_and(|ch| ch.state != ChannelState::Open) {
                c.remove(conn, cid);
            }
        });
    }
}

/// Clears the `sending` flag of a channel
struct SendGuard<'s, 'd> {
    stack: &'s Stack<'d>,
    chan: Channel,
}

impl Drop for SendGuard<'_, '_> {
    fn drop(&mut self) {
        let Channel { conn, cid } = self.chan;
        self.stack.l2cap.channels.lock(|c| {
            if let Some(ch) = c.borrow_mut().get_mut(conn, cid) {
                ch.sending = false;
            }
        });
    }
}

impl<'d> Stack<'d> {
    /// Register `handler` as the server for LE credit based channels on `psm`
    ///
    /// # Errors
    /// * `Error::InvalidParameter` if `psm` is outside the LE range
    /// * `Error::Already` if the PSM has a server
    /// * `Error::NoResources` if the server table is full
    pub fn register_l2cap_server(
        &self,
        psm: ProtocolServiceMultiplexer,
        handler: &'d dyn ChannelHandler,
    ) -> Result<(), Error> {
        if !(L2CAP_LE_PSM_START..=L2CAP_LE_PSM_END).contains(&psm) {
            return Err(Error::InvalidParameter);
        }
        self.l2cap.servers.lock(|s| {
            let mut s = s.borrow_mut();
            if s.iter().any(|server| server.psm == psm) {
                return Err(Error::Already);
            }
            s.push(Server { psm, handler })
                .map_err(|_| Error::NoResources)?;
            debug!("[L2CAP] server registered on PSM {:#x}", psm);
            Ok(())
        })
    }

    /// Bind `handler` to a fixed channel on every future `kind` link
    ///
    /// # Errors
    /// * `Error::InvalidParameter` for the reserved, signaling and ATT
    ///   channels and for dynamic CIDs
    /// * `Error::Already` if the CID is taken
    /// * `Error::NoResources` if the fixed channel table is full
    pub fn register_fixed_channel(
        &self,
        kind: LinkKind,
        channel_id: ChannelId,
        handler: &'d dyn ChannelHandler,
    ) -> Result<(), Error> {
        let reserved = matches!(
            channel_id,
            cid::NULL | cid::SIGNALING | cid::ATT | cid::LE_SIGNALING
        );
        if reserved || channel_id >= L2CAP_LE_DYN_CID_START {
            return Err(Error::InvalidParameter);
        }
        self.l2cap.fixed.lock(|f| {
            let mut f = f.borrow_mut();
            if f.iter().any(|fixed| fixed.kind == kind && fixed.cid == channel_id) {
                return Err(Error::Already);
            }
            f.push(FixedChannel {
                kind,
                cid: channel_id,
                handler,
            })
            .map_err(|_| Error::NoResources)
        })
    }

    /// Open an LE credit based channel to `psm` on the peer
    ///
    /// Waits for the peer's response. Dropping the future before the
    /// response arrives frees the local CID.
    ///
    /// # Errors
    /// * `Error::InvalidParameter` if `psm` is outside the LE range
    /// * `Error::NotConnected` / `Error::NotSupported` for a missing or
    ///   BR/EDR link
    /// * `Error::NoResources` if no CID is free or the SDU buffers are too
    ///   small for a channel
    /// * `Error::L2cap` with the peer's result if it refused
    /// * `Error::Disconnected` if the link or the request went away
    pub async fn l2cap_connect(
        &self,
        conn: ConnId,
        psm: ProtocolServiceMultiplexer,
        handler: &'d dyn ChannelHandler,
    ) -> Result<Channel, Error> {
        if !(L2CAP_LE_PSM_START..=L2CAP_LE_PSM_END).contains(&psm) {
            return Err(Error::InvalidParameter);
        }
        let info = self.conn_info(conn).ok_or(Error::NotConnected)?;
        if info.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        if info.kind != LinkKind::Le {
            return Err(Error::NotSupported);
        }
        let local = self.local_endpoint();
        if local.mps < L2CAP_LE_MIN_MTU {
            return Err(Error::NoResources);
        }

        let ident = self.l2cap.next_ident(conn);
        let cid = self.l2cap.channels.lock(|c| {
            let mut c = c.borrow_mut();
            let cid = c.allocate_cid(conn, LinkKind::Le)?;
            let rx = Endpoint { cid, ..local };
            c.insert(
                conn,
                L2capChannel::dynamic(
                    handler,
                    psm,
                    ChannelState::WaitConnectRsp(ident),
                    rx,
                    Endpoint::default(),
                ),
            )?;
            Ok::<_, Error>(cid)
        })?;
        let chan = Channel { conn, cid };
        let mut pending = PendingConnect {
            stack: self,
            chan,
            armed: true,
        };

        debug!("[L2CAP] connecting PSM {:#x} from CID {:#x}", psm, cid);
        let request = LeCreditConnRequest {
            psm,
            source_cid: cid,
            mtu: local.mtu,
            mps: local.mps,
            initial_credits: local.credits,
        };
        self.signal(conn, ident, &SignalingCommand::LeCreditConnRequest(request))
            .await?;

        let state = poll_fn(|cx| {
            self.l2cap.channels.lock(|c| {
                let mut c = c.borrow_mut();
                match c.get_mut(conn, cid) {
                    Some(ch) if matches!(ch.state, ChannelState::WaitConnectRsp(_)) => {
                        ch.register(cx);
                        Poll::Pending
                    }
                    Some(ch) => Poll::Ready(Some(ch.state)),
                    None => Poll::Ready(None),
                }
            })
        })
        .await;

        match state {
            Some(ChannelState::Open) => {
                pending.armed = false;
                Ok(chan)
            }
            Some(ChannelState::Refused(result)) => Err(Error::L2cap(result)),
            _ => Err(Error::Disconnected),
        }
    }

    /// Send one SDU on `chan`
    ///
    /// Credit based channels segment the SDU to the peer's MPS and wait for
    /// a credit before every PDU. Fixed channels carry the SDU as a single
    /// frame.
    ///
    /// # Errors
    /// * `Error::NotFound` if the channel does not exist
    /// * `Error::MessageTooLong` if the SDU exceeds the peer's MTU
    /// * `Error::Busy` if another SDU is being sent on the channel
    /// * `Error::Disconnected` if the channel closed while waiting for credits
    pub async fn l2cap_send(&self, chan: Channel, sdu: &[u8]) -> Result<(), Error> {
        let owner = self
            .l2cap
            .channels
            .lock(|c| c.borrow().get(chan.conn, chan.cid).map(|ch| ch.owner))
            .ok_or(Error::NotFound)?;
        match owner {
            Owner::Fixed(_) => self.send_acl_pdu(chan.conn, chan.cid, &[sdu]).await,
            Owner::Dynamic(_) => self.send_sdu(chan, sdu).await,
            Owner::Signaling | Owner::Att => Err(Error::InvalidParameter),
        }
    }

    /// Ask the peer to close a credit based channel
    ///
    /// The channel stops carrying data at once; its handler hears about the
    /// close when the peer answers or the link drops.
    ///
    /// # Errors
    /// * `Error::NotFound` for unknown or fixed channels
    /// * `Error::Already` if a disconnection is already pending
    /// * `Error::InvalidState` while the channel is still connecting
    pub async fn l2cap_disconnect(&self, chan: Channel) -> Result<(), Error> {
        self.disconnect_channel(chan.conn, chan.cid).await
    }

    /// Propose new connection parameters to the central
    pub(crate) async fn l2cap_conn_param_request(
        &self,
        id: ConnId,
        params: &ConnParams,
    ) -> Result<(), Error> {
        let ident = self.l2cap.next_ident(id);
        self.signal(id, ident, &SignalingCommand::ConnParamUpdateRequest(*params))
            .await
    }

    /// Bind the fixed channels of a link that just came up
    pub(crate) fn l2cap_connected(&self, id: ConnId) {
        let Some(info) = self.conn_info(id) else {
            return;
        };
        self.l2cap.reset_ident(id);

        let mut accepted: Vec<FixedChannel<'d>, MAX_FIXED_CHANNELS> = Vec::new();
        for fixed in self.l2cap.fixed_for(info.kind) {
            if fixed.handler.accept(&info) {
                let _ = accepted.push(fixed);
            }
        }

        let bound = self.l2cap.channels.lock(|c| {
            let mut c = c.borrow_mut();
            let mut result = match info.kind {
                LinkKind::Le => c
                    .insert(id, L2capChannel::fixed(cid::LE_SIGNALING, Owner::Signaling))
                    .and_then(|()| c.insert(id, L2capChannel::fixed(cid::ATT, Owner::Att))),
                LinkKind::BrEdr => {
                    c.insert(id, L2capChannel::fixed(cid::SIGNALING, Owner::Signaling))
                }
            };
            for fixed in &accepted {
                result = result.and_then(|()| {
                    c.insert(id, L2capChannel::fixed(fixed.cid, Owner::Fixed(fixed.handler)))
                });
            }
            result
        });
        if bound.is_err() {
            error!("[L2CAP] channel table full, link {:?} has no channels", id);
            return;
        }

        for fixed in accepted {
            fixed.handler.connected(Channel { conn: id, cid: fixed.cid });
        }
    }

    /// Drop every channel of a link that went down
    pub(crate) fn l2cap_disconnected(&self, id: ConnId) {
        let closed = self.l2cap.channels.lock(|c| {
            let mut c = c.borrow_mut();
            let mut closed: Vec<(ChannelId, &'d dyn ChannelHandler), MAX_L2CAP_CHANNELS> =
                Vec::new();
            for cid in c.cids(id) {
                let Some(ch) = c.remove(id, cid) else {
                    continue;
                };
                let was_open = matches!(ch.state, ChannelState::Open | ChannelState::WaitDisconnect);
                if let (true, Some(handler)) = (was_open, ch.handler()) {
                    let _ = closed.push((cid, handler));
                }
            }
            closed
        });

        for (cid, handler) in closed {
            handler.disconnected(Channel { conn: id, cid });
        }
    }

    /// Process one complete L2CAP frame received on `id`
    pub(crate) async fn l2cap_recv(&self, id: ConnId, mut pdu: Buf<'d>) {
        let header = match L2capHeader::from_frame(pdu.data()) {
            Ok(header) => header,
            Err(e) => {
                warn!("[L2CAP] dropping frame: {:?}", e);
                return;
            }
        };
        if pdu.pull(L2capHeader::SIZE).is_err() {
            return;
        }

        let owner = self
            .l2cap
            .channels
            .lock(|c| c.borrow().get(id, header.channel_id).map(|ch| ch.owner));
        match owner {
            Some(Owner::Signaling) => self.signaling_recv(id, pdu.data()).await,
            Some(Owner::Att) => self.att_recv(id, pdu.data()).await,
            Some(Owner::Fixed(handler)) => handler.received(
                Channel {
                    conn: id,
                    cid: header.channel_id,
                },
                pdu.data(),
            ),
            Some(Owner::Dynamic(_)) => self.le_credit_recv(id, header.channel_id, pdu).await,
            None => warn!(
                "[L2CAP] frame for unknown CID {:#x} on {:?}",
                header.channel_id,
                id
            ),
        }
    }

    async fn signaling_recv(&self, id: ConnId, data: &[u8]) {
        let Some(info) = self.conn_info(id) else {
            return;
        };
        let Ok(header) = SignalingHeader::from_bytes(data) else {
            warn!("[L2CAP] short signaling PDU");
            return;
        };
        let payload = &data[SignalingHeader::SIZE..];
        if payload.len() != usize::from(header.length) {
            warn!("[L2CAP] signaling length mismatch");
            return;
        }
        if header.identifier == 0 {
            warn!("[L2CAP] signaling identifier 0 dropped");
            return;
        }

        let ident = header.identifier;
        let command = match SignalingCommand::parse(&header, payload) {
            Ok(command) if info.kind == LinkKind::Le => command,
            Ok(SignalingCommand::CommandReject(_)) => return,
            Ok(_) | Err(_) => {
                debug!("[L2CAP] rejecting signaling code {:#x}", header.code);
                let _ = self.reject(id, ident, reject::NOT_UNDERSTOOD, None).await;
                return;
            }
        };
        trace!("[L2CAP] {:?} ident {} on {:?}", command.code(), ident, id);

        match command {
            SignalingCommand::CommandReject(rej) => self.command_rejected(id, ident, rej),
            SignalingCommand::DisconnectionRequest(req) => {
                self.disconnection_requested(id, ident, req).await;
            }
            SignalingCommand::DisconnectionResponse(rsp) => self.disconnection_responded(id, rsp),
            SignalingCommand::ConnParamUpdateRequest(params) => {
                self.conn_param_requested(id, &info, ident, params).await;
            }
            SignalingCommand::ConnParamUpdateResponse { result } => {
                debug!("[L2CAP] connection parameter update result {}", result);
            }
            SignalingCommand::LeCreditConnRequest(req) => {
                self.le_conn_requested(id, &info, ident, req).await;
            }
            SignalingCommand::LeCreditConnResponse(rsp) => self.le_conn_responded(id, ident, rsp),
            SignalingCommand::FlowControlCredit(fc) => self.credits_received(id, fc).await,
        }
    }

    async fn signal(&self, id: ConnId, ident: u8, command: &SignalingCommand) -> Result<(), Error> {
        let kind = self.conn_info(id).ok_or(Error::NotConnected)?.kind;
        let channel_id = match kind {
            LinkKind::Le => cid::LE_SIGNALING,
            LinkKind::BrEdr => cid::SIGNALING,
        };
        let pdu = command.encode(ident);
        let result = self.send_acl_pdu(id, channel_id, &[&pdu]).await;
        if let Err(e) = result {
            warn!("[L2CAP] {:?} not sent: {:?}", command.code(), e);
        }
        result
    }

    async fn reject(
        &self,
        id: ConnId,
        ident: u8,
        reason: u16,
        cids: Option<(ChannelId, ChannelId)>,
    ) -> Result<(), Error> {
        self.signal(
            id,
            ident,
            &SignalingCommand::CommandReject(CommandReject { reason, cids }),
        )
        .await
    }

    /// Receive endpoint offered for new channels, sized to the SDU buffers
    fn local_endpoint(&self) -> Endpoint {
        let slot = self.pools.sdu.slot_size();
        Endpoint {
            cid: 0,
            mtu: u16::try_from(slot).unwrap_or(u16::MAX),
            mps: u16::try_from(slot.saturating_sub(L2CAP_HEADER_SIZE)).unwrap_or(u16::MAX),
            credits: self.config.l2cap_initial_credits,
        }
    }

    async fn le_conn_requested(
        &self,
        id: ConnId,
        info: &ConnectionInfo,
        ident: u8,
        req: LeCreditConnRequest,
    ) {
        let response = match self.accept_le_channel(id, info, &req) {
            Ok((rx, handler)) => {
                let chan = Channel { conn: id, cid: rx.cid };
                debug!("[L2CAP] PSM {:#x} accepted on CID {:#x}", req.psm, rx.cid);
                let response = LeCreditConnResponse {
                    destination_cid: rx.cid,
                    mtu: rx.mtu,
                    mps: rx.mps,
                    initial_credits: rx.credits,
                    result: LeConnResult::Success as u16,
                };
                let sent = self
                    .signal(id, ident, &SignalingCommand::LeCreditConnResponse(response))
                    .await;
                if sent.is_ok() {
                    handler.connected(chan);
                } else {
                    self.l2cap.channels.lock(|c| c.borrow_mut().remove(id, rx.cid));
                }
                return;
            }
            Err(result) => {
                debug!("[L2CAP] PSM {:#x} refused: {:?}", req.psm, result);
                LeCreditConnResponse::refuse(result)
            }
        };
        let _ = self
            .signal(id, ident, &SignalingCommand::LeCreditConnResponse(response))
            .await;
    }

    fn accept_le_channel(
        &self,
        id: ConnId,
        info: &ConnectionInfo,
        req: &LeCreditConnRequest,
    ) -> Result<(Endpoint, &'d dyn ChannelHandler), LeConnResult> {
        if req.mtu < L2CAP_LE_MIN_MTU || req.mps < L2CAP_LE_MIN_MTU {
            return Err(LeConnResult::UnacceptableParameters);
        }
        let handler = self
            .l2cap
            .server(req.psm)
            .ok_or(LeConnResult::PsmNotSupported)?;
        if !(L2CAP_LE_DYN_CID_START..=L2CAP_LE_DYN_CID_END).contains(&req.source_cid) {
            return Err(LeConnResult::InvalidSourceCid);
        }
        let in_use = self
            .l2cap
            .channels
            .lock(|c| c.borrow().find_by_tx_cid(id, req.source_cid).is_some());
        if in_use {
            return Err(LeConnResult::SourceCidAlreadyAllocated);
        }
        if !handler.accept(info) {
            return Err(LeConnResult::NoResources);
        }

        let local = self.local_endpoint();
        self.l2cap.channels.lock(|c| {
            let mut c = c.borrow_mut();
            let cid = c
                .allocate_cid(id, LinkKind::Le)
                .map_err(|_| LeConnResult::NoResources)?;
            let rx = Endpoint { cid, ..local };
            let tx = Endpoint {
                cid: req.source_cid,
                mtu: req.mtu,
                mps: req.mps,
                credits: req.initial_credits,
            };
            c.insert(
                id,
                L2capChannel::dynamic(handler, req.psm, ChannelState::Open, rx, tx),
            )
            .map_err(|_| LeConnResult::NoResources)?;
            Ok((rx, handler))
        })
    }

    fn le_conn_responded(&self, id: ConnId, ident: u8, rsp: LeCreditConnResponse) {
        let result = LeConnResult::from_u16(rsp.result).unwrap_or(LeConnResult::NoResources);
        let found = self.l2cap.channels.lock(|c| {
            let mut c = c.borrow_mut();
            let cid = c.find_by_ident(id, ident)?;
            let ch = c.get_mut(id, cid)?;
            if result == LeConnResult::Success {
                ch.tx = Endpoint {
                    cid: rsp.destination_cid,
                    mtu: rsp.mtu,
                    mps: rsp.mps,
                    credits: rsp.initial_credits,
                };
                ch.state = ChannelState::Open;
            } else {
                ch.state = ChannelState::Refused(result);
            }
            ch.wake();
            Some((cid, ch.handler()))
        });

        match found {
            None => warn!("[L2CAP] response for unknown identifier {}", ident),
            Some((cid, Some(handler))) if result == LeConnResult::Success => {
                debug!("[L2CAP] CID {:#x} connected to {:#x}", cid, rsp.destination_cid);
                handler.connected(Channel { conn: id, cid });
            }
            Some(_) => debug!("[L2CAP] connection refused: {:?}", result),
        }
    }

    fn command_rejected(&self, id: ConnId, ident: u8, rej: CommandReject) {
        debug!("[L2CAP] command {} rejected, reason {}", ident, rej.reason);
        self.l2cap.channels.lock(|c| {
            let mut c = c.borrow_mut();
            if let Some(cid) = c.find_by_ident(id, ident) {
                c.remove(id, cid);
            }
        });
    }

    async fn disconnection_requested(&self, id: ConnId, ident: u8, req: DisconnectionRequest) {
        let removed = self.l2cap.channels.lock(|c| {
            let mut c = c.borrow_mut();
            let cid = c.find_by_tx_cid(id, req.source_cid)?;
            c.remove(id, cid).map(|ch| (ch.rx.cid, ch.tx.cid, ch.handler()))
        });
        let Some((rx_cid, tx_cid, handler)) = removed else {
            warn!("[L2CAP] disconnection request for unknown CID {:#x}", req.source_cid);
            let cids = Some((req.destination_cid, req.source_cid));
            let _ = self.reject(id, ident, reject::INVALID_CID, cids).await;
            return;
        };

        let response = DisconnectionResponse {
            destination_cid: rx_cid,
            source_cid: tx_cid,
        };
        let _ = self
            .signal(id, ident, &SignalingCommand::DisconnectionResponse(response))
            .await;
        if let Some(handler) = handler {
            handler.disconnected(Channel { conn: id, cid: rx_cid });
        }
    }

    fn disconnection_responded(&self, id: ConnId, rsp: DisconnectionResponse) {
        let removed = self.l2cap.channels.lock(|c| {
            let mut c = c.borrow_mut();
            let dynamic = c.get(id, rsp.source_cid).is_some_and(L2capChannel::is_dynamic);
            if dynamic {
                c.remove(id, rsp.source_cid)
            } else {
                None
            }
        });
        if let Some(handler) = removed.and_then(|ch| ch.handler()) {
            handler.disconnected(Channel {
                conn: id,
                cid: rsp.source_cid,
            });
        }
    }

    async fn conn_param_requested(
        &self,
        id: ConnId,
        info: &ConnectionInfo,
        ident: u8,
        params: ConnParams,
    ) {
        if info.role != Role::Central {
            let _ = self.reject(id, ident, reject::NOT_UNDERSTOOD, None).await;
            return;
        }

        let accepted = params.is_valid();
        let result = if accepted {
            conn_param::ACCEPTED
        } else {
            conn_param::REJECTED
        };
        let sent = self
            .signal(id, ident, &SignalingCommand::ConnParamUpdateResponse { result })
            .await;
        if sent.is_ok() && accepted {
            self.connections.set_params(id, params);
            self.queue_internal(InternalCommand::ConnUpdate {
                handle: info.handle,
                params,
            })
            .await;
        }
    }

    async fn credits_received(&self, id: ConnId, fc: FlowControlCredit) {
        let outcome = self.l2cap.channels.lock(|c| {
            let mut c = c.borrow_mut();
            let cid = c.find_by_tx_cid(id, fc.cid)?;
            let ch = c.get_mut(id, cid)?;
            let total = ch.tx.credits.checked_add(fc.credits);
            if let Some(total) = total {
                ch.tx.credits = total;
                ch.wake();
            }
            Some((cid, total.is_some()))
        });

        match outcome {
            None => warn!("[L2CAP] credits for unknown CID {:#x}", fc.cid),
            Some((_, true)) => {}
            Some((cid, false)) => {
                error!("[L2CAP] credit overflow on CID {:#x}", cid);
                let _ = self.disconnect_channel(id, cid).await;
            }
        }
    }

    async fn disconnect_channel(&self, id: ConnId, cid: ChannelId) -> Result<(), Error> {
        let request = self.l2cap.channels.lock(|c| {
            let mut c = c.borrow_mut();
            let ch = c
                .get_mut(id, cid)
                .filter(|ch| ch.is_dynamic())
                .ok_or(Error::NotFound)?;
            match ch.state {
                ChannelState::Open => {}
                ChannelState::WaitDisconnect => return Err(Error::Already),
                ChannelState::WaitConnectRsp(_) | ChannelState::Refused(_) => {
                    return Err(Error::InvalidState);
                }
            }
            ch.state = ChannelState::WaitDisconnect;
            ch.sdu = None;
            ch.wake();
            Ok(DisconnectionRequest {
                destination_cid: ch.tx.cid,
                source_cid: ch.rx.cid,
            })
        })?;

        debug!("[L2CAP] disconnecting CID {:#x}", cid);
        let ident = self.l2cap.next_ident(id);
        self.signal(id, ident, &SignalingCommand::DisconnectionRequest(request))
            .await
    }

    async fn le_credit_recv(&self, id: ConnId, cid: ChannelId, pdu: Buf<'d>) {
        let outcome = self.l2cap.channels.lock(|c| {
            match c.borrow_mut().get_mut(id, cid) {
                Some(ch) => self.reassemble_sdu(ch, pdu),
                None => Reassembly::Ignored,
            }
        });

        match outcome {
            Reassembly::Ignored => debug!("[L2CAP] PDU on closed CID {:#x} dropped", cid),
            Reassembly::Violation => {
                let _ = self.disconnect_channel(id, cid).await;
            }
            Reassembly::Progress { complete, grant } => {
                if let Some((handler, sdu)) = complete {
                    handler.received(Channel { conn: id, cid }, sdu.data());
                }
                if let Some((cid, credits)) = grant {
                    let ident = self.l2cap.next_ident(id);
                    let _ = self
                        .signal(
                            id,
                            ident,
                            &SignalingCommand::FlowControlCredit(FlowControlCredit { cid, credits }),
                        )
                        .await;
                }
            }
        }
    }

    fn reassemble_sdu(&self, ch: &mut L2capChannel<'d>, mut pdu: Buf<'d>) -> Reassembly<'d> {
        let Some(handler) = ch.handler() else {
            return Reassembly::Ignored;
        };
        if ch.state != ChannelState::Open {
            return Reassembly::Ignored;
        }
        let Some(credits) = ch.rx.credits.checked_sub(1) else {
            error!("[L2CAP] CID {:#x}: PDU without credits", ch.rx.cid);
            return Reassembly::Violation;
        };
        ch.rx.credits = credits;
        if pdu.len() > usize::from(ch.rx.mps) {
            error!("[L2CAP] CID {:#x}: PDU larger than MPS", ch.rx.cid);
            return Reassembly::Violation;
        }

        let complete = match ch.sdu.take() {
            Some((mut sdu, expected)) => {
                if sdu.put_slice(pdu.data()).is_err() || sdu.len() > usize::from(expected) {
                    error!("[L2CAP] CID {:#x}: SDU overflow", ch.rx.cid);
                    return Reassembly::Violation;
                }
                if sdu.len() == usize::from(expected) {
                    Some(sdu)
                } else {
                    ch.sdu = Some((sdu, expected));
                    None
                }
            }
            None => {
                let [l0, l1, ..] = *pdu.data() else {
                    return Reassembly::Violation;
                };
                let expected = u16::from_le_bytes([l0, l1]);
                if expected > ch.rx.mtu || pdu.pull(L2CAP_SDU_HEADER_SIZE).is_err() {
                    error!("[L2CAP] CID {:#x}: SDU of {} exceeds MTU", ch.rx.cid, expected);
                    return Reassembly::Violation;
                }
                match pdu.len().cmp(&usize::from(expected)) {
                    Ordering::Greater => return Reassembly::Violation,
                    Ordering::Equal => Some(pdu),
                    Ordering::Less => {
                        let Ok(mut sdu) = Buf::try_alloc(self.pools.sdu, BufKind::Sdu) else {
                            error!("[L2CAP] CID {:#x}: no SDU buffer", ch.rx.cid);
                            return Reassembly::Violation;
                        };
                        if sdu.put_slice(pdu.data()).is_err() {
                            return Reassembly::Violation;
                        }
                        ch.sdu = Some((sdu, expected));
                        None
                    }
                }
            }
        };

        let max = self.config.l2cap_initial_credits;
        let grant = (ch.rx.credits <= max / 2).then(|| {
            let credits = max - ch.rx.credits;
            ch.rx.credits = max;
            (ch.rx.cid, credits)
        });
        Reassembly::Progress {
            complete: complete.map(|sdu| (handler, sdu)),
            grant: grant.filter(|(_, credits)| *credits > 0),
        }
    }

    async fn send_sdu(&self, chan: Channel, sdu: &[u8]) -> Result<(), Error> {
        let mps = self.l2cap.channels.lock(|c| {
            let mut c = c.borrow_mut();
            let ch = c.get_mut(chan.conn, chan.cid).ok_or(Error::NotFound)?;
            if ch.state != ChannelState::Open {
                return Err(Error::InvalidState);
            }
            if sdu.len() > usize::from(ch.tx.mtu) {
                return Err(Error::MessageTooLong);
            }
            if usize::from(ch.tx.mps) <= L2CAP_SDU_HEADER_SIZE {
                return Err(Error::InvalidState);
            }
            if ch.sending {
                return Err(Error::Busy);
            }
            ch.sending = true;
            Ok(usize::from(ch.tx.mps))
        })?;
        let _guard = SendGuard { stack: self, chan };

        let len = u16::try_from(sdu.len()).map_err(|_| Error::MessageTooLong)?;
        let (first, mut rest) = sdu.split_at(sdu.len().min(mps - L2CAP_SDU_HEADER_SIZE));
        let dst = self.wait_tx_credit(chan).await?;
        self.send_acl_pdu(chan.conn, dst, &[&len.to_le_bytes(), first])
            .await?;

        while !rest.is_empty() {
            let (segment, tail) = rest.split_at(rest.len().min(mps));
            let dst = self.wait_tx_credit(chan).await?;
            self.send_acl_pdu(chan.conn, dst, &[segment]).await?;
            rest = tail;
        }
        trace!("[L2CAP] SDU of {} sent on CID {:#x}", len, chan.cid);
        Ok(())
    }

    /// Take one transmit credit, returning the peer's CID
    async fn wait_tx_credit(&self, chan: Channel) -> Result<ChannelId, Error> {
        poll_fn(|cx| {
            self.l2cap.channels.lock(|c| {
                let mut c = c.borrow_mut();
                match c.get_mut(chan.conn, chan.cid) {
                    Some(ch) if ch.state == ChannelState::Open => {
                        if ch.tx.credits > 0 {
                            ch.tx.credits -= 1;
                            Poll::Ready(Ok(ch.tx.cid))
                        } else {
                            ch.register(cx);
                            Poll::Pending
                        }
                    }
                    _ => Poll::Ready(Err(Error::Disconnected)),
                }
            })
        })
        .await
    }
}
