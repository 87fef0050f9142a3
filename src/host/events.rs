//! HCI event handlers
//!
//! The priority path handles Command Complete, Command Status and Number Of
//! Completed Packets synchronously. Everything else goes through
//! [`Stack::handle_event`], which matches the decoded `bt-hci` [`Event`].

use bt_hci::cmd::le::LeConnUpdate;
use bt_hci::param::LeAdvReports;
use bt_hci::param::{EncryptionEnabledLevel, LeConnRole};

use super::{InternalCommand, Stack};
use crate::buffer::Buf;
use crate::connection::{ConnId, ConnectionState, LinkKind, Role};
use crate::constants::HCI_EVT_HEADER_SIZE;
use crate::gap::AdvReport;
use crate::hci::{Event, LeEvent, handle, is_priority, parse_event, status, status_code, units};
use crate::{Address, BdAddr, ConnParams, Error};

// ncmd, opcode and status following the event header
const CMD_COMPLETE_FIXED: usize = HCI_EVT_HEADER_SIZE + 4;

impl<'d> Stack<'d> {
    /// Command Complete, Command Status and Number Of Completed Packets
    pub(crate) fn handle_priority_event(&self, mut buf: Buf<'d>) {
        let (ncmd, opcode, status, has_params) = match parse_event(buf.data()) {
            Ok(Event::CommandComplete(e)) => {
                (e.num_hci_cmd_pkts, e.cmd_opcode, status_code(e.status), true)
            }
            Ok(Event::CommandStatus(e)) => {
                (e.num_hci_cmd_pkts, e.cmd_opcode, status_code(e.status), false)
            }
            Ok(Event::NumberOfCompletedPackets(e)) => {
                for entry in e.completed_packets.iter() {
                    if let (Ok(handle), Ok(count)) = (entry.handle(), entry.num_completed_packets())
                    {
                        trace!("[HCI] handle {:#x}: {} packets completed", handle.raw(), count);
                        self.connections.packets_completed(handle.raw(), count);
                    }
                }
                return;
            }
            Ok(_) => {
                warn!("[HCI] unexpected event on the priority path");
                return;
            }
            Err(_) => {
                warn!("[HCI] malformed priority event dropped");
                return;
            }
        };

        debug!("[HCI] command {:#x} done, status {:#x}", opcode.to_raw(), status);
        let params = if has_params {
            buf.pull(CMD_COMPLETE_FIXED).ok().map(|()| buf)
        } else {
            None
        };
        let matched = self.dispatcher.complete(opcode, status, params);
        if ncmd > 0 && (matched || !self.dispatcher.is_outstanding()) {
            self.dispatcher.open_gate();
        }
    }

    /// Every event not handled on the priority path
    pub(crate) async fn handle_event(&self, buf: Buf<'d>) {
        if buf.data().first().is_some_and(|code| is_priority(*code)) {
            self.handle_priority_event(buf);
            return;
        }
        let event = match parse_event(buf.data()) {
            Ok(event) => event,
            Err(_) => {
                warn!("[HCI] malformed event dropped");
                return;
            }
        };

        match event {
            Event::DisconnectionComplete(e) => {
                self.disconnection_complete(status_code(e.status), e.handle.raw(), status_code(e.reason))
                    .await;
            }
            Event::ConnectionComplete(e) => {
                self.br_connection_complete(status_code(e.status), e.handle.raw(), e.bd_addr);
            }
            Event::ConnectionRequest(e) => self.connection_request(e.bd_addr).await,
            Event::EncryptionChangeV1(e) => {
                let enabled = e.enabled != EncryptionEnabledLevel::Off;
                self.encryption_change(status_code(e.status), e.handle.raw(), Some(enabled));
            }
            Event::EncryptionKeyRefreshComplete(e) => {
                self.encryption_change(status_code(e.status), e.handle.raw(), None);
            }
            Event::LinkKeyRequest(e) => {
                let bd_addr = e.bd_addr;
                let command = match self.security().link_key(&bd_addr) {
                    Some(key) => InternalCommand::LinkKeyReply { bd_addr, key },
                    None => InternalCommand::LinkKeyNegativeReply { bd_addr },
                };
                self.queue_internal(command).await;
            }
            Event::LinkKeyNotification(e) => {
                // key type is the last parameter
                let key_type = buf.data().last().copied().unwrap_or_default();
                debug!("[HCI] new link key for {:?}, type {}", e.bd_addr, key_type);
                self.security().link_key_created(&e.bd_addr, &e.link_key, key_type);
            }
            Event::PinCodeRequest(e) => {
                self.queue_internal(InternalCommand::PinCodeNegativeReply { bd_addr: e.bd_addr })
                    .await;
            }
            Event::IoCapabilityRequest(e) => {
                self.queue_internal(InternalCommand::IoCapabilityNegativeReply { bd_addr: e.bd_addr })
                    .await;
            }
            Event::UserConfirmationRequest(e) => {
                self.queue_internal(InternalCommand::UserConfirmationNegativeReply {
                    bd_addr: e.bd_addr,
                })
                .await;
            }
            Event::SimplePairingComplete(e) => {
                if e.status.to_result().is_err() {
                    warn!("[HCI] pairing with {:?} failed: {:#x}", e.bd_addr, status_code(e.status));
                }
            }
            Event::InquiryComplete(e) => {
                debug!("[HCI] inquiry complete: {:#x}", status_code(e.status));
            }
            Event::InquiryResult(_) => debug!("[HCI] inquiry result"),
            Event::HardwareError(e) => {
                error!("[HCI] controller hardware error {:#x}", e.hardware_code);
            }
            Event::DataBufferOverflow(_) => warn!("[HCI] controller dropped inbound data"),
            Event::Le(event) => self.handle_le_event(event).await,
            Event::CommandComplete(_)
            | Event::CommandStatus(_)
            | Event::NumberOfCompletedPackets(_) => {}
            _ => debug!("[HCI] unhandled event {:?}", buf.data().first()),
        }
    }

    async fn handle_le_event(&self, event: LeEvent<'_>) {
        match event {
            LeEvent::LeConnectionComplete(e) => {
                let peer = Address {
                    kind: e.peer_addr_kind,
                    addr: e.peer_addr,
                };
                let timing = (
                    e.conn_interval.as_u16(),
                    e.peripheral_latency,
                    e.supervision_timeout.as_u16(),
                );
                self.le_connection_complete(status_code(e.status), e.handle.raw(), e.role, peer, timing)
                    .await;
            }
            LeEvent::LeAdvertisingReport(e) => self.advertising_reports(&e.reports).await,
            LeEvent::LeConnectionUpdateComplete(e) => {
                let handle = e.handle.raw();
                let Some(id) = self.connections.find_by_handle(handle) else {
                    warn!("[HCI] connection update for unknown handle {:#x}", handle);
                    return;
                };
                if e.status.to_result().is_err() {
                    debug!("[HCI] connection update failed: {:#x}", status_code(e.status));
                    return;
                }
                let info = self.connections.update(id, |info| {
                    info.interval = e.conn_interval.as_u16();
                    info.latency = e.peripheral_latency;
                    info.timeout = e.supervision_timeout.as_u16();
                    *info
                });
                if let Some(info) = info {
                    self.for_each_observer(|o| o.param_updated(&info));
                }
            }
            LeEvent::LeReadRemoteFeaturesComplete(e) => {
                let handle = e.handle.raw();
                let Some(id) = self.connections.find_by_handle(handle) else {
                    warn!("[HCI] remote features for unknown handle {:#x}", handle);
                    return;
                };
                if e.status.to_result().is_ok() {
                    let features = e.le_features.into_inner();
                    self.connections.update(id, |info| info.features = features);
                }
                self.queue_internal(InternalCommand::UpdateConnParams { id })
                    .await;
            }
            LeEvent::LeLongTermKeyRequest(e) => {
                let handle = e.handle.raw();
                let Some(info) = self
                    .connections
                    .find_by_handle(handle)
                    .and_then(|id| self.connections.info(id))
                else {
                    warn!("[HCI] LTK request for unknown handle {:#x}", handle);
                    return;
                };
                let rand = u64::from_le_bytes(e.random_number);
                let command = match self
                    .security()
                    .long_term_key(&info, rand, e.encrypted_diversifier)
                {
                    Some(ltk) => InternalCommand::LtkReply { handle, ltk },
                    None => InternalCommand::LtkNegativeReply { handle },
                };
                self.queue_internal(command).await;
            }
            LeEvent::LeRemoteConnectionParameterRequest(e) => {
                let handle = e.handle.raw();
                let params = ConnParams {
                    interval_min: e.interval_min.as_u16(),
                    interval_max: e.interval_max.as_u16(),
                    latency: e.max_latency,
                    timeout: e.timeout.as_u16(),
                };
                let known = self.connections.find_by_handle(handle).is_some();
                if !known {
                    warn!("[HCI] parameter request for unknown handle {:#x}", handle);
                }
                let command = if known && params.is_valid() {
                    InternalCommand::ConnParamReply { handle, params }
                } else {
                    InternalCommand::ConnParamNegativeReply { handle }
                };
                self.queue_internal(command).await;
            }
            _ => debug!("[HCI] unhandled LE event"),
        }
    }

    async fn le_connection_complete(
        &self,
        status: u8,
        handle: u16,
        role: LeConnRole,
        peer: Address,
        (interval, latency, timeout): (u16, u16, u16),
    ) {
        debug!(
            "[HCI] LE connection complete: status {:#x} handle {:#x} peer {:?}",
            status, handle, peer
        );
        let pending = self
            .connections
            .find_by_addr_state(&peer, ConnectionState::Connecting);

        if status != status::SUCCESS {
            if let Some(id) = pending {
                self.connections.update(id, |info| info.reason = status);
                self.connection_attempt_failed(id).await;
            }
            return;
        }

        let role = Role::from(role);
        if role == Role::Peripheral {
            self.gap.advertising_ended();
        }

        let id = match pending {
            Some(id) => id,
            None => match self
                .connections
                .alloc(peer, LinkKind::Le, role, self.config.conn_params)
            {
                Ok(id) => id,
                Err(_) => {
                    error!("[HCI] no slot for new connection {:#x}", handle);
                    return;
                }
            },
        };

        let info = self.connections.update(id, |info| {
            info.handle = handle;
            info.role = role;
            info.peer = peer;
            info.interval = interval;
            info.latency = latency;
            info.timeout = timeout;
            info.reason = 0;
        });
        if info.is_none() {
            return;
        }
        self.link_up(id);

        let follow_up = match role {
            Role::Central => InternalCommand::ReadRemoteFeatures { handle },
            Role::Peripheral => InternalCommand::UpdateConnParams { id },
        };
        self.queue_internal(follow_up).await;
        self.queue_internal(InternalCommand::ScanUpdate { fast: false })
            .await;
    }

    /// A pending LE connection ended before it was established
    pub(crate) async fn connection_attempt_failed(&self, id: ConnId) {
        if self.connections.auto_connect(id) {
            self.connections.set_state(id, ConnectionState::ConnectScan);
        } else {
            self.connections.set_state(id, ConnectionState::Disconnected);
            self.connections.release(id);
        }
        self.queue_internal(InternalCommand::ScanUpdate { fast: false })
            .await;
    }

    fn br_connection_complete(&self, status: u8, handle: u16, bd_addr: BdAddr) {
        let Some(id) = self
            .connections
            .find_br_by_addr_state(&bd_addr, ConnectionState::Connecting)
        else {
            warn!("[HCI] no pending BR/EDR connection for {:?}", bd_addr);
            return;
        };

        if status != status::SUCCESS {
            self.connections.update(id, |info| info.reason = status);
            self.connections.set_state(id, ConnectionState::Disconnected);
            self.connections.release(id);
            return;
        }

        self.connections.update(id, |info| {
            info.handle = handle;
            info.encrypted = false;
            info.reason = 0;
        });
        self.link_up(id);
    }

    async fn connection_request(&self, bd_addr: BdAddr) {
        let peer = Address {
            kind: crate::AddrKind::PUBLIC,
            addr: bd_addr,
        };
        let Ok(id) = self.connections.alloc(
            peer,
            LinkKind::BrEdr,
            Role::Peripheral,
            self.config.conn_params,
        ) else {
            return;
        };
        self.connections.set_state(id, ConnectionState::Connecting);
        self.queue_internal(InternalCommand::AcceptConnection { bd_addr })
            .await;
    }

    fn link_up(&self, id: ConnId) {
        self.connections.set_state(id, ConnectionState::Connected);
        self.l2cap_connected(id);
        if let Some(info) = self.connections.info(id) {
            info!("[HCI] connected {:?} handle {:#x}", info.peer, info.handle);
            self.for_each_observer(|o| o.connected(&info));
        }
    }

    async fn disconnection_complete(&self, status: u8, handle: u16, reason: u8) {
        if status != status::SUCCESS {
            debug!("[HCI] disconnect failed: {:#x}", status);
            return;
        }
        let Some(id) = self.connections.find_by_handle(handle) else {
            warn!("[HCI] disconnection of unknown handle {:#x}", handle);
            return;
        };
        let Some(info) = self.connections.update(id, |info| {
            info.reason = reason;
            *info
        }) else {
            return;
        };
        info!("[HCI] disconnected handle {:#x}, reason {:#x}", handle, reason);

        self.acl.reset(id);
        self.l2cap_disconnected(id);
        self.gatt_disconnected(id, &info);
        self.connections.set_state(id, ConnectionState::Disconnected);
        self.for_each_observer(|o| o.disconnected(&info, reason));

        if info.kind == LinkKind::Le && self.connections.auto_connect(id) {
            self.connections.set_state(id, ConnectionState::ConnectScan);
            self.queue_internal(InternalCommand::ScanUpdate { fast: false })
                .await;
        } else {
            self.connections.release(id);
        }

        if info.kind == LinkKind::Le && self.gap.keep_advertising() {
            self.queue_internal(InternalCommand::ReenableAdvertising)
                .await;
        }
    }

    fn encryption_change(&self, status: u8, handle: u16, enabled: Option<bool>) {
        let Some(id) = self.connections.find_by_handle(handle) else {
            warn!("[HCI] encryption change for unknown handle {:#x}", handle);
            return;
        };
        if status != status::SUCCESS {
            warn!("[HCI] encryption change failed on {:#x}: {:#x}", handle, status);
            return;
        }

        if let Some(enabled) = enabled {
            let security = self.security();
            self.connections.update(id, |info| {
                info.encrypted = enabled;
                info.key_size = if enabled {
                    security.encryption_key_size(info)
                } else {
                    0
                };
            });
        }
        if let Some(info) = self.connections.info(id) {
            self.for_each_observer(|o| o.security_changed(&info));
        }
    }

    async fn advertising_reports(&self, reports: &LeAdvReports<'_>) {
        for report in reports.iter() {
            let Ok(report) = report else {
                warn!("[HCI] malformed advertising report");
                return;
            };
            let report = AdvReport {
                kind: report.event_kind,
                addr: Address {
                    kind: report.addr_kind,
                    addr: report.addr,
                },
                data: report.data,
                rssi: report.rssi,
            };
            self.gap_advertising_report(&report).await;
        }
    }

    /// Bring a connection's parameters into its requested range
    pub(crate) async fn update_conn_params(&self, id: ConnId) {
        let (Some(info), Some(params)) = (self.connections.info(id), self.connections.params(id))
        else {
            return;
        };
        if info.state != ConnectionState::Connected || info.kind != LinkKind::Le {
            return;
        }
        if (params.interval_min..=params.interval_max).contains(&info.interval) {
            return;
        }

        let result = match info.role {
            Role::Central => self.le_conn_update(info.handle, &params).await,
            Role::Peripheral => self.l2cap_conn_param_request(id, &params).await,
        };
        if let Err(e) = result {
            debug!("[HCI] parameter update for {:?} not sent: {:?}", id, e);
        }
    }

    pub(crate) async fn le_conn_update(&self, conn: u16, params: &ConnParams) -> Result<(), Error> {
        self.exec(&LeConnUpdate::new(
            handle(conn),
            units(params.interval_min),
            units(params.interval_max),
            params.latency,
            units(params.timeout),
            units(0),
            units(0),
        ))
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use bt_hci::cmd::le::{
        LeLongTermKeyRequestNegativeReply, LeReadRemoteFeatures,
        LeRemoteConnectionParameterRequestNegativeReply, LeSetScanEnable, LeSetScanParams,
    };
    use bt_hci::cmd::link_control::AcceptConnectionRequest;

    use super::*;
    use crate::hci::Cmd;
    use crate::test_support::{
        MockTransport, TestResources, cmd_complete, cmd_status, connect_peer,
        disconnection_complete, event, le_connection_complete, run,
    };
    use crate::{Config, ConnectionInfo, ConnectionObserver, PacketKind};
    use core::cell::Cell;

    const PEER: Address = Address::public([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

    #[derive(Default)]
    struct Counter {
        connected: Cell<u8>,
        disconnected: Cell<u8>,
        reason: Cell<u8>,
    }

    impl ConnectionObserver for Counter {
        fn connected(&self, _conn: &ConnectionInfo) {
            self.connected.set(self.connected.get() + 1);
        }

        fn disconnected(&self, _conn: &ConnectionInfo, reason: u8) {
            self.disconnected.set(self.disconnected.get() + 1);
            self.reason.set(reason);
        }
    }

    #[test]
    fn test_connect_then_disconnect_releases_slot() {
        let counter = Counter::default();
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();
        stack.add_observer(&counter).unwrap();

        run(&stack, &mock, async {
            let id = connect_peer(&stack, &mock, 0x0040, PEER).await;
            let info = stack.conn_info(id).unwrap();
            assert_eq!(info.state, ConnectionState::Connected);
            assert_eq!(info.handle, 0x0040);
            assert_eq!(info.role, Role::Peripheral);
            assert_eq!(stack.connection_count(), 1);
            assert_eq!(counter.connected.get(), 1);

            stack
                .deliver_bytes(PacketKind::Event, &disconnection_complete(0x0040, 0x13))
                .unwrap();
            mock.settle().await;

            assert_eq!(stack.connection_count(), 0);
            assert!(stack.connection(id).is_none());
            assert_eq!(counter.disconnected.get(), 1);
            assert_eq!(counter.reason.get(), 0x13);
            mock.assert_idle().await;
        });
    }

    #[test]
    fn test_auto_connect_peer_rescans_after_disconnect() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let id = connect_peer(&stack, &mock, 0x0040, PEER).await;
            stack.connections.set_auto_connect(id, true);

            stack
                .deliver_bytes(PacketKind::Event, &disconnection_complete(0x0040, 0x08))
                .unwrap();

            let (opcode, _) = mock.next_command().await;
            assert_eq!(opcode, LeSetScanParams::OPCODE);
            stack
                .deliver_bytes(PacketKind::Event, &cmd_complete(LeSetScanParams::OPCODE, 0, &[]))
                .unwrap();
            let (opcode, params) = mock.next_command().await;
            assert_eq!(opcode, LeSetScanEnable::OPCODE);
            assert_eq!(params[0], 1);
            stack
                .deliver_bytes(PacketKind::Event, &cmd_complete(LeSetScanEnable::OPCODE, 0, &[]))
                .unwrap();
            mock.settle().await;

            let info = stack.conn_info(id).unwrap();
            assert_eq!(info.state, ConnectionState::ConnectScan);
            assert_eq!(info.handle, 0);
            assert_eq!(stack.connection_count(), 1);
        });
    }

    #[test]
    fn test_held_connection_survives_until_dropped() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let id = connect_peer(&stack, &mock, 0x0041, PEER).await;
            let conn = stack.connection(id).unwrap();

            stack
                .deliver_bytes(PacketKind::Event, &disconnection_complete(0x0041, 0x08))
                .unwrap();
            assert_eq!(conn.wait_disconnected().await, 0x08);
            assert_eq!(conn.handle(), 0);
            assert_eq!(stack.connection_count(), 1);

            drop(conn);
            assert_eq!(stack.connection_count(), 0);
        });
    }

    #[test]
    fn test_central_connection_reads_remote_features() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            stack
                .deliver_bytes(
                    PacketKind::Event,
                    &le_connection_complete(0, 0x0042, 0x00, &PEER, 0x0100),
                )
                .unwrap();
            let (opcode, params) = mock.next_command().await;
            assert_eq!(opcode, LeReadRemoteFeatures::OPCODE);
            assert_eq!(params.as_slice(), &[0x42, 0x00]);
            stack
                .deliver_bytes(PacketKind::Event, &cmd_status(LeReadRemoteFeatures::OPCODE, 0))
                .unwrap();

            // features complete, interval 0x0100 is outside 0x18..=0x28
            stack
                .deliver_bytes(
                    PacketKind::Event,
                    &event(0x3E, &[0x04, 0x00, 0x42, 0x00, 1, 0, 0, 0, 0, 0, 0, 0]),
                )
                .unwrap();
            let (opcode, params) = mock.next_command().await;
            assert_eq!(opcode, LeConnUpdate::OPCODE);
            assert_eq!(&params[..6], &[0x42, 0x00, 0x18, 0x00, 0x28, 0x00]);
            stack
                .deliver_bytes(PacketKind::Event, &cmd_status(LeConnUpdate::OPCODE, 0))
                .unwrap();

            let id = stack.connections.find_by_handle(0x0042).unwrap();
            assert_eq!(stack.conn_info(id).unwrap().features[0], 1);
        });
    }

    #[test]
    fn test_failed_connection_frees_pending_slot() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let id = stack
                .connections
                .alloc(PEER, LinkKind::Le, Role::Central, stack.config.conn_params)
                .unwrap();
            stack.connections.set_state(id, ConnectionState::Connecting);
            let conn = stack.connection(id).unwrap();

            stack
                .deliver_bytes(
                    PacketKind::Event,
                    &le_connection_complete(0x3E, 0x0000, 0x00, &PEER, 0x18),
                )
                .unwrap();
            assert_eq!(conn.wait_connected().await, Err(crate::Error::Hci(0x3E)));
            drop(conn);
            mock.settle().await;
            assert_eq!(stack.connection_count(), 0);
        });
    }

    #[test]
    fn test_ltk_request_without_key_is_refused() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            connect_peer(&stack, &mock, 0x0040, PEER).await;
            stack
                .deliver_bytes(
                    PacketKind::Event,
                    &event(0x3E, &[0x05, 0x40, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
                )
                .unwrap();
            let (opcode, params) = mock.next_command().await;
            assert_eq!(opcode, LeLongTermKeyRequestNegativeReply::OPCODE);
            assert_eq!(params.as_slice(), &[0x40, 0x00]);
        });
    }

    #[test]
    fn test_invalid_peer_parameters_rejected() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            connect_peer(&stack, &mock, 0x0040, PEER).await;
            // max interval below min
            stack
                .deliver_bytes(
                    PacketKind::Event,
                    &event(
                        0x3E,
                        &[0x06, 0x40, 0x00, 0x28, 0x00, 0x18, 0x00, 0x00, 0x00, 0x2A, 0x00],
                    ),
                )
                .unwrap();
            let (opcode, params) = mock.next_command().await;
            assert_eq!(opcode, LeRemoteConnectionParameterRequestNegativeReply::OPCODE);
            assert_eq!(params.as_slice(), &[0x40, 0x00, status::UNACCEPT_CONN_PARAM]);
        });
    }

    #[test]
    fn test_br_connection_request_is_accepted() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();
        let addr = [1, 2, 3, 4, 5, 6];

        run(&stack, &mock, async {
            let mut params = [0u8; 10];
            params[..6].copy_from_slice(&addr);
            params[9] = 0x01;
            stack
                .deliver_bytes(PacketKind::Event, &event(0x04, &params))
                .unwrap();

            let (opcode, params) = mock.next_command().await;
            assert_eq!(opcode, AcceptConnectionRequest::OPCODE);
            assert_eq!(&params[..6], &addr);
            assert_eq!(params[6], 0x01);
            stack
                .deliver_bytes(PacketKind::Event, &cmd_status(AcceptConnectionRequest::OPCODE, 0))
                .unwrap();

            let mut complete = [0u8; 11];
            complete[1] = 0x50;
            complete[3..9].copy_from_slice(&addr);
            complete[9] = 0x01;
            stack
                .deliver_bytes(PacketKind::Event, &event(0x03, &complete))
                .unwrap();
            mock.settle().await;

            let id = stack.connections.find_by_handle(0x0050).unwrap();
            let info = stack.conn_info(id).unwrap();
            assert_eq!(info.kind, LinkKind::BrEdr);
            assert_eq!(info.state, ConnectionState::Connected);
        });
    }
}
