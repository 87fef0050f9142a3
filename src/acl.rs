//! ACL (Asynchronous Connection-Less) Data Path
//!
//! Inbound ACL packets are reassembled into complete L2CAP frames and handed
//! to L2CAP. Outbound frames are split to the controller's ACL MTU, every
//! fragment costing one controller buffer credit. Fragments of one frame are
//! never interleaved with another frame on the same link.

use core::cell::RefCell;

use bt_hci::cmd::controller_baseband::HostNumberOfCompletedPackets;
use bt_hci::data::{AclBroadcastFlag, AclPacket, AclPacketBoundary};
use bt_hci::param::ConnHandleCompletedPackets;
use bt_hci::{FromHciBytes, WriteHci};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use crate::Error;
use crate::buffer::{Buf, BufKind};
use crate::connection::{ConnId, ConnectionState, LinkKind};
use crate::constants::{HCI_ACL_HEADER_SIZE, L2CAP_HEADER_SIZE, MAX_CONNECTIONS};
use crate::hci;
use crate::host::Stack;
use crate::l2cap::{ChannelId, L2capHeader};

/// Writer keeping the ACL header of an encoded packet and counting the rest
#[derive(Default)]
struct HeaderSink {
    header: [u8; HCI_ACL_HEADER_SIZE],
    written: usize,
}

impl embedded_io::ErrorType for HeaderSink {
    type Error = core::convert::Infallible;
}

impl embedded_io::Write for HeaderSink {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if let Some(room) = self.header.get_mut(self.written..) {
            let n = room.len().min(buf.len());
            room[..n].copy_from_slice(&buf[..n]);
        }
        self.written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Point to point ACL header for `data` sent on `handle`
fn acl_header(handle: u16, boundary: AclPacketBoundary, data: &[u8]) -> [u8; HCI_ACL_HEADER_SIZE] {
    let packet = AclPacket::new(
        hci::handle(handle),
        boundary,
        AclBroadcastFlag::PointToPoint,
        data,
    );
    let mut sink = HeaderSink::default();
    match packet.write_hci(&mut sink) {
        Ok(()) => sink.header,
        Err(never) => match never {},
    }
}

/// Per link reassembly state: the partial frame and its full length
pub(crate) struct AclRx<'d> {
    partial: Mutex<CriticalSectionRawMutex, RefCell<[Option<(Buf<'d>, usize)>; MAX_CONNECTIONS]>>,
}

impl<'d> AclRx<'d> {
    pub fn new() -> Self {
        Self {
            partial: Mutex::new(RefCell::new([const { None }; MAX_CONNECTIONS])),
        }
    }

    /// Forget a partial frame of `id`
    pub fn reset(&self, id: ConnId) {
        let dropped = self.take(id);
        if dropped.is_some() {
            debug!("[L2CAP] partial frame of {:?} dropped", id);
        }
    }

    fn take(&self, id: ConnId) -> Option<(Buf<'d>, usize)> {
        self.partial.lock(|p| p.borrow_mut()[id.index()].take())
    }

    fn put(&self, id: ConnId, partial: (Buf<'d>, usize)) {
        self.partial
            .lock(|p| p.borrow_mut()[id.index()] = Some(partial));
    }
}

impl<'d> Stack<'d> {
    /// Process one inbound ACL packet
    pub(crate) async fn handle_acl(&self, buf: Buf<'d>) {
        let (handle, boundary, exact) = match AclPacket::from_hci_bytes(buf.data()) {
            Ok((packet, rest)) => (packet.handle().raw(), packet.boundary_flag(), rest.is_empty()),
            Err(_) => {
                warn!("[L2CAP] truncated ACL packet");
                return;
            }
        };

        if !exact {
            warn!("[L2CAP] ACL length mismatch on {:#x}", handle);
        } else if let Some(frame) = self.reassemble(handle, boundary, buf) {
            match self.connections.find_by_handle(handle) {
                Some(id) => self.l2cap_recv(id, frame).await,
                None => warn!("[L2CAP] frame for unknown handle {:#x}", handle),
            }
        }

        if self.config.host_flow_control {
            let completed = [ConnHandleCompletedPackets::new(hci::handle(handle), 1)];
            if let Err(e) = self
                .exec_async(&HostNumberOfCompletedPackets::new(&completed))
                .await
            {
                warn!("[HCI] completed packets report failed: {:?}", e);
            }
        }
    }

    /// Add one fragment to the link's partial frame; returns the frame once complete
    fn reassemble(
        &self,
        handle: u16,
        boundary: AclPacketBoundary,
        mut buf: Buf<'d>,
    ) -> Option<Buf<'d>> {
        let id = self.connections.find_by_handle(handle)?;
        buf.pull(HCI_ACL_HEADER_SIZE).ok()?;

        match boundary {
            AclPacketBoundary::FirstNonFlushable | AclPacketBoundary::FirstFlushable => {
                if self.acl.take(id).is_some() {
                    warn!("[L2CAP] unfinished frame on {:?} dropped", id);
                }
                let frame_len = match L2capHeader::from_bytes(buf.data()) {
                    Ok(l2cap) => L2CAP_HEADER_SIZE + usize::from(l2cap.length),
                    Err(_) => {
                        warn!("[L2CAP] start fragment without L2CAP header");
                        return None;
                    }
                };
                if buf.len() == frame_len {
                    return Some(buf);
                }
                if buf.len() > frame_len || frame_len > self.pools.sdu.slot_size() {
                    warn!("[L2CAP] frame of {} bytes dropped", frame_len);
                    return None;
                }
                let mut frame = Buf::try_alloc(self.pools.sdu, BufKind::Sdu).ok()?;
                frame.put_slice(buf.data()).ok()?;
                self.acl.put(id, (frame, frame_len));
                None
            }
            AclPacketBoundary::Continuing => {
                let Some((mut frame, frame_len)) = self.acl.take(id) else {
                    warn!("[L2CAP] continuation without start on {:?}", id);
                    return None;
                };
                if frame.put_slice(buf.data()).is_err() || frame.len() > frame_len {
                    warn!("[L2CAP] frame overflow on {:?}", id);
                    return None;
                }
                if frame.len() == frame_len {
                    Some(frame)
                } else {
                    self.acl.put(id, (frame, frame_len));
                    None
                }
            }
            AclPacketBoundary::Complete => {
                warn!("[L2CAP] unexpected ACL flags on {:#x}", handle);
                None
            }
        }
    }

    /// Send one L2CAP frame to `channel_id` on `id`
    ///
    /// The payload is the concatenation of `parts`. Fragments go out in
    /// order, each waiting for a controller buffer.
    ///
    /// # Errors
    /// * `Error::NotConnected` if the link is not established
    /// * `Error::MessageTooLong` if the payload exceeds an L2CAP frame
    /// * `Error::Disconnected` if the link drops mid frame
    pub(crate) async fn send_acl_pdu(
        &self,
        id: ConnId,
        channel_id: ChannelId,
        parts: &[&[u8]],
    ) -> Result<(), Error> {
        let info = self.conn_info(id).ok_or(Error::NotConnected)?;
        if info.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        let payload: usize = parts.iter().map(|part| part.len()).sum();
        let length = u16::try_from(payload).map_err(|_| Error::MessageTooLong)?;
        let header = L2capHeader::new(length, channel_id).to_bytes();

        let controller = match info.kind {
            LinkKind::Le => self.connections.le_buffers(),
            LinkKind::BrEdr => self.connections.acl_buffers(),
        };
        let fragment = usize::from(controller.mtu)
            .min(self.pools.acl_out.slot_size().saturating_sub(HCI_ACL_HEADER_SIZE));
        if fragment == 0 {
            return Err(Error::NoResources);
        }

        let _lock = self.connections.tx_lock(id).lock().await;
        let mut pieces = core::iter::once(&header[..]).chain(parts.iter().copied());
        let mut current: &[u8] = &[];
        let mut remaining = L2CAP_HEADER_SIZE + payload;
        let mut boundary = AclPacketBoundary::FirstNonFlushable;

        while remaining > 0 {
            let size = remaining.min(fragment);
            let mut buf = Buf::alloc(self.pools.acl_out, BufKind::AclOut).await;
            buf.reserve(HCI_ACL_HEADER_SIZE)?;

            let mut needed = size;
            while needed > 0 {
                if current.is_empty() {
                    match pieces.next() {
                        Some(next) => current = next,
                        None => break,
                    }
                    continue;
                }
                let (chunk, rest) = current.split_at(needed.min(current.len()));
                buf.put_slice(chunk)?;
                current = rest;
                needed -= chunk.len();
            }

            let header = acl_header(info.handle, boundary, buf.data());
            buf.push_front(&header)?;

            self.connections.acquire_credit(id).await?;
            buf.set_handle(info.handle);
            self.tx_queue.send(buf).await;
            remaining -= size;
            boundary = AclPacketBoundary::Continuing;
        }
        trace!(
            "[L2CAP] {} byte frame to CID {:#x} on {:#x}",
            payload,
            channel_id,
            info.handle
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::cell::{Cell, RefCell};
    use std::vec::Vec;

    use embassy_futures::join::join;

    use super::*;
    use crate::hci::Cmd;
    use crate::l2cap::{Channel, ChannelHandler};
    use crate::test_support::{
        MockTransport, TestResources, acl, connect_peer, l2cap_frame, num_completed, run,
    };
    use crate::{Address, Config, PacketKind};

    const PEER: Address = Address::public([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    const HANDLE: u16 = 0x0040;
    const CID: u16 = 0x0020;

    #[derive(Default)]
    struct Sink {
        frames: RefCell<Vec<Vec<u8>>>,
        count: Cell<u8>,
    }

    impl ChannelHandler for Sink {
        fn received(&self, _chan: Channel, sdu: &[u8]) {
            self.frames.borrow_mut().push(sdu.to_vec());
            self.count.set(self.count.get() + 1);
        }
    }

    #[test]
    fn test_acl_header_layout() {
        let header = acl_header(0x0ABC, AclPacketBoundary::Continuing, &[0; 27]);
        assert_eq!(header, [0xBC, 0x1A, 27, 0]);
        assert_eq!(
            acl_header(0x0040, AclPacketBoundary::FirstNonFlushable, &[]),
            [0x40, 0x00, 0, 0]
        );

        let (packet, rest) =
            AclPacket::from_hci_bytes(&[0x40, 0x20, 0x02, 0x00, 0xAA, 0xBB]).unwrap();
        assert_eq!(packet.handle().raw(), 0x0040);
        assert_eq!(packet.boundary_flag(), AclPacketBoundary::FirstFlushable);
        assert_eq!(packet.data(), &[0xAA, 0xBB]);
        assert!(rest.is_empty());
        assert!(AclPacket::from_hci_bytes(&[0x40, 0x20]).is_err());
    }

    #[test]
    fn test_fragmented_frame_is_reassembled() {
        let sink = Sink::default();
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();
        stack
            .register_fixed_channel(LinkKind::Le, CID, &sink)
            .unwrap();

        run(&stack, &mock, async {
            connect_peer(&stack, &mock, HANDLE, PEER).await;
            let payload: Vec<u8> = (0..80).collect();
            let frame = l2cap_frame(CID, &payload);

            stack
                .deliver_bytes(PacketKind::Acl, &acl(HANDLE, 0x02, &frame[..40]))
                .unwrap();
            stack
                .deliver_bytes(PacketKind::Acl, &acl(HANDLE, 0x01, &frame[40..]))
                .unwrap();
            mock.settle().await;
            assert_eq!(sink.frames.borrow().as_slice(), &[payload]);
        });
    }

    #[test]
    fn test_broken_fragment_sequences_dropped() {
        let sink = Sink::default();
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();
        stack
            .register_fixed_channel(LinkKind::Le, CID, &sink)
            .unwrap();

        run(&stack, &mock, async {
            connect_peer(&stack, &mock, HANDLE, PEER).await;
            let frame = l2cap_frame(CID, &[7; 30]);

            // continuation with no start
            stack
                .deliver_bytes(PacketKind::Acl, &acl(HANDLE, 0x01, &frame[10..]))
                .unwrap();
            // a new start replaces an unfinished frame
            stack
                .deliver_bytes(PacketKind::Acl, &acl(HANDLE, 0x02, &frame[..10]))
                .unwrap();
            stack
                .deliver_bytes(PacketKind::Acl, &acl(HANDLE, 0x02, &frame[..10]))
                .unwrap();
            // too long for the declared L2CAP length
            let mut long = frame[10..].to_vec();
            long.push(0);
            stack
                .deliver_bytes(PacketKind::Acl, &acl(HANDLE, 0x01, &long))
                .unwrap();
            // unknown handle
            stack
                .deliver_bytes(PacketKind::Acl, &acl(0x0099, 0x02, &frame))
                .unwrap();
            mock.settle().await;
            assert_eq!(sink.count.get(), 0);

            stack
                .deliver_bytes(PacketKind::Acl, &acl(HANDLE, 0x02, &frame))
                .unwrap();
            mock.settle().await;
            assert_eq!(sink.count.get(), 1);
            mock.assert_idle().await;
        });
    }

    #[test]
    fn test_outbound_frame_is_fragmented() {
        let sink = Sink::default();
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();
        stack
            .register_fixed_channel(LinkKind::Le, CID, &sink)
            .unwrap();

        run(&stack, &mock, async {
            let id = connect_peer(&stack, &mock, HANDLE, PEER).await;
            let payload: Vec<u8> = (0..100).collect();
            stack
                .l2cap_send(Channel { conn: id, cid: CID }, &payload)
                .await
                .unwrap();

            // 64-byte ACL buffers leave 60 bytes per fragment
            let (handle, pb, first) = mock.next_acl().await;
            assert_eq!((handle, pb), (HANDLE, 0x00));
            assert_eq!(first.len(), 60);
            assert_eq!(&first[..4], &[100, 0, 0x20, 0x00]);
            let (_, pb, second) = mock.next_acl().await;
            assert_eq!(pb, 0x01);
            assert_eq!(second.len(), 44);
            assert_eq!(&second[..], &payload[56..]);
        });
    }

    #[test]
    fn test_send_waits_for_controller_buffers() {
        let sink = Sink::default();
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();
        stack
            .register_fixed_channel(LinkKind::Le, CID, &sink)
            .unwrap();

        run(&stack, &mock, async {
            let id = connect_peer(&stack, &mock, HANDLE, PEER).await;
            let payload = [0x5A; 500];

            let (sent, ()) = join(
                stack.l2cap_send(Channel { conn: id, cid: CID }, &payload),
                async {
                    // eight controller buffers, nine fragments
                    for _ in 0..8 {
                        mock.next_acl().await;
                    }
                    mock.assert_idle().await;
                    stack
                        .deliver_bytes(PacketKind::Event, &num_completed(HANDLE, 1))
                        .unwrap();
                    let (_, pb, last) = mock.next_acl().await;
                    assert_eq!(pb, 0x01);
                    assert_eq!(last.len(), 504 - 8 * 60);
                },
            )
            .await;
            assert_eq!(sent, Ok(()));
        });
    }

    #[test]
    fn test_host_flow_control_reports_consumed_packets() {
        let sink = Sink::default();
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default().with_host_flow_control(true));
        let mock = MockTransport::new();
        stack
            .register_fixed_channel(LinkKind::Le, CID, &sink)
            .unwrap();

        run(&stack, &mock, async {
            connect_peer(&stack, &mock, HANDLE, PEER).await;
            stack
                .deliver_bytes(PacketKind::Acl, &acl(HANDLE, 0x02, &l2cap_frame(CID, &[1])))
                .unwrap();

            let (opcode, params) = mock.next_command().await;
            assert_eq!(opcode, HostNumberOfCompletedPackets::OPCODE);
            assert_eq!(params.as_slice(), &[1, 0x40, 0x00, 1, 0]);
            assert_eq!(sink.count.get(), 1);
        });
    }

    #[test]
    fn test_send_requires_connection() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());

        embassy_futures::block_on(async {
            assert_eq!(
                stack.send_acl_pdu(ConnId::new(0), CID, &[&[1]]).await,
                Err(Error::NotConnected)
            );
        });
    }
}
