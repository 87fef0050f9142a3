//! Test harness: a recording transport and controller packet builders

extern crate std;

use core::cell::{Cell, RefCell};
use core::future::Future;
use std::collections::VecDeque;
use std::vec::Vec;

use bt_hci::FromHciBytes;
use embassy_futures::select::{Either, select};
use embassy_futures::yield_now;

use crate::connection::ConnId;
use crate::hci::Opcode;
use crate::host::{HostResources, Stack};
use crate::{Address, Error, PacketKind, Transport};

/// Pools used by every stack test: 64-byte ACL buffers, 256-byte SDU slots
pub(crate) type TestResources = HostResources<4, 8, 8, 8, 64, 4, 256>;

/// Polls an expected packet may wait before the test fails
const WAIT_BUDGET: usize = 1000;

/// Polls that let every stack task run to a standstill
const SETTLE_POLLS: usize = 100;

/// Transport recording every packet the stack sends
#[derive(Default)]
pub(crate) struct MockTransport {
    sent: RefCell<VecDeque<(PacketKind, Vec<u8>)>>,
    failing: Cell<bool>,
}

impl Transport for MockTransport {
    async fn send(&self, kind: PacketKind, packet: &[u8]) -> Result<(), Error> {
        if self.failing.get() {
            return Err(Error::Transport);
        }
        self.sent.borrow_mut().push_back((kind, packet.to_vec()));
        Ok(())
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.set(failing);
    }

    async fn next_packet(&self, kind: PacketKind) -> Vec<u8> {
        for _ in 0..WAIT_BUDGET {
            let next = self.sent.borrow_mut().pop_front();
            if let Some((sent_kind, packet)) = next {
                assert_eq!(
                    sent_kind, kind,
                    "expected a {kind:?} packet, stack sent {sent_kind:?} {packet:02x?}"
                );
                return packet;
            }
            yield_now().await;
        }
        panic!("no {kind:?} packet sent");
    }

    /// Next command: opcode and parameters
    pub async fn next_command(&self) -> (Opcode, Vec<u8>) {
        let packet = self.next_packet(PacketKind::Command).await;
        assert!(packet.len() >= 3, "truncated command {packet:02x?}");
        assert_eq!(usize::from(packet[2]), packet.len() - 3, "bad command length");
        let (opcode, _) = Opcode::from_hci_bytes(&packet[..2]).unwrap();
        (opcode, packet[3..].to_vec())
    }

    /// Next ACL packet: handle, packet boundary flag and data
    pub async fn next_acl(&self) -> (u16, u8, Vec<u8>) {
        let packet = self.next_packet(PacketKind::Acl).await;
        assert!(packet.len() >= 4, "truncated ACL packet {packet:02x?}");
        let word = u16::from_le_bytes([packet[0], packet[1]]);
        let len = usize::from(u16::from_le_bytes([packet[2], packet[3]]));
        assert_eq!(len, packet.len() - 4, "bad ACL length");
        (word & 0x0FFF, ((word >> 12) & 0x03) as u8, packet[4..].to_vec())
    }

    /// Next L2CAP frame, reassembled from its ACL fragments: CID and payload
    pub async fn next_l2cap(&self) -> (u16, Vec<u8>) {
        let (_, pb, mut frame) = self.next_acl().await;
        assert_ne!(pb, 0x01, "L2CAP frame starts with a continuation fragment");
        assert!(frame.len() >= 4, "truncated L2CAP frame {frame:02x?}");
        let len = usize::from(u16::from_le_bytes([frame[0], frame[1]]));
        while frame.len() < len + 4 {
            let (_, pb, more) = self.next_acl().await;
            assert_eq!(pb, 0x01, "expected a continuation fragment");
            frame.extend_from_slice(&more);
        }
        assert_eq!(frame.len(), len + 4, "L2CAP frame overruns its length");
        (u16::from_le_bytes([frame[2], frame[3]]), frame[4..].to_vec())
    }

    /// Next PDU sent on the ATT channel
    pub async fn next_att(&self) -> Vec<u8> {
        let (cid, pdu) = self.next_l2cap().await;
        assert_eq!(cid, crate::l2cap::cid::ATT, "expected ATT, got CID {cid:#x} {pdu:02x?}");
        pdu
    }

    /// Let the stack process everything queued so far
    pub async fn settle(&self) {
        for _ in 0..SETTLE_POLLS {
            yield_now().await;
        }
    }

    /// Settle and check that nothing was sent
    pub async fn assert_idle(&self) {
        self.settle().await;
        let sent = self.sent.borrow();
        assert!(sent.is_empty(), "unexpected packets sent: {sent:02x?}");
    }
}

/// Run `body` while the stack runs over `mock`
pub(crate) fn run<F: Future>(stack: &Stack<'_>, mock: &MockTransport, body: F) -> F::Output {
    embassy_futures::block_on(async {
        match select(stack.run(mock), body).await {
            Either::First(result) => panic!("stack stopped: {result:?}"),
            Either::Second(output) => output,
        }
    })
}

/// Event packet with `params`
pub(crate) fn event(code: u8, params: &[u8]) -> Vec<u8> {
    let mut packet = std::vec![code, params.len() as u8];
    packet.extend_from_slice(params);
    packet
}

/// Command Complete with one command credit
pub(crate) fn cmd_complete(opcode: Opcode, status: u8, params: &[u8]) -> Vec<u8> {
    let [lo, hi] = opcode.to_raw().to_le_bytes();
    let mut body = std::vec![1, lo, hi, status];
    body.extend_from_slice(params);
    event(0x0E, &body)
}

/// Command Status with one command credit
pub(crate) fn cmd_status(opcode: Opcode, status: u8) -> Vec<u8> {
    let [lo, hi] = opcode.to_raw().to_le_bytes();
    event(0x0F, &[status, 1, lo, hi])
}

/// LE Connection Complete; latency 0, supervision timeout 2 s
pub(crate) fn le_connection_complete(
    status: u8,
    handle: u16,
    role: u8,
    peer: &Address,
    interval: u16,
) -> Vec<u8> {
    let mut body = std::vec![0x01, status];
    body.extend_from_slice(&handle.to_le_bytes());
    body.push(role);
    body.extend_from_slice(&peer.to_bytes());
    body.extend_from_slice(&interval.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&200u16.to_le_bytes());
    body.push(0);
    event(0x3E, &body)
}

pub(crate) fn disconnection_complete(handle: u16, reason: u8) -> Vec<u8> {
    let [lo, hi] = handle.to_le_bytes();
    event(0x05, &[0, lo, hi, reason])
}

pub(crate) fn num_completed(handle: u16, count: u16) -> Vec<u8> {
    let [h0, h1] = handle.to_le_bytes();
    let [c0, c1] = count.to_le_bytes();
    event(0x13, &[1, h0, h1, c0, c1])
}

/// ACL packet with packet boundary flag `pb`
pub(crate) fn acl(handle: u16, pb: u8, data: &[u8]) -> Vec<u8> {
    let word = (handle & 0x0FFF) | (u16::from(pb) << 12);
    let mut packet = word.to_le_bytes().to_vec();
    packet.extend_from_slice(&(data.len() as u16).to_le_bytes());
    packet.extend_from_slice(data);
    packet
}

/// L2CAP basic frame
pub(crate) fn l2cap_frame(cid: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = (payload.len() as u16).to_le_bytes().to_vec();
    frame.extend_from_slice(&cid.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Complete L2CAP frame in one ACL packet
pub(crate) fn acl_l2cap(handle: u16, cid: u16, payload: &[u8]) -> Vec<u8> {
    acl(handle, 0x02, &l2cap_frame(cid, payload))
}

/// ATT PDU from the peer on `handle`
pub(crate) fn deliver_att(stack: &Stack<'_>, handle: u16, pdu: &[u8]) {
    stack
        .deliver_bytes(PacketKind::Acl, &acl_l2cap(handle, crate::l2cap::cid::ATT, pdu))
        .unwrap();
}

/// Bring up an LE link with us as peripheral; the controller has eight
/// 251-byte LE buffers
pub(crate) async fn connect_peer(
    stack: &Stack<'_>,
    mock: &MockTransport,
    handle: u16,
    peer: Address,
) -> ConnId {
    stack.connections.set_le_buffers(251, 8);
    stack
        .deliver_bytes(
            PacketKind::Event,
            &le_connection_complete(0, handle, 0x01, &peer, 0x0020),
        )
        .unwrap();
    mock.settle().await;
    stack
        .connections
        .find_by_handle(handle)
        .expect("connection not established")
}
