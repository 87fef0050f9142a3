//! Processor Tasks - command sending, inbound processing and follow-up commands
//!
//! [`Stack::run`] multiplexes every task the stack needs onto one future, so
//! the application decides where it runs (an Embassy task, a `block_on` in
//! a test, or a thread of its own):
//!
//! * **Sender**: the command queue behind its credit gate, joined with the
//!   raw transmit queue (ACL fragments, Host Number Of Completed Packets)
//! * **Priority receiver**: Command Complete, Command Status and Number Of
//!   Completed Packets; never waits, so a blocked receiver cannot starve a
//!   command completion
//! * **Receiver**: every other event plus inbound ACL data, in arrival order
//! * **Internal command processor**: commands triggered by events
//!
//! # Usage
//!
//! ```rust,ignore
//! use embassy_futures::join::join;
//!
//! let stack = Stack::new(&RESOURCES, Config::default());
//! join(stack.run(&transport), async {
//!     stack.enable().await?;
//!     stack.start_advertising(&params, &ad, &[]).await?;
//!     Ok::<(), bluewren::Error>(())
//! })
//! .await;
//! ```

use embassy_futures::join::join;
use embassy_futures::select::{Either3, select3};

use crate::buffer::BufKind;
use crate::host::Stack;
use crate::{Error, PacketKind, Transport};

impl Stack<'_> {
    /// Drive the stack over `transport`
    ///
    /// Opens the transport and then runs until dropped.
    ///
    /// # Errors
    /// Returns the transport's error if it cannot be opened
    pub async fn run<T: Transport>(&self, transport: &T) -> Result<(), Error> {
        if let Err(e) = transport.open().await {
            error!("[HOST] transport open failed: {:?}", e);
            return Err(e);
        }
        info!("[HOST] transport open, processing");

        let sender = join(self.dispatcher.run_sender(transport), self.tx_task(transport));
        let receivers = join(self.priority_task(), self.rx_task());
        match select3(sender, receivers, self.internal_task()).await {
            Either3::First((never, _)) | Either3::Second((never, _)) | Either3::Third(never) => {
                match never {}
            }
        }
    }

    async fn tx_task<T: Transport>(&self, transport: &T) -> ! {
        loop {
            let buf = self.tx_queue.receive().await;
            let kind = match buf.kind() {
                BufKind::AclOut => PacketKind::Acl,
                BufKind::Command => PacketKind::Command,
                other => {
                    warn!("[HOST] cannot transmit {:?} buffer", other);
                    continue;
                }
            };
            if let Err(e) = transport.send(kind, buf.data()).await {
                error!("[HOST] transport failed on {:?} packet: {:?}", kind, e);
                if kind == PacketKind::Acl {
                    // the controller never saw it, so no completion will return the credit
                    self.connections.packets_completed(buf.handle(), 1);
                }
            }
        }
    }

    async fn priority_task(&self) -> ! {
        loop {
            let buf = self.rx_prio_queue.receive().await;
            self.handle_priority_event(buf);
        }
    }

    async fn rx_task(&self) -> ! {
        loop {
            let buf = self.rx_queue.receive().await;
            match buf.kind() {
                BufKind::Event => self.handle_event(buf).await,
                BufKind::AclIn => self.handle_acl(buf).await,
                other => warn!("[HOST] unexpected {:?} buffer on the receive queue", other),
            }
        }
    }

    async fn internal_task(&self) -> ! {
        loop {
            let command = self.internal.receive().await;
            self.process_internal_command(command).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use crate::test_support::{MockTransport, TestResources};

    struct Unreachable;

    impl Transport for Unreachable {
        async fn open(&self) -> Result<(), Error> {
            Err(Error::Transport)
        }

        async fn send(&self, _kind: PacketKind, _packet: &[u8]) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn test_run_fails_when_transport_does_not_open() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());

        let result = embassy_futures::block_on(stack.run(&Unreachable));
        assert_eq!(result, Err(Error::Transport));
    }

    #[test]
    fn test_inbound_packets_are_consumed() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        crate::test_support::run(&stack, &mock, async {
            // an unknown event and ACL data for an unknown handle
            stack
                .deliver_bytes(PacketKind::Event, &[0xFF, 0x01, 0x00])
                .unwrap();
            stack
                .deliver_bytes(PacketKind::Acl, &[0x01, 0x20, 0x04, 0x00, 0, 0, 0x04, 0])
                .unwrap();
            mock.settle().await;
            assert!(stack.rx_queue.is_empty());
            assert_eq!(stack.pools.evt.available(), stack.pools.evt.capacity());
            assert_eq!(stack.pools.acl_in.available(), stack.pools.acl_in.capacity());
            mock.assert_idle().await;
        });
    }
}
