//! HCI command dispatch
//!
//! Commands are queued FIFO and handed to the transport one at a time. The
//! sender waits on a single-permit gate that the event processor reopens once
//! the controller reports a free command slot (`Num_HCI_Command_Packets > 0`)
//! in Command Complete or Command Status.
//!
//! A synchronous sender parks on one of [`MAX_SYNC_WAITERS`] result slots. If
//! the sender gives up before the result arrives the slot is marked abandoned
//! and reclaimed when the completion comes in.

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::semaphore::{GreedySemaphore, Semaphore};
use embassy_sync::signal::Signal;

use bt_hci::WriteHci;
use bt_hci::cmd::controller_baseband::HostNumberOfCompletedPackets;

use super::Stack;
use crate::buffer::{Buf, BufKind};
use crate::constants::{COMMAND_QUEUE_DEPTH, MAX_SYNC_WAITERS};
use crate::hci::{Cmd, Opcode, opcode_of, status};
use crate::{Error, PacketKind, Transport};

type CS = CriticalSectionRawMutex;

const _: () = assert!(MAX_SYNC_WAITERS <= 8);

/// Outcome of a command sent with [`Stack::send_command_sync`]
#[derive(Debug)]
pub struct CommandResult<'d> {
    /// Status from Command Complete or Command Status
    pub status: u8,
    /// Return parameters following the status byte; `None` for Command Status
    /// and for commands that never reached the controller
    pub params: Option<Buf<'d>>,
}

struct QueuedCommand<'d> {
    buf: Buf<'d>,
    waiter: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct SentCommand {
    opcode: Opcode,
    waiter: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
struct WaiterSlots {
    used: u8,
    abandoned: u8,
}

pub(crate) struct Dispatcher<'d> {
    queue: Channel<CS, QueuedCommand<'d>, COMMAND_QUEUE_DEPTH>,
    gate: GreedySemaphore<CS>,
    sent: Mutex<CS, Cell<Option<SentCommand>>>,
    waiters: [Signal<CS, CommandResult<'d>>; MAX_SYNC_WAITERS],
    slots: Mutex<CS, Cell<WaiterSlots>>,
    free_slots: GreedySemaphore<CS>,
}

impl<'d> Dispatcher<'d> {
    pub const fn new() -> Self {
        Self {
            queue: Channel::new(),
            gate: GreedySemaphore::new(1),
            sent: Mutex::new(Cell::new(None)),
            waiters: [const { Signal::new() }; MAX_SYNC_WAITERS],
            slots: Mutex::new(Cell::new(WaiterSlots {
                used: 0,
                abandoned: 0,
            })),
            free_slots: GreedySemaphore::new(MAX_SYNC_WAITERS),
        }
    }

    /// Queue a command without waiting for its completion
    pub async fn send(&self, buf: Buf<'d>) {
        self.queue.send(QueuedCommand { buf, waiter: None }).await;
    }

    /// Queue a command and wait for Command Complete or Command Status
    pub async fn send_sync(&self, buf: Buf<'d>) -> CommandResult<'d> {
        let slot = self.claim_slot().await;
        self.waiters[slot].reset();
        let mut guard = WaiterGuard {
            dispatcher: self,
            slot,
            queued: false,
            done: false,
        };

        self.queue
            .send(QueuedCommand {
                buf,
                waiter: Some(slot),
            })
            .await;
        guard.queued = true;

        let result = self.waiters[slot].wait().await;
        guard.done = true;
        result
    }

    /// Command sender task body
    pub async fn run_sender<T: Transport>(&self, transport: &T) -> ! {
        loop {
            let command = self.queue.receive().await;
            self.wait_gate().await;

            let opcode = match opcode_of(command.buf.data()) {
                Some(opcode) => opcode,
                None => {
                    warn!("[HCI] dropping truncated command buffer");
                    if let Some(slot) = command.waiter {
                        self.resolve(slot, status::UNSPECIFIED, None);
                    }
                    self.open_gate();
                    continue;
                }
            };

            self.sent.lock(|s| {
                s.set(Some(SentCommand {
                    opcode,
                    waiter: command.waiter,
                }));
            });
            trace!("[HCI] sending command {:#x}", opcode.to_raw());

            if transport
                .send(PacketKind::Command, command.buf.data())
                .await
                .is_err()
            {
                error!("[HCI] transport failed on command {:#x}", opcode.to_raw());
                self.complete(opcode, status::UNSPECIFIED, None);
                self.open_gate();
            }
        }
    }

    /// Match a completion against the outstanding command
    ///
    /// Returns `false` if `opcode` is not the command in flight; the
    /// completion is then ignored.
    pub fn complete(&self, opcode: Opcode, status: u8, params: Option<Buf<'d>>) -> bool {
        let sent = self.sent.lock(|s| match s.get() {
            Some(sent) if sent.opcode == opcode => {
                s.set(None);
                Some(sent)
            }
            _ => None,
        });

        let Some(sent) = sent else {
            if opcode.to_raw() != 0 {
                warn!(
                    "[HCI] completion for {:#x} does not match outstanding command",
                    opcode.to_raw()
                );
            }
            return false;
        };

        if let Some(slot) = sent.waiter {
            self.resolve(slot, status, params);
        }
        true
    }

    /// True while a command is waiting for its completion
    pub fn is_outstanding(&self) -> bool {
        self.sent.lock(|s| s.get().is_some())
    }

    /// Allow the next queued command to go out
    pub fn open_gate(&self) {
        self.gate.set(1);
    }

    async fn wait_gate(&self) {
        let Ok(permit) = self.gate.acquire(1).await;
        permit.disarm();
    }

    async fn claim_slot(&self) -> usize {
        let Ok(permit) = self.free_slots.acquire(1).await;
        permit.disarm();
        self.slots.lock(|s| {
            let mut slots = s.get();
            let index = (!slots.used).trailing_zeros() as usize;
            slots.used |= 1 << index;
            s.set(slots);
            index
        })
    }

    fn free_slot(&self, slot: usize) {
        self.slots.lock(|s| {
            let mut slots = s.get();
            slots.used &= !(1 << slot);
            slots.abandoned &= !(1 << slot);
            s.set(slots);
        });
        self.free_slots.release(1);
    }

    fn resolve(&self, slot: usize, status: u8, params: Option<Buf<'d>>) {
        let abandoned = self.slots.lock(|s| s.get().abandoned & (1 << slot) != 0);
        if abandoned {
            debug!("[HCI] dropping result for abandoned waiter {}", slot);
            self.free_slot(slot);
        } else {
            self.waiters[slot].signal(CommandResult { status, params });
        }
    }
}

struct WaiterGuard<'a, 'd> {
    dispatcher: &'a Dispatcher<'d>,
    slot: usize,
    queued: bool,
    done: bool,
}

impl Drop for WaiterGuard<'_, '_> {
    fn drop(&mut self) {
        let waiter = &self.dispatcher.waiters[self.slot];
        if self.done || !self.queued || waiter.signaled() {
            waiter.reset();
            self.dispatcher.free_slot(self.slot);
        } else {
            self.dispatcher.slots.lock(|s| {
                let mut slots = s.get();
                slots.abandoned |= 1 << self.slot;
                s.set(slots);
            });
        }
    }
}

fn command_opcode(buf: &Buf<'_>) -> Result<Opcode, Error> {
    match buf.data() {
        [_, _, len, params @ ..]
            if buf.kind() == BufKind::Command && params.len() == usize::from(*len) =>
        {
            opcode_of(buf.data()).ok_or(Error::InvalidParameter)
        }
        _ => Err(Error::InvalidParameter),
    }
}

impl<'d> Stack<'d> {
    /// Allocate a command buffer with the HCI header filled in
    ///
    /// The caller appends exactly `param_len` bytes of parameters.
    ///
    /// # Errors
    /// * [`Error::NoResources`] if every command buffer is in use
    /// * [`Error::MessageTooLong`] if the header does not fit the pool's slots
    pub fn create_command(&self, opcode: Opcode, param_len: u8) -> Result<Buf<'d>, Error> {
        let mut buf = Buf::try_alloc(self.pools.cmd, BufKind::Command)?;
        buf.put_le16(opcode.to_raw())?;
        buf.put_u8(param_len)?;
        Ok(buf)
    }

    /// Command buffer for the stack's own commands; waits for a free one
    async fn alloc_command(&self) -> Buf<'d> {
        Buf::alloc(self.pools.cmd, BufKind::Command).await
    }

    /// Queue a command without waiting for its completion
    ///
    /// Host Number Of Completed Packets bypasses the command queue and the
    /// controller's command credits.
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] if `buf` is not a well-formed command
    pub async fn send_command(&self, buf: Buf<'d>) -> Result<(), Error> {
        let opcode = command_opcode(&buf)?;
        if opcode == HostNumberOfCompletedPackets::OPCODE {
            self.tx_queue.send(buf).await;
        } else {
            self.dispatcher.send(buf).await;
        }
        Ok(())
    }

    /// Queue a command and wait for its Command Complete or Command Status
    ///
    /// # Errors
    /// Returns [`Error::InvalidParameter`] if `buf` is not a well-formed
    /// command, or is a command the controller never completes
    pub async fn send_command_sync(&self, buf: Buf<'d>) -> Result<CommandResult<'d>, Error> {
        let opcode = command_opcode(&buf)?;
        if opcode == HostNumberOfCompletedPackets::OPCODE {
            return Err(Error::InvalidParameter);
        }
        Ok(self.dispatcher.send_sync(buf).await)
    }

    async fn build<C: Cmd>(&self, cmd: &C) -> Result<Buf<'d>, Error> {
        let mut buf = self.alloc_command().await;
        cmd.write_hci(&mut buf)?;
        Ok(buf)
    }

    /// Run a command and return its return parameters (status stripped)
    pub(crate) async fn exec<C: Cmd>(&self, cmd: &C) -> Result<Option<Buf<'d>>, Error> {
        let buf = self.build(cmd).await?;
        let result = self.dispatcher.send_sync(buf).await;
        if result.status == status::SUCCESS {
            Ok(result.params)
        } else {
            debug!(
                "[HCI] command {:#x} failed with status {:#x}",
                C::OPCODE.to_raw(),
                result.status
            );
            Err(Error::Hci(result.status))
        }
    }

    /// Queue a command without waiting for it
    pub(crate) async fn exec_async<C: Cmd>(&self, cmd: &C) -> Result<(), Error> {
        let buf = self.build(cmd).await?;
        self.send_command(buf).await
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::Config;
    use crate::test_support::{MockTransport, TestResources, cmd_complete, cmd_status, run};
    use bt_hci::cmd::controller_baseband::{Reset, SetEventMask};
    use bt_hci::cmd::le::LeRand;
    use bt_hci::param::EventMask;
    use embassy_futures::join::join;
    use std::vec::Vec;

    #[test]
    fn test_commands_are_serialized_in_fifo_order() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let senders = join(
                async {
                    stack.exec(&Reset::new()).await.unwrap();
                    stack.exec(&LeRand::new()).await.unwrap();
                },
                async {
                    let first = mock.next_command().await;
                    assert_eq!(first.0, Reset::OPCODE);
                    // nothing else goes out before the completion
                    mock.assert_idle().await;
                    stack.deliver_bytes(PacketKind::Event, &cmd_complete(Reset::OPCODE, 0, &[])).unwrap();

                    let second = mock.next_command().await;
                    assert_eq!(second.0, LeRand::OPCODE);
                    stack
                        .deliver_bytes(PacketKind::Event, &cmd_complete(LeRand::OPCODE, 0, &[1; 8]))
                        .unwrap();
                },
            );
            senders.await;
        });
    }

    #[test]
    fn test_result_carries_return_parameters() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let (params, ()) = join(stack.exec(&LeRand::new()), async {
                mock.next_command().await;
                stack
                    .deliver_bytes(
                        PacketKind::Event,
                        &cmd_complete(LeRand::OPCODE, 0, &[1, 2, 3, 4, 5, 6, 7, 8]),
                    )
                    .unwrap();
            })
            .await;
            let params = params.unwrap().unwrap();
            assert_eq!(params.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        });
    }

    #[test]
    fn test_failure_status_is_reported() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let (result, ()) = join(stack.exec(&SetEventMask::new(EventMask::new())), async {
                mock.next_command().await;
                stack
                    .deliver_bytes(PacketKind::Event, &cmd_status(SetEventMask::OPCODE, 0x12))
                    .unwrap();
            })
            .await;
            assert_eq!(result.unwrap_err(), Error::Hci(0x12));
        });
    }

    #[test]
    fn test_unmatched_completion_is_ignored() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let (result, ()) = join(stack.exec(&Reset::new()), async {
                mock.next_command().await;
                stack
                    .deliver_bytes(PacketKind::Event, &cmd_complete(LeRand::OPCODE, 0, &[]))
                    .unwrap();
                assert!(stack.dispatcher.is_outstanding());
                stack
                    .deliver_bytes(PacketKind::Event, &cmd_complete(Reset::OPCODE, 0, &[]))
                    .unwrap();
            })
            .await;
            assert!(result.is_ok());
            assert!(!stack.dispatcher.is_outstanding());
        });
    }

    #[test]
    fn test_transport_failure_completes_with_unspecified() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();
        mock.set_failing(true);

        run(&stack, &mock, async {
            assert_eq!(
                stack.exec(&Reset::new()).await.unwrap_err(),
                Error::Hci(status::UNSPECIFIED)
            );
            mock.set_failing(false);
            let (result, ()) = join(stack.exec(&Reset::new()), async {
                mock.next_command().await;
                stack
                    .deliver_bytes(PacketKind::Event, &cmd_complete(Reset::OPCODE, 0, &[]))
                    .unwrap();
            })
            .await;
            assert!(result.is_ok());
        });
    }

    #[test]
    fn test_malformed_command_buffer_is_rejected() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());

        embassy_futures::block_on(async {
            let mut buf = stack.create_command(Reset::OPCODE, 2).unwrap();
            buf.put_u8(0).unwrap();
            assert_eq!(
                stack.send_command(buf).await.unwrap_err(),
                Error::InvalidParameter
            );
        });
    }

    #[test]
    fn test_create_command_fails_fast_when_pool_is_empty() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());

        let held: Vec<_> = (0..4)
            .map(|_| stack.create_command(Reset::OPCODE, 0).unwrap())
            .collect();
        assert_eq!(
            stack.create_command(Reset::OPCODE, 0).unwrap_err(),
            Error::NoResources
        );

        drop(held);
        let buf = stack.create_command(Reset::OPCODE, 0).unwrap();
        assert_eq!(buf.data(), &[0x03, 0x0C, 0x00]);
    }
}
