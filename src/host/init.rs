//! Controller bring-up
//!
//! [`Stack::enable`] resets the controller, learns what it supports and how
//! many ACL buffers it has, selects the events the stack handles and settles
//! the identity address.

use bt_hci::cmd::controller_baseband::{
    HostBufferSize, Reset, SetControllerToHostFlowControl, SetEventMask,
};
use bt_hci::cmd::info::{
    ReadBdAddr, ReadBufferSize, ReadLocalSupportedCmds, ReadLocalSupportedFeatures,
    ReadLocalVersionInformation,
};
use bt_hci::cmd::le::{
    LeReadBufferSize, LeReadLocalSupportedFeatures, LeSetEventMask, LeSetRandomAddr,
};
use bt_hci::param::{ControllerToHostFlowControl, EventMask, LeEventMask};

use super::Stack;
use crate::address::is_static_random;
use crate::codec::Reader;
use crate::constants::HCI_ACL_HEADER_SIZE;
use crate::hci::Cmd;
use crate::security::StorageKey;
use crate::{Address, Error};

fn le_event_mask() -> LeEventMask {
    LeEventMask::new()
        .enable_le_conn_complete(true)
        .enable_le_adv_report(true)
        .enable_le_conn_update_complete(true)
        .enable_le_read_remote_features_complete(true)
        .enable_le_long_term_key_request(true)
        .enable_le_remote_conn_parameter_request(true)
}

fn event_mask(br_edr: bool) -> EventMask {
    EventMask::new()
        .enable_disconnection_complete(true)
        .enable_encryption_change_v1(true)
        .enable_hardware_error(true)
        .enable_data_buffer_overflow(true)
        .enable_encryption_key_refresh_complete(true)
        .enable_le_meta(true)
        .enable_inquiry_complete(br_edr)
        .enable_inquiry_result(br_edr)
        .enable_conn_complete(br_edr)
        .enable_conn_request(br_edr)
        .enable_pin_code_request(br_edr)
        .enable_link_key_request(br_edr)
        .enable_link_key_notification(br_edr)
        .enable_io_capability_request(br_edr)
        .enable_user_confirmation_request(br_edr)
        .enable_simple_pairing_complete(br_edr)
}

impl Stack<'_> {
    /// Bring the controller up
    ///
    /// Must run while [`run`](Self::run) is being polled.
    ///
    /// # Errors
    /// Returns [`Error::Already`] if the stack is enabled,
    /// [`Error::NotSupported`] for a controller without LE, and
    /// [`Error::Hci`] for any command the controller fails
    pub async fn enable(&self) -> Result<(), Error> {
        if self.is_enabled() {
            return Err(Error::Already);
        }

        self.exec(&Reset::new()).await?;

        let features = self.read_params::<_, 8>(&ReadLocalSupportedFeatures::new()).await?;
        self.device.lock(|d| d.borrow_mut().info.features = features);

        let version = self.read_params::<_, 8>(&ReadLocalVersionInformation::new()).await?;
        let mut r = Reader::new(&version);
        let (hci_version, hci_revision, lmp_version, manufacturer, lmp_subversion) =
            (r.u8()?, r.le16()?, r.u8()?, r.le16()?, r.le16()?);

        let bd_addr = self.read_params::<_, 6>(&ReadBdAddr::new()).await?;
        let supported_commands = self.read_params::<_, 64>(&ReadLocalSupportedCmds::new()).await?;

        self.device.lock(|d| {
            let info = &mut d.borrow_mut().info;
            info.hci_version = hci_version;
            info.hci_revision = hci_revision;
            info.lmp_version = lmp_version;
            info.manufacturer = manufacturer;
            info.lmp_subversion = lmp_subversion;
            info.address = Address::public(bd_addr);
            info.supported_commands = supported_commands;
        });
        let info = self.local_info();
        info!(
            "[HCI] controller: HCI {} rev {:#x}, manufacturer {:#x}",
            hci_version, hci_revision, manufacturer
        );

        if info.supports_br_edr() {
            self.read_acl_buffer_size().await?;
        }

        if !info.supports_le() {
            error!("[HCI] controller does not support LE");
            return Err(Error::NotSupported);
        }
        let le_buffers = self.read_params::<_, 3>(&LeReadBufferSize::new()).await?;
        let mut r = Reader::new(&le_buffers);
        let (le_mtu, le_pkts) = (r.le16()?, r.u8()?);
        if le_mtu == 0 {
            // shared buffers
            let acl = if info.supports_br_edr() {
                self.connections.acl_buffers()
            } else {
                self.read_acl_buffer_size().await?
            };
            self.connections.set_le_buffers(acl.mtu, acl.pkts);
        } else {
            self.connections.set_le_buffers(le_mtu, u16::from(le_pkts));
        }
        let le = self.connections.le_buffers();
        debug!("[HCI] LE ACL buffers: {} x {} bytes", le.pkts, le.mtu);

        let le_features = self.read_params::<_, 8>(&LeReadLocalSupportedFeatures::new()).await?;
        self.device.lock(|d| d.borrow_mut().info.le_features = le_features);

        self.exec(&LeSetEventMask::new(le_event_mask())).await?;
        self.exec(&SetEventMask::new(event_mask(info.supports_br_edr())))
            .await?;

        if self.config.host_flow_control {
            self.enable_host_flow_control().await?;
        }

        if bd_addr == [0; 6] {
            self.setup_static_random_address().await?;
        }

        self.device.lock(|d| d.borrow_mut().enabled = true);
        info!("[HCI] enabled, identity {:?}", self.local_info().address);
        Ok(())
    }

    /// Run a command and copy its return parameters into a fixed array
    async fn read_params<C: Cmd, const N: usize>(&self, cmd: &C) -> Result<[u8; N], Error> {
        let params = self.exec(cmd).await?.ok_or(Error::InvalidPacket)?;
        let mut out = [0u8; N];
        out.copy_from_slice(params.data().get(..N).ok_or(Error::InvalidPacket)?);
        Ok(out)
    }

    async fn read_acl_buffer_size(&self) -> Result<crate::connection::ControllerBuffers, Error> {
        let params = self.read_params::<_, 7>(&ReadBufferSize::new()).await?;
        let mut r = Reader::new(&params);
        let acl_mtu = r.le16()?;
        let _sco_mtu = r.u8()?;
        let acl_pkts = r.le16()?;
        self.connections.set_acl_buffers(acl_mtu, acl_pkts);
        debug!("[HCI] ACL buffers: {} x {} bytes", acl_pkts, acl_mtu);
        Ok(self.connections.acl_buffers())
    }

    async fn enable_host_flow_control(&self) -> Result<(), Error> {
        let acl_mtu = self.pools.acl_in.slot_size().saturating_sub(HCI_ACL_HEADER_SIZE);
        self.exec(&HostBufferSize::new(
            u16::try_from(acl_mtu).unwrap_or(u16::MAX),
            0,
            u16::try_from(self.pools.acl_in.capacity()).unwrap_or(u16::MAX),
            0,
        ))
        .await?;
        self.exec(&SetControllerToHostFlowControl::new(
            ControllerToHostFlowControl::AclOnSyncOff,
        ))
        .await?;
        debug!("[HCI] host flow control on");
        Ok(())
    }

    /// Load or create the static random identity of a controller without a
    /// public address
    async fn setup_static_random_address(&self) -> Result<(), Error> {
        let stored = self.key_store().and_then(|store| {
            let mut addr = [0u8; 6];
            match store.read(StorageKey::IdentityAddress, &mut addr) {
                Some(6) if is_static_random(&addr) => Some(addr),
                _ => None,
            }
        });

        let addr = match stored {
            Some(addr) => addr,
            None => {
                let mut addr = [0u8; 6];
                self.random_bytes(&mut addr).await?;
                addr[5] |= 0xC0;
                if let Some(store) = self.key_store() {
                    if let Err(e) = store.write(StorageKey::IdentityAddress, &addr) {
                        warn!("[HCI] identity address not persisted: {:?}", e);
                    }
                }
                addr
            }
        };

        let identity = Address::random(addr);
        self.exec(&LeSetRandomAddr::new(identity.addr)).await?;
        self.device
            .lock(|d| d.borrow_mut().info.address = identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use bt_hci::cmd::le::LeRand;

    use super::*;
    use crate::hci::Opcode;
    use crate::security::KeyStore;
    use crate::test_support::{MockTransport, TestResources, cmd_complete, run};
    use crate::{AddrKind, Config, PacketKind};
    use core::cell::RefCell;
    use std::vec::Vec;

    // LE supported, BR/EDR not supported
    const LE_ONLY: [u8; 8] = [0, 0, 0, 0, 0x60, 0, 0, 0];

    fn reply(opcode: Opcode, bd_addr: [u8; 6]) -> Vec<u8> {
        let params: Vec<u8> = match opcode {
            o if o == ReadLocalSupportedFeatures::OPCODE => LE_ONLY.to_vec(),
            o if o == ReadLocalVersionInformation::OPCODE => {
                std::vec![0x0C, 0x01, 0x00, 0x0C, 0x59, 0x00, 0x02, 0x00]
            }
            o if o == ReadBdAddr::OPCODE => bd_addr.to_vec(),
            o if o == ReadLocalSupportedCmds::OPCODE => std::vec![0xFF; 64],
            // no dedicated LE buffers
            o if o == LeReadBufferSize::OPCODE => std::vec![0, 0, 0],
            o if o == ReadBufferSize::OPCODE => std::vec![0xFB, 0x00, 0, 0x05, 0x00, 0, 0],
            o if o == LeReadLocalSupportedFeatures::OPCODE => std::vec![1, 0, 0, 0, 0, 0, 0, 0],
            o if o == LeRand::OPCODE => std::vec![0x5A; 8],
            _ => Vec::new(),
        };
        cmd_complete(opcode, 0, &params)
    }

    #[derive(Default)]
    struct MemoryStore {
        identity: RefCell<Option<[u8; 6]>>,
    }

    impl KeyStore for MemoryStore {
        fn read(&self, key: StorageKey, out: &mut [u8]) -> Option<usize> {
            match key {
                StorageKey::IdentityAddress => {
                    let addr = (*self.identity.borrow())?;
                    out[..6].copy_from_slice(&addr);
                    Some(6)
                }
                StorageKey::IdentityResolvingKey => None,
            }
        }

        fn write(&self, key: StorageKey, value: &[u8]) -> Result<(), Error> {
            if key == StorageKey::IdentityAddress {
                let mut addr = [0u8; 6];
                addr.copy_from_slice(value);
                *self.identity.borrow_mut() = Some(addr);
            }
            Ok(())
        }
    }

    #[test]
    fn test_enable_sequence() {
        let resources = TestResources::new();
        let stack = Stack::new(&resources, Config::default());
        let mock = MockTransport::new();
        let addr = [1, 2, 3, 4, 5, 6];

        run(&stack, &mock, async {
            let (result, (seen, mask)) = embassy_futures::join::join(stack.enable(), async {
                let mut seen = Vec::new();
                let mut mask = Vec::new();
                while seen.last() != Some(&SetEventMask::OPCODE) {
                    let (opcode, params) = mock.next_command().await;
                    seen.push(opcode);
                    mask = params;
                    stack
                        .deliver_bytes(PacketKind::Event, &reply(opcode, addr))
                        .unwrap();
                }
                (seen, mask)
            })
            .await;
            result.unwrap();

            assert_eq!(
                seen,
                [
                    Reset::OPCODE,
                    ReadLocalSupportedFeatures::OPCODE,
                    ReadLocalVersionInformation::OPCODE,
                    ReadBdAddr::OPCODE,
                    ReadLocalSupportedCmds::OPCODE,
                    LeReadBufferSize::OPCODE,
                    ReadBufferSize::OPCODE,
                    LeReadLocalSupportedFeatures::OPCODE,
                    LeSetEventMask::OPCODE,
                    SetEventMask::OPCODE,
                ]
            );
            assert!(stack.is_enabled());

            // LE only: Disconnection Complete and LE Meta on, Connection Request off
            let mask = u64::from_le_bytes(mask.try_into().unwrap());
            assert_ne!(mask & (1 << 4), 0);
            assert_ne!(mask & (1 << 61), 0);
            assert_eq!(mask & (1 << 3), 0);

            let info = stack.local_info();
            assert_eq!(info.address, Address::public(addr));
            assert_eq!(info.hci_version, 0x0C);
            assert_eq!(info.manufacturer, 0x0059);
            assert_eq!(info.le_features[0], 1);

            // LE falls back to the shared ACL buffers
            let le = stack.connections.le_buffers();
            assert_eq!((le.mtu, le.pkts), (0xFB, 5));
            assert_eq!(stack.enable().await, Err(Error::Already));
        });
    }

    #[test]
    fn test_missing_public_address_creates_static_identity() {
        let resources = TestResources::new();
        let store = MemoryStore::default();
        let stack = Stack::new(&resources, Config::default()).with_key_store(&store);
        let mock = MockTransport::new();

        run(&stack, &mock, async {
            let (result, seen) = embassy_futures::join::join(stack.enable(), async {
                let mut seen = Vec::new();
                while seen.last() != Some(&LeSetRandomAddr::OPCODE) {
                    let (opcode, _) = mock.next_command().await;
                    seen.push(opcode);
                    stack
                        .deliver_bytes(PacketKind::Event, &reply(opcode, [0; 6]))
                        .unwrap();
                }
                seen
            })
            .await;
            result.unwrap();

            assert_eq!(seen.iter().filter(|o| **o == LeRand::OPCODE).count(), 4);
            let info = stack.local_info();
            assert_eq!(info.address.kind, AddrKind::RANDOM);
            assert!(info.address.is_static_random());
            assert_eq!(*store.identity.borrow(), Some(info.address.bytes()));
        });
    }
}
