//! `Bluewren` Constants
//!
//! This module contains the capacities and protocol constants used throughout
//! the `Bluewren` library. Capacities size the fixed tables inside
//! [`Stack`](crate::Stack); protocol constants come from the Bluetooth Core
//! specification.

/// Maximum number of simultaneous connections (including pending ones)
pub const MAX_CONNECTIONS: usize = 4;

/// Maximum number of L2CAP channels across all connections
pub const MAX_L2CAP_CHANNELS: usize = 16;

/// Maximum number of registered fixed-channel handlers
pub const MAX_FIXED_CHANNELS: usize = 4;

/// Maximum number of registered L2CAP servers (one per PSM)
pub const MAX_L2CAP_SERVERS: usize = 4;

/// Maximum number of attributes in the GATT table
pub const MAX_ATTRIBUTES: usize = 64;

/// Maximum number of registered GATT services
pub const MAX_SERVICES: usize = 16;

/// Maximum number of active GATT client subscriptions
pub const MAX_SUBSCRIPTIONS: usize = 8;

/// Maximum number of queued prepare-write segments held by the GATT server
pub const MAX_PREPARED_WRITES: usize = 8;

/// Maximum bytes of one queued prepare-write segment
pub const MAX_PREPARED_WRITE_LEN: usize = 64;

/// Maximum number of registered connection observers
pub const MAX_OBSERVERS: usize = 4;

/// Depth of the outbound command queue
pub const COMMAND_QUEUE_DEPTH: usize = 8;

/// Depth of the regular inbound queue (events and ACL data)
pub const RX_QUEUE_DEPTH: usize = 8;

/// Depth of the priority inbound queue (command completions, packet counts)
pub const RX_PRIO_QUEUE_DEPTH: usize = 4;

/// Depth of the queue feeding the transport directly (ACL data, bypass commands)
pub const TX_QUEUE_DEPTH: usize = 8;

/// Depth of the internal follow-up command queue
pub const INTERNAL_COMMAND_QUEUE_DEPTH: usize = 8;

/// Maximum number of tasks blocked in `send_command_sync` at once
pub const MAX_SYNC_WAITERS: usize = 4;

/// Size of a command buffer: 3 byte header + 255 bytes of parameters
pub const HCI_CMD_BUF_SIZE: usize = 3 + 255;

/// Size of an event buffer: 2 byte header + 255 bytes of parameters
pub const HCI_EVT_BUF_SIZE: usize = 2 + 255;

/// HCI command header length (opcode + parameter length)
pub const HCI_CMD_HEADER_SIZE: usize = 3;

/// HCI event header length (event code + parameter length)
pub const HCI_EVT_HEADER_SIZE: usize = 2;

/// HCI ACL header length (handle/flags + data length)
pub const HCI_ACL_HEADER_SIZE: usize = 4;

/// L2CAP basic header length (PDU length + CID)
pub const L2CAP_HEADER_SIZE: usize = 4;

/// L2CAP SDU length prefix carried by the first PDU of an LE credit based SDU
pub const L2CAP_SDU_HEADER_SIZE: usize = 2;

/// Minimum MTU/MPS for LE credit based channels
pub const L2CAP_LE_MIN_MTU: u16 = 23;

/// First CID of the LE dynamic range
pub const L2CAP_LE_DYN_CID_START: u16 = 0x0040;

/// Last CID of the LE dynamic range
pub const L2CAP_LE_DYN_CID_END: u16 = 0x007F;

/// First CID of the BR/EDR dynamic range
pub const L2CAP_BR_DYN_CID_START: u16 = 0x0040;

/// Last CID of the BR/EDR dynamic range
pub const L2CAP_BR_DYN_CID_END: u16 = 0xFFFF;

/// Lowest LE PSM
pub const L2CAP_LE_PSM_START: u16 = 0x0001;

/// Highest LE PSM
pub const L2CAP_LE_PSM_END: u16 = 0x00FF;

/// Default ATT MTU
pub const ATT_DEFAULT_MTU: u16 = 23;

/// Largest ATT MTU this stack will negotiate
pub const ATT_MAX_MTU: usize = 247;

/// Scan interval used while reconnecting, fast (N * 0.625 ms)
pub const GAP_SCAN_FAST_INTERVAL: u16 = 0x0060;

/// Scan window used while reconnecting, fast (N * 0.625 ms)
pub const GAP_SCAN_FAST_WINDOW: u16 = 0x0030;

/// Background scan interval (N * 0.625 ms)
pub const GAP_SCAN_SLOW_INTERVAL: u16 = 0x0800;

/// Background scan window (N * 0.625 ms)
pub const GAP_SCAN_SLOW_WINDOW: u16 = 0x0012;

/// Default minimum connection interval (N * 1.25 ms)
pub const GAP_INIT_CONN_INT_MIN: u16 = 0x0018;

/// Default maximum connection interval (N * 1.25 ms)
pub const GAP_INIT_CONN_INT_MAX: u16 = 0x0028;

/// Default supervision timeout (N * 10 ms)
pub const GAP_DEFAULT_SUPERVISION_TIMEOUT: u16 = 0x002A;

/// Maximum length of advertising or scan response data
pub const MAX_AD_LEN: usize = 31;

/// Number of LE Rand commands used to seed the random generator
pub const RNG_SEED_ROUNDS: usize = 4;

/// Output volume in bytes after which the random generator is reseeded
pub const RNG_RESEED_INTERVAL: usize = 1 << 16;
