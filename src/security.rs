//! Security and storage collaborators
//!
//! Pairing cryptography and bond persistence live outside the stack. The
//! stack calls out through these traits whenever the controller or a peer
//! needs key material, and when it needs to persist its identity.

use crate::{Address, BdAddr, ConnectionInfo, Error};

/// Key material provider
///
/// Every method has a conservative default so an application without
/// pairing support can pass a unit type.
pub trait SecurityManager {
    /// A fresh resolvable private address for advertising or initiating
    fn resolvable_private_address(&self) -> Option<BdAddr> {
        None
    }

    /// Long-term key for an LE link, looked up by the peer and the
    /// `rand`/`ediv` values of the controller's request
    fn long_term_key(&self, conn: &ConnectionInfo, rand: u64, ediv: u16) -> Option<[u8; 16]> {
        let _ = (conn, rand, ediv);
        None
    }

    /// Link key for a BR/EDR peer
    fn link_key(&self, peer: &BdAddr) -> Option<[u8; 16]> {
        let _ = peer;
        None
    }

    /// The controller created a new BR/EDR link key
    fn link_key_created(&self, peer: &BdAddr, key: &[u8; 16], key_type: u8) {
        let _ = (peer, key, key_type);
    }

    /// Size in bytes of the encryption key in use on a link
    fn encryption_key_size(&self, conn: &ConnectionInfo) -> u8 {
        let _ = conn;
        16
    }

    /// True if keys are stored for this peer
    fn is_bonded(&self, peer: &Address) -> bool {
        let _ = peer;
        false
    }
}

impl SecurityManager for () {}

/// Identifies a persisted value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageKey {
    /// Static random identity address (6 bytes)
    IdentityAddress,
    /// Local identity resolving key (16 bytes)
    IdentityResolvingKey,
}

/// Read/write-by-key persistence
pub trait KeyStore {
    /// Copy the stored value into `out`, returning its length, or `None` if absent
    fn read(&self, key: StorageKey, out: &mut [u8]) -> Option<usize>;

    /// Persist a value
    ///
    /// # Errors
    /// Returns [`Error::NoResources`] if the store is full
    fn write(&self, key: StorageKey, value: &[u8]) -> Result<(), Error>;
}
