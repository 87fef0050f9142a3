//! Host random number generator
//!
//! A ChaCha20 stream seeded with 32 bytes gathered from the controller's
//! LE Rand command. The stream is reseeded after [`RNG_RESEED_INTERVAL`]
//! bytes of output.

use rand_chacha::ChaCha20Rng;
use bt_hci::cmd::le::LeRand;
use rand_core::{RngCore, SeedableRng};

use super::Stack;
use crate::Error;
use crate::constants::{RNG_RESEED_INTERVAL, RNG_SEED_ROUNDS};

const LE_RAND_LEN: usize = 8;

const _: () = assert!(RNG_SEED_ROUNDS * LE_RAND_LEN == 32);

pub(crate) struct HostRng {
    rng: ChaCha20Rng,
    produced: usize,
}

impl HostRng {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: ChaCha20Rng::from_seed(seed),
            produced: 0,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.produced >= RNG_RESEED_INTERVAL
    }

    pub fn fill(&mut self, out: &mut [u8]) {
        self.rng.fill_bytes(out);
        self.produced = self.produced.saturating_add(out.len());
    }
}

impl Stack<'_> {
    /// Fill `out` with random bytes
    ///
    /// The first call, and every call after the generator ran out, seeds it
    /// from the controller.
    ///
    /// # Errors
    /// Returns [`Error::Hci`] if the controller failed an LE Rand command
    pub async fn random_bytes(&self, out: &mut [u8]) -> Result<(), Error> {
        let ready = self
            .rng
            .lock(|rng| rng.borrow().as_ref().is_some_and(|r| !r.exhausted()));
        if !ready {
            let seed = self.gather_seed().await?;
            debug!("[HCI] random generator seeded");
            self.rng
                .lock(|rng| *rng.borrow_mut() = Some(HostRng::from_seed(seed)));
        }

        self.rng.lock(|rng| match rng.borrow_mut().as_mut() {
            Some(rng) => {
                rng.fill(out);
                Ok(())
            }
            None => Err(Error::InvalidState),
        })
    }

    async fn gather_seed(&self) -> Result<[u8; 32], Error> {
        let mut seed = [0u8; 32];
        for chunk in seed.chunks_exact_mut(LE_RAND_LEN) {
            let params = self.exec(&LeRand::new()).await?.ok_or(Error::InvalidPacket)?;
            let random = params.data().get(..LE_RAND_LEN).ok_or(Error::InvalidPacket)?;
            chunk.copy_from_slice(random);
        }
        Ok(seed)
    }
}
