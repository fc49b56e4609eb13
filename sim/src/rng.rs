//! The deterministic random provider.
//!
//! Seeded once per run; every draw advances the stream, and per-organism
//! generators are derived from the organism id and the provider state so a
//! replay from the same seed reproduces every decision.

use primordia_error::{Error, ErrorKind};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

const ORGANISM_SALT: u64 = 0x9E37_79B9_7F4A_7C15;

/// Deterministic random source owned by the simulation.
pub struct DeterministicRandom {
    rng: ChaCha8Rng,
}

impl DeterministicRandom {
    /// Creates a provider from the run seed.
    pub fn seeded(seed: i64) -> DeterministicRandom {
        DeterministicRandom {
            rng: ChaCha8Rng::seed_from_u64(seed as u64),
        }
    }

    /// Next raw draw.
    pub fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    /// Uniform draw in `[0, bound)`.
    pub fn next_below(&mut self, bound: u64) -> u64 {
        debug_assert!(bound > 0);
        self.rng.gen_range(0..bound)
    }

    /// Derives a generator for one organism from (id, provider state). The
    /// derivation itself advances the provider, so repeated calls differ.
    pub fn for_organism(&mut self, organism_id: u32) -> ChaCha8Rng {
        let base = self.next_u64();
        ChaCha8Rng::seed_from_u64(base ^ u64::from(organism_id).wrapping_mul(ORGANISM_SALT))
    }

    /// Serializes the provider state for the sampled-tick record.
    pub fn state_bytes(&self) -> Vec<u8> {
        bincode::serialize(&self.rng).expect("rng state serializes")
    }

    /// Restores a provider from captured state bytes.
    pub fn from_state_bytes(bytes: &[u8]) -> Result<DeterministicRandom, Error> {
        let rng = bincode::deserialize(bytes)
            .map_err(|e| ErrorKind::DeserializationFailed.other(format!("rng state: {}", e)))?;
        Ok(DeterministicRandom { rng })
    }
}
