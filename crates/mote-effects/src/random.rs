//! Random effect handler
//!
//! Token bytes come from a `StdRng` seeded once from the operating system.
//! Deterministic sources for tests live in `mote-testkit`.

use mote_core::effects::RandomEffects;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Operating-system seeded random source
#[derive(Debug, Clone)]
pub struct OsRandom {
    rng: StdRng,
}

impl Default for OsRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl OsRandom {
    /// Seed a new generator from OS entropy
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl RandomEffects for OsRandom {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest);
    }
}
