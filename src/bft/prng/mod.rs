//! A small, fast pseudo-random number generator.
//!
//! Used where randomness is needed but does not need to be
//! cryptographically secure: e.g. picking a random stable-checkpoint
//! attestant to target with a `GET_STATE` request (spec §4.5), or
//! generating synthetic request payloads in the `demos/` binaries.
//! Seeded from the OS RNG so distinct replicas in the same process don't
//! all pick the same "random" peer.

use rand_core::{OsRng, RngCore};

/// A xorshift128+ generator.
pub struct State {
    s: [u64; 2],
}

impl State {
    pub fn new() -> Self {
        let mut seed = [0u8; 16];
        OsRng.fill_bytes(&mut seed);
        let s0 = u64::from_le_bytes(seed[0..8].try_into().unwrap());
        let s1 = u64::from_le_bytes(seed[8..16].try_into().unwrap()) | 1;
        Self { s: [s0, s1] }
    }

    /// Returns the next pseudo-random `u64`.
    pub fn next_state(&mut self) -> u64 {
        let mut s1 = self.s[0];
        let s0 = self.s[1];
        let result = s0.wrapping_add(s1);
        self.s[0] = s0;
        s1 ^= s1 << 23;
        self.s[1] = s1 ^ s0 ^ (s1 >> 18) ^ (s0 >> 5);
        result
    }

    /// Returns a pseudo-random index in `[0, bound)`.
    ///
    /// Used to pick a random attestant out of the stable-checkpoint proof
    /// set (spec §4.5's state-transfer protocol).
    pub fn next_bounded(&mut self, bound: usize) -> usize {
        if bound == 0 {
            return 0;
        }
        (self.next_state() % (bound as u64)) as usize
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}
