// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Deterministic pseudo-random sequence (SplitMix64 finalizer).
//!
//! Used for seed-fixed test data and match seeding. Systems may only use a
//! `Prng` whose state lives in a snapshotted singleton row; anything else
//! would diverge across rollback replays.

/// SplitMix64 generator. Sequences are fixed by the seed alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prng {
    state: u64,
}

impl Prng {
    /// Construct from a seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next 64-bit value.
    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    /// Next value in `0..bound` (`0` when `bound` is zero).
    ///
    /// Plain modulo: the tiny bias is irrelevant for test data and the
    /// mapping stays trivially portable.
    pub fn next_below(&mut self, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        self.next_u64() % bound
    }

    /// Next signed value in `-bound..=bound`.
    pub fn next_signed(&mut self, bound: i64) -> i64 {
        if bound <= 0 {
            return 0;
        }
        let span = u64::try_from(bound).unwrap_or(0) * 2 + 1;
        let v = self.next_below(span);
        i64::try_from(v).unwrap_or(0) - bound
    }

    /// Raw generator state, for serialization into a singleton row.
    #[must_use]
    pub fn state(&self) -> u64 {
        self.state
    }
}
