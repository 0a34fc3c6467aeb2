// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Deterministic state hashing.
//!
//! Per table, a 64-bit digest commits to `meta || slab` — a BLAKE3 hash over
//! the canonical snapshot bytes, truncated to the first eight bytes
//! little-endian. The frame hash mixes the per-table digests **in declared
//! table order** under a domain-separated BLAKE3. The mixing function is
//! identified by [`HASH_MIX_ID`], fixed at match start and recorded in the
//! replay header.
//!
//! Hash output is defined only by the byte sequence; no endian-sensitive
//! reinterpretation of row contents happens anywhere on this path.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::world::World;

/// Identifier of the frame-hash mixing function (recorded in replays).
pub const HASH_MIX_ID: u8 = 1;

/// Frames of `(frame, hash)` history retained for desync comparison.
pub const HASH_HISTORY_FRAMES: usize = 64;

fn truncate64(digest: &blake3::Hash) -> u64 {
    let b = digest.as_bytes();
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// 64-bit digest over one table's `meta || slab` bytes.
#[must_use]
pub fn table_hash(meta: &[u8], slab: &[u8]) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"tempo:table-hash:v1");
    hasher.update(&(meta.len() as u64).to_le_bytes());
    hasher.update(meta);
    hasher.update(&(slab.len() as u64).to_le_bytes());
    hasher.update(slab);
    truncate64(&hasher.finalize())
}

/// Frame hash: mixes per-table digests in declared order.
///
/// `scratch` is reused between calls so the per-tick path performs no
/// allocation once warmed.
#[must_use]
pub fn world_hash(world: &World, scratch: &mut Vec<u8>) -> u64 {
    let mut mixer = blake3::Hasher::new();
    mixer.update(b"tempo:frame-hash:v1");
    mixer.update(&world.current_frame().to_le_bytes());
    for table in world.tables() {
        scratch.clear();
        table.write_meta(scratch);
        let h = table_hash(scratch, table.slab());
        mixer.update(&h.to_le_bytes());
    }
    truncate64(&mixer.finalize())
}

/// Ring of recent `(frame, hash)` pairs.
///
/// The tick thread is the only writer. The most recent entry is additionally
/// published through atomics so a background comparison task can read it
/// without taking a lock: the hash is stored first, then the frame number
/// with `Release`; a reader that observes the frame with `Acquire` therefore
/// observes the matching hash. Frames are monotonic, so a stale pair can
/// never masquerade as a newer one.
pub struct HashHistory {
    /// Slot `frame % len`; an unoccupied slot holds frame `u64::MAX`.
    entries: Vec<(u64, u64)>,
    latest_hash: AtomicU64,
    latest_frame: AtomicU64,
}

impl Default for HashHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl HashHistory {
    /// Empty history.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: vec![(u64::MAX, 0); HASH_HISTORY_FRAMES],
            latest_hash: AtomicU64::new(0),
            latest_frame: AtomicU64::new(u64::MAX),
        }
    }

    /// Record the hash for `frame`, overwriting any entry already present
    /// (rollback replay corrects mispredicted frames in place).
    pub fn record(&mut self, frame: u64, hash: u64) {
        let at = usize::try_from(frame).unwrap_or(0) % self.entries.len();
        self.entries[at] = (frame, hash);
        self.latest_hash.store(hash, Ordering::Relaxed);
        self.latest_frame.store(frame, Ordering::Release);
    }

    /// Hash recorded for `frame`, if still retained.
    #[must_use]
    pub fn get(&self, frame: u64) -> Option<u64> {
        let at = usize::try_from(frame).unwrap_or(0) % self.entries.len();
        let (f, h) = self.entries[at];
        (f == frame).then_some(h)
    }

    /// Most recently recorded `(frame, hash)`, readable across threads.
    #[must_use]
    pub fn latest(&self) -> Option<(u64, u64)> {
        let frame = self.latest_frame.load(Ordering::Acquire);
        if frame == u64::MAX {
            return None;
        }
        Some((frame, self.latest_hash.load(Ordering::Relaxed)))
    }

    /// Retained `(frame, hash)` pairs at or below `upto`, oldest first,
    /// capped at `limit` entries.
    #[must_use]
    pub fn tail(&self, upto: u64, limit: usize) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        let first = upto.saturating_sub(u64::try_from(limit.saturating_sub(1)).unwrap_or(0));
        for frame in first..=upto {
            if let Some(h) = self.get(frame) {
                out.push((frame, h));
            }
        }
        out
    }

    /// Forget everything (match reset).
    pub fn clear(&mut self) {
        for e in &mut self.entries {
            *e = (u64::MAX, 0);
        }
        self.latest_frame.store(u64::MAX, Ordering::Release);
        self.latest_hash.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::KindId;
    use crate::table::{Eviction, Row};
    use crate::world::WorldBuilder;
    use bytemuck::{Pod, Zeroable};

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
    struct Blob {
        a: u64,
        b: u64,
    }

    impl Row for Blob {
        const NAME: &'static str = "blob";
        const KIND: KindId = 94;
    }

    #[test]
    fn table_hash_is_byte_sensitive() {
        let base = table_hash(&[1, 2, 3], &[4, 5, 6]);
        assert_ne!(base, table_hash(&[1, 2, 3], &[4, 5, 7]));
        assert_ne!(base, table_hash(&[1, 2, 4], &[4, 5, 6]));
        // Moving a byte across the meta/slab boundary must change the hash.
        assert_ne!(base, table_hash(&[1, 2, 3, 4], &[5, 6]));
    }

    #[test]
    fn world_hash_tracks_row_mutation() {
        let mut b = WorldBuilder::new();
        b.register::<Blob>(4, None, Eviction::None);
        let mut world = b.build();
        let mut scratch = Vec::new();

        let empty = world_hash(&world, &mut scratch);
        assert!(world.table_mut::<Blob>().allocate().is_ok());
        let one = world_hash(&world, &mut scratch);
        assert_ne!(empty, one);

        world.table_mut::<Blob>().rows_mut()[0].a = 5;
        let mutated = world_hash(&world, &mut scratch);
        assert_ne!(one, mutated);
    }

    #[test]
    fn world_hash_depends_on_frame_number() {
        let mut b = WorldBuilder::new();
        b.register::<Blob>(4, None, Eviction::None);
        let mut world = b.build();
        let mut scratch = Vec::new();
        let f0 = world_hash(&world, &mut scratch);
        world.advance_frame();
        let f1 = world_hash(&world, &mut scratch);
        assert_ne!(f0, f1);
    }

    #[test]
    fn history_records_and_overwrites() {
        let mut h = HashHistory::new();
        h.record(10, 111);
        h.record(11, 222);
        assert_eq!(h.get(10), Some(111));
        assert_eq!(h.get(11), Some(222));
        assert_eq!(h.latest(), Some((11, 222)));

        // Rollback replay rewrites frame 10.
        h.record(10, 333);
        assert_eq!(h.get(10), Some(333));
    }

    #[test]
    fn history_forgets_beyond_retention() {
        let mut h = HashHistory::new();
        for f in 0..(HASH_HISTORY_FRAMES as u64 + 4) {
            h.record(f, f * 10);
        }
        assert_eq!(h.get(0), None, "evicted by the wrap");
        let newest = HASH_HISTORY_FRAMES as u64 + 3;
        assert_eq!(h.get(newest), Some(newest * 10));
    }

    #[test]
    fn tail_returns_oldest_first() {
        let mut h = HashHistory::new();
        for f in 0..32_u64 {
            h.record(f, f);
        }
        let t = h.tail(31, 4);
        assert_eq!(t, vec![(28, 28), (29, 29), (30, 30), (31, 31)]);
    }
}
