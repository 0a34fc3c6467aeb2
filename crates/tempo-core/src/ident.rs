// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Entity identity: packed handles and the per-table identity allocator.
//!
//! A [`Handle`] packs `{flags:8, generation:16, raw_id:24, kind_id:16}` into
//! 64 bits:
//! - bits 0..16: `kind_id` (which row schema the handle refers to)
//! - bits 16..40: `raw_id` (index into the schema's identity indirection)
//! - bits 40..56: `generation` (invalidates stale copies)
//! - bits 56..64: `flags` (application-defined, never interpreted here)
//!
//! The all-zero value is [`Handle::INVALID`]. Allocated handles always carry
//! a non-zero generation, so a live handle can never equal `INVALID`.

use bytemuck::{Pod, Zeroable};

/// Identifier for a row schema (archetype).
pub type KindId = u16;

const KIND_BITS: u32 = 16;
const RAW_BITS: u32 = 24;
const GEN_BITS: u32 = 16;

const KIND_MASK: u64 = (1 << KIND_BITS) - 1;
const RAW_MASK: u64 = (1 << RAW_BITS) - 1;
const GEN_MASK: u64 = (1 << GEN_BITS) - 1;

/// Largest raw id representable in a handle.
pub(crate) const MAX_RAW_ID: u32 = (1 << RAW_BITS) - 1;

/// Packed 64-bit entity handle.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
pub struct Handle(u64);

impl core::fmt::Debug for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Handle(kind={}, raw={}, gen={}, flags={:#04x})",
            self.kind_id(),
            self.raw_id(),
            self.generation(),
            self.flags()
        )
    }
}

impl Handle {
    /// The all-zero, never-alive handle.
    pub const INVALID: Self = Self(0);

    /// Pack a handle from its fields. Out-of-range fields are masked.
    #[must_use]
    pub fn new(kind: KindId, raw_id: u32, generation: u16) -> Self {
        let bits = (u64::from(kind) & KIND_MASK)
            | ((u64::from(raw_id) & RAW_MASK) << KIND_BITS)
            | ((u64::from(generation) & GEN_MASK) << (KIND_BITS + RAW_BITS));
        Self(bits)
    }

    /// Raw 64-bit representation.
    #[must_use]
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Schema identifier.
    #[must_use]
    pub fn kind_id(self) -> KindId {
        // Masked to 16 bits.
        #[allow(clippy::cast_possible_truncation)]
        {
            (self.0 & KIND_MASK) as KindId
        }
    }

    /// Index into the schema's identity indirection.
    #[must_use]
    pub fn raw_id(self) -> u32 {
        // Masked to 24 bits.
        #[allow(clippy::cast_possible_truncation)]
        {
            ((self.0 >> KIND_BITS) & RAW_MASK) as u32
        }
    }

    /// Generation counter; zero only for `INVALID`.
    #[must_use]
    pub fn generation(self) -> u16 {
        // Masked to 16 bits.
        #[allow(clippy::cast_possible_truncation)]
        {
            ((self.0 >> (KIND_BITS + RAW_BITS)) & GEN_MASK) as u16
        }
    }

    /// Application-defined flag byte.
    #[must_use]
    pub fn flags(self) -> u8 {
        // Top byte.
        #[allow(clippy::cast_possible_truncation)]
        {
            (self.0 >> (KIND_BITS + RAW_BITS + GEN_BITS)) as u8
        }
    }

    /// Copy of this handle with the flag byte replaced.
    #[must_use]
    pub fn with_flags(self, flags: u8) -> Self {
        let low = self.0 & !(0xff << (KIND_BITS + RAW_BITS + GEN_BITS));
        Self(low | (u64::from(flags) << (KIND_BITS + RAW_BITS + GEN_BITS)))
    }

    /// Whether this is the all-zero handle.
    #[must_use]
    pub fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

/// Sentinel for "no row" in the indirection arrays.
pub(crate) const NO_ROW: i32 = -1;

/// Per-schema identity allocator: raw-id free list, generations, row map.
///
/// Every operation is a constant-time array access; the allocator never
/// iterates a hash container. All of its state is captured in table meta so
/// snapshots restore identity bit-exactly.
#[derive(Debug, Clone)]
pub struct IdentityAllocator {
    kind: KindId,
    /// `raw_id -> dense row`, `NO_ROW` while freed.
    rows: Vec<i32>,
    /// `raw_id -> generation`; bumped on free, never zero for live ids.
    generations: Vec<u16>,
    /// Intrusive free list over raw ids, disjoint from `rows`.
    next_free: Vec<i32>,
    free_head: i32,
    /// Number of raw ids handed out at least once.
    high_water: u32,
}

impl IdentityAllocator {
    /// Construct an allocator for `kind` with a fixed raw-id capacity.
    #[must_use]
    pub fn new(kind: KindId, capacity: usize) -> Self {
        debug_assert!(
            u32::try_from(capacity).map_or(false, |c| c <= MAX_RAW_ID),
            "table capacity exceeds 24-bit raw id space"
        );
        Self {
            kind,
            rows: vec![NO_ROW; capacity],
            generations: vec![1; capacity],
            next_free: vec![NO_ROW; capacity],
            free_head: NO_ROW,
            high_water: 0,
        }
    }

    /// Schema this allocator serves.
    #[must_use]
    pub fn kind(&self) -> KindId {
        self.kind
    }

    /// Allocate a raw id bound to `row`. Returns `None` when the raw-id
    /// space is exhausted (the owning table checks capacity first).
    pub(crate) fn allocate(&mut self, row: u32) -> Option<Handle> {
        let raw = if self.free_head != NO_ROW {
            let raw = u32::try_from(self.free_head).ok()?;
            self.free_head = self.next_free[raw as usize];
            self.next_free[raw as usize] = NO_ROW;
            raw
        } else {
            let raw = self.high_water;
            if raw as usize >= self.rows.len() {
                return None;
            }
            self.high_water += 1;
            raw
        };
        self.rows[raw as usize] = i32::try_from(row).unwrap_or(NO_ROW);
        Some(Handle::new(self.kind, raw, self.generations[raw as usize]))
    }

    /// Free a handle: clear the row binding, bump the generation (skipping
    /// zero), and push the raw id onto the free list.
    pub(crate) fn free(&mut self, handle: Handle) -> bool {
        if !self.is_alive(handle) {
            return false;
        }
        let raw = handle.raw_id() as usize;
        self.rows[raw] = NO_ROW;
        let next = self.generations[raw].wrapping_add(1);
        self.generations[raw] = if next == 0 { 1 } else { next };
        self.next_free[raw] = self.free_head;
        self.free_head = i32::try_from(raw).unwrap_or(NO_ROW);
        true
    }

    /// Whether `handle` refers to a live row of this schema.
    #[must_use]
    pub fn is_alive(&self, handle: Handle) -> bool {
        let raw = handle.raw_id() as usize;
        handle.kind_id() == self.kind
            && raw < self.rows.len()
            && self.rows[raw] != NO_ROW
            && self.generations[raw] == handle.generation()
    }

    /// Dense row bound to `handle`, if it is alive.
    #[must_use]
    pub fn row_of(&self, handle: Handle) -> Option<u32> {
        if self.is_alive(handle) {
            u32::try_from(self.rows[handle.raw_id() as usize]).ok()
        } else {
            None
        }
    }

    /// Rebind `raw_id` to a new dense row (row compaction on free).
    pub(crate) fn set_row(&mut self, raw_id: u32, row: u32) {
        self.rows[raw_id as usize] = i32::try_from(row).unwrap_or(NO_ROW);
    }

    /// Current generation for `raw_id`.
    pub(crate) fn generation_of(&self, raw_id: u32) -> u16 {
        self.generations[raw_id as usize]
    }

    /// Reconstruct the live handle for `raw_id`.
    pub(crate) fn handle_for(&self, raw_id: u32) -> Handle {
        Handle::new(self.kind, raw_id, self.generations[raw_id as usize])
    }

    /// Clear all bindings, rebuild an empty free list, and bump every
    /// generation so previously issued handles read as stale.
    pub(crate) fn reset(&mut self) {
        for slot in &mut self.rows {
            *slot = NO_ROW;
        }
        for slot in &mut self.next_free {
            *slot = NO_ROW;
        }
        for g in &mut self.generations {
            let next = g.wrapping_add(1);
            *g = if next == 0 { 1 } else { next };
        }
        self.free_head = NO_ROW;
        self.high_water = 0;
    }

    // ── Snapshot plumbing (table meta) ──────────────────────────────

    pub(crate) fn meta_len(&self) -> usize {
        // free_head + high_water, then rows/next_free (i32) and generations (u16).
        4 + 4 + self.rows.len() * (4 + 4 + 2)
    }

    pub(crate) fn write_meta(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.free_head.to_le_bytes());
        out.extend_from_slice(&self.high_water.to_le_bytes());
        for v in &self.rows {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in &self.next_free {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in &self.generations {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    pub(crate) fn read_meta(&mut self, bytes: &[u8]) -> Option<usize> {
        if bytes.len() < self.meta_len() {
            return None;
        }
        let mut at = 0_usize;
        let mut take4 = |buf: &[u8], at: &mut usize| {
            let v = [buf[*at], buf[*at + 1], buf[*at + 2], buf[*at + 3]];
            *at += 4;
            v
        };
        self.free_head = i32::from_le_bytes(take4(bytes, &mut at));
        self.high_water = u32::from_le_bytes(take4(bytes, &mut at));
        for slot in &mut self.rows {
            *slot = i32::from_le_bytes(take4(bytes, &mut at));
        }
        for slot in &mut self.next_free {
            *slot = i32::from_le_bytes(take4(bytes, &mut at));
        }
        for slot in &mut self.generations {
            *slot = u16::from_le_bytes([bytes[at], bytes[at + 1]]);
            at += 2;
        }
        Some(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_is_all_zero() {
        assert_eq!(Handle::INVALID.bits(), 0);
        assert!(Handle::INVALID.is_invalid());
    }

    #[test]
    fn pack_unpack_round_trips() {
        let h = Handle::new(7, 123_456, 42).with_flags(0xa5);
        assert_eq!(h.kind_id(), 7);
        assert_eq!(h.raw_id(), 123_456);
        assert_eq!(h.generation(), 42);
        assert_eq!(h.flags(), 0xa5);
    }

    #[test]
    fn allocate_free_reallocate_bumps_generation() {
        let mut alloc = IdentityAllocator::new(3, 8);
        let Some(first) = alloc.allocate(0) else {
            unreachable!("allocation failed")
        };
        assert!(alloc.is_alive(first));
        assert!(alloc.free(first));
        assert!(!alloc.is_alive(first));

        let Some(second) = alloc.allocate(0) else {
            unreachable!("reallocation failed")
        };
        assert_eq!(first.raw_id(), second.raw_id(), "free list must reuse");
        assert_ne!(first.generation(), second.generation());
        assert!(!alloc.is_alive(first), "stale handle stays dead");
        assert!(alloc.is_alive(second));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut alloc = IdentityAllocator::new(1, 4);
        let Some(h) = alloc.allocate(0) else {
            unreachable!("allocation failed")
        };
        assert!(alloc.free(h));
        assert!(!alloc.free(h));
    }

    #[test]
    fn generation_bump_skips_zero() {
        let mut alloc = IdentityAllocator::new(1, 2);
        // Force the generation to the wrap point, then free once more.
        alloc.generations[0] = u16::MAX;
        let Some(h) = alloc.allocate(0) else {
            unreachable!("allocation failed")
        };
        assert_eq!(h.generation(), u16::MAX);
        assert!(alloc.free(h));
        assert_eq!(alloc.generation_of(0), 1, "generation must skip zero");
    }

    #[test]
    fn meta_round_trip() {
        let mut alloc = IdentityAllocator::new(2, 4);
        let a = alloc.allocate(0);
        let b = alloc.allocate(1);
        assert!(a.is_some() && b.is_some());
        if let Some(h) = a {
            assert!(alloc.free(h));
        }

        let mut bytes = Vec::new();
        alloc.write_meta(&mut bytes);

        let mut other = IdentityAllocator::new(2, 4);
        assert_eq!(other.read_meta(&bytes), Some(bytes.len()));
        let mut reencoded = Vec::new();
        other.write_meta(&mut reencoded);
        assert_eq!(bytes, reencoded);
    }
}
