// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Variable-layout snapshot codec and the snapshot ring.
//!
//! Determinism contract
//! - A snapshot is a canonical byte stream: an 16-byte preamble (schema
//!   digest + frame number), then for every table **in declared order** its
//!   fixed-size `meta` followed by the variable `slab`
//!   (`count * row_size` bytes). Rows are blittable, so each slab copy is a
//!   single memcpy on any platform.
//! - Little-endian is used for every length and counter field; changing
//!   endianness would change snapshot bytes and hashes and must be treated
//!   as a breaking change.
//! - Restore verifies the embedded schema digest first and fails with
//!   [`SnapshotError::SchemaMismatch`] before touching any table.
//! - Spatial indices (the engine's only derived caches) are never
//!   captured; restore marks them dirty and the next tick rebuilds them.

use thiserror::Error;

use crate::world::World;

/// Failures in snapshot save/restore and ring lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// The snapshot was produced by a different table declaration.
    #[error("schema digest mismatch: snapshot {found:#010x}, world {expected:#010x}")]
    SchemaMismatch {
        /// Digest the current world declares.
        expected: u32,
        /// Digest embedded in the snapshot bytes.
        found: u32,
    },
    /// The byte stream is shorter than its own framing claims.
    #[error("snapshot truncated while reading {0}")]
    Truncated(&'static str),
    /// A table rejected its meta or slab bytes.
    #[error("snapshot rejected by table `{0}`")]
    TableRejected(&'static str),
    /// The ring holds no snapshot at or before the requested frame.
    #[error("no snapshot at or before frame {0}")]
    Miss(u64),
}

const PREAMBLE_LEN: usize = 4 + 8;

/// Serialize the snapshotted subset of `world` into `out` (cleared first).
pub fn save_world(world: &World, out: &mut Vec<u8>) {
    out.clear();
    out.extend_from_slice(&world.schema_digest().to_le_bytes());
    out.extend_from_slice(&world.current_frame().to_le_bytes());
    for table in world.tables() {
        table.write_meta(out);
        out.extend_from_slice(table.slab());
    }
}

/// Restore `world` from bytes produced by [`save_world`].
///
/// On success the world's frame counter is the snapshot's frame and every
/// spatial index is flagged dirty.
///
/// # Errors
///
/// Fails without touching any table on a schema mismatch or truncated
/// preamble; fails with [`SnapshotError::TableRejected`] when a table's
/// section is malformed (state is then partially restored and the caller
/// must treat the match as lost).
pub fn restore_world(world: &mut World, bytes: &[u8]) -> Result<(), SnapshotError> {
    if bytes.len() < PREAMBLE_LEN {
        return Err(SnapshotError::Truncated("preamble"));
    }
    let found = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let expected = world.schema_digest();
    if found != expected {
        return Err(SnapshotError::SchemaMismatch { expected, found });
    }
    let frame = u64::from_le_bytes([
        bytes[4], bytes[5], bytes[6], bytes[7], bytes[8], bytes[9], bytes[10], bytes[11],
    ]);

    let mut at = PREAMBLE_LEN;
    for table in world.tables_mut() {
        let meta_len = table.meta_len();
        let Some(meta) = bytes.get(at..at + meta_len) else {
            return Err(SnapshotError::Truncated("table meta"));
        };
        if !table.read_meta(meta) {
            return Err(SnapshotError::TableRejected(table.name()));
        }
        at += meta_len;

        let slab_len = table.count() * table.row_size();
        let Some(slab) = bytes.get(at..at + slab_len) else {
            return Err(SnapshotError::Truncated("table slab"));
        };
        if !table.restore_slab(slab) {
            return Err(SnapshotError::TableRejected(table.name()));
        }
        at += slab_len;
    }

    world.set_current_frame(frame);
    world.mark_derived_dirty();
    Ok(())
}

/// One table's snapshot payload, in declared order. The file codec frames
/// these with explicit lengths; the in-memory stream concatenates them.
#[derive(Debug, Clone)]
pub struct TableSection {
    /// Table name, for diagnostics only (never part of the byte stream).
    pub name: &'static str,
    /// Fixed-size meta bytes.
    pub meta: Vec<u8>,
    /// `count * row_size` slab bytes.
    pub slab: Vec<u8>,
}

/// Split the current world state into per-table sections.
#[must_use]
pub fn save_sections(world: &World) -> Vec<TableSection> {
    world
        .tables()
        .iter()
        .map(|table| {
            let mut meta = Vec::with_capacity(table.meta_len());
            table.write_meta(&mut meta);
            TableSection {
                name: table.name(),
                meta,
                slab: table.slab().to_vec(),
            }
        })
        .collect()
}

/// Reassemble the in-memory snapshot stream from its parts (the inverse of
/// the file codec's framing). The result feeds [`restore_world`].
#[must_use]
pub fn assemble_snapshot(digest: u32, frame: u64, sections: &[TableSection]) -> Vec<u8> {
    let body: usize = sections.iter().map(|s| s.meta.len() + s.slab.len()).sum();
    let mut out = Vec::with_capacity(PREAMBLE_LEN + body);
    out.extend_from_slice(&digest.to_le_bytes());
    out.extend_from_slice(&frame.to_le_bytes());
    for section in sections {
        out.extend_from_slice(&section.meta);
        out.extend_from_slice(&section.slab);
    }
    out
}

/// Worst-case snapshot size for `world`: the preamble plus every table at
/// capacity. Ring slots are provisioned at this size once, up front.
#[must_use]
pub fn max_snapshot_bytes(world: &World) -> usize {
    PREAMBLE_LEN
        + world
            .tables()
            .iter()
            .map(|t| t.meta_len() + t.capacity() * t.row_size())
            .sum::<usize>()
}

struct Slot {
    frame: u64,
    /// Actual encoded length; the buffer keeps worst-case capacity.
    bytes: Vec<u8>,
    occupied: bool,
}

/// Fixed-capacity ring of frame snapshots.
///
/// Slot `frame % capacity` always holds the snapshot whose `frame` field
/// matches, so replay overwrites mispredicted snapshots in place and the
/// `snapshot[s].frame == s` invariant survives rollback.
pub struct SnapshotRing {
    slots: Vec<Slot>,
}

impl SnapshotRing {
    /// Ring with `capacity` slots, each provisioned for `max_bytes`.
    #[must_use]
    pub fn new(capacity: usize, max_bytes: usize) -> Self {
        debug_assert!(capacity > 0);
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                frame: 0,
                bytes: Vec::with_capacity(max_bytes),
                occupied: false,
            });
        }
        Self { slots }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Capture `world` into the slot for its current frame.
    pub fn store(&mut self, world: &World) {
        let frame = world.current_frame();
        let at = usize::try_from(frame).unwrap_or(0) % self.slots.len();
        let slot = &mut self.slots[at];
        save_world(world, &mut slot.bytes);
        slot.frame = frame;
        slot.occupied = true;
    }

    /// Bytes of the newest stored snapshot with `frame <= target`.
    ///
    /// # Errors
    ///
    /// Fails with [`SnapshotError::Miss`] when nothing that old survives in
    /// the ring.
    pub fn latest_at_or_before(&self, target: u64) -> Result<(u64, &[u8]), SnapshotError> {
        let mut best: Option<&Slot> = None;
        for slot in &self.slots {
            if slot.occupied && slot.frame <= target {
                best = match best {
                    Some(b) if b.frame >= slot.frame => Some(b),
                    _ => Some(slot),
                };
            }
        }
        best.map(|s| (s.frame, s.bytes.as_slice()))
            .ok_or(SnapshotError::Miss(target))
    }

    /// Bytes of the snapshot for exactly `frame`, if the ring still holds it.
    ///
    /// # Errors
    ///
    /// Fails with [`SnapshotError::Miss`] when the slot was overwritten or
    /// never filled.
    pub fn exact(&self, frame: u64) -> Result<&[u8], SnapshotError> {
        let at = usize::try_from(frame).unwrap_or(0) % self.slots.len();
        let slot = &self.slots[at];
        if slot.occupied && slot.frame == frame {
            Ok(&slot.bytes)
        } else {
            Err(SnapshotError::Miss(frame))
        }
    }

    /// Drop every stored snapshot (match reset).
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.occupied = false;
            slot.bytes.clear();
        }
    }
}
