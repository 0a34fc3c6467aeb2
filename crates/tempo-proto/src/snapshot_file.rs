// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Persisted snapshot container.
//!
//! Layout (little-endian throughout):
//!
//! ```text
//! header (32 bytes):
//!   magic   "TSNP"      (4)
//!   version u32         (4)
//!   schema  u32         (4)   BLAKE3-derived schema digest
//!   tables  u32         (4)   table count
//!   frame   u64         (8)   frame the snapshot captures
//!   reserved            (8)   zero
//! per table, in declared order:
//!   meta_len:u32 | meta | slab_len:u32 | slab
//! footer:
//!   crc32 over every preceding byte (header included)
//! ```

use tempo_core::TableSection;
use thiserror::Error;

const MAGIC: &[u8; 4] = b"TSNP";
/// Current container version.
pub const SNAPSHOT_FILE_VERSION: u32 = 1;
const HEADER_LEN: usize = 32;

/// Container-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotFileError {
    /// Missing or wrong magic bytes.
    #[error("not a snapshot file (bad magic)")]
    BadMagic,
    /// Version this build does not read.
    #[error("unsupported snapshot file version {0}")]
    UnsupportedVersion(u32),
    /// Stream ended inside a claimed structure.
    #[error("snapshot file truncated while reading {0}")]
    Truncated(&'static str),
    /// Footer checksum mismatch.
    #[error("snapshot file checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// crc32 stored in the footer.
        stored: u32,
        /// crc32 computed over the payload.
        computed: u32,
    },
}

/// Decoded container contents.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    /// Schema digest the snapshot was produced under.
    pub schema_digest: u32,
    /// Frame the snapshot captures.
    pub frame: u64,
    /// Per-table sections, in declared order.
    pub sections: Vec<TableSection>,
}

/// Serialize sections into a snapshot container.
#[must_use]
pub fn write_snapshot_file(schema_digest: u32, frame: u64, sections: &[TableSection]) -> Vec<u8> {
    let body: usize = sections.iter().map(|s| 8 + s.meta.len() + s.slab.len()).sum();
    let mut out = Vec::with_capacity(HEADER_LEN + body + 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&SNAPSHOT_FILE_VERSION.to_le_bytes());
    out.extend_from_slice(&schema_digest.to_le_bytes());
    out.extend_from_slice(&(sections.len() as u32).to_le_bytes());
    out.extend_from_slice(&frame.to_le_bytes());
    out.extend_from_slice(&[0_u8; 8]);
    debug_assert_eq!(out.len(), HEADER_LEN);

    for section in sections {
        out.extend_from_slice(&(section.meta.len() as u32).to_le_bytes());
        out.extend_from_slice(&section.meta);
        out.extend_from_slice(&(section.slab.len() as u32).to_le_bytes());
        out.extend_from_slice(&section.slab);
    }

    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

fn read_u32(bytes: &[u8], at: &mut usize, what: &'static str) -> Result<u32, SnapshotFileError> {
    let end = at.checked_add(4).ok_or(SnapshotFileError::Truncated(what))?;
    let slice = bytes
        .get(*at..end)
        .ok_or(SnapshotFileError::Truncated(what))?;
    *at = end;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_blob<'a>(
    bytes: &'a [u8],
    at: &mut usize,
    len: usize,
    what: &'static str,
) -> Result<&'a [u8], SnapshotFileError> {
    let end = at
        .checked_add(len)
        .ok_or(SnapshotFileError::Truncated(what))?;
    let slice = bytes
        .get(*at..end)
        .ok_or(SnapshotFileError::Truncated(what))?;
    *at = end;
    Ok(slice)
}

/// Parse and checksum-verify a snapshot container.
///
/// # Errors
///
/// Fails with [`SnapshotFileError`] on bad magic, unknown version,
/// truncation, or a checksum mismatch. Schema validation against a live
/// world happens later, when the snapshot is restored.
pub fn read_snapshot_file(bytes: &[u8]) -> Result<SnapshotFile, SnapshotFileError> {
    if bytes.len() < HEADER_LEN + 4 {
        return Err(SnapshotFileError::Truncated("header"));
    }
    if &bytes[0..4] != MAGIC {
        return Err(SnapshotFileError::BadMagic);
    }

    let payload_len = bytes.len() - 4;
    let stored = u32::from_le_bytes([
        bytes[payload_len],
        bytes[payload_len + 1],
        bytes[payload_len + 2],
        bytes[payload_len + 3],
    ]);
    let computed = crc32fast::hash(&bytes[..payload_len]);
    if stored != computed {
        return Err(SnapshotFileError::ChecksumMismatch { stored, computed });
    }

    let payload = &bytes[..payload_len];
    let mut at = 4_usize;
    let version = read_u32(payload, &mut at, "version")?;
    if version != SNAPSHOT_FILE_VERSION {
        return Err(SnapshotFileError::UnsupportedVersion(version));
    }
    let schema_digest = read_u32(payload, &mut at, "schema digest")?;
    let table_count = read_u32(payload, &mut at, "table count")?;
    let frame_bytes = read_blob(payload, &mut at, 8, "frame")?;
    let frame = u64::from_le_bytes([
        frame_bytes[0],
        frame_bytes[1],
        frame_bytes[2],
        frame_bytes[3],
        frame_bytes[4],
        frame_bytes[5],
        frame_bytes[6],
        frame_bytes[7],
    ]);
    let _reserved = read_blob(payload, &mut at, 8, "reserved")?;

    let mut sections = Vec::with_capacity(table_count as usize);
    for _ in 0..table_count {
        let meta_len = read_u32(payload, &mut at, "meta length")? as usize;
        let meta = read_blob(payload, &mut at, meta_len, "meta")?.to_vec();
        let slab_len = read_u32(payload, &mut at, "slab length")? as usize;
        let slab = read_blob(payload, &mut at, slab_len, "slab")?.to_vec();
        sections.push(TableSection {
            name: "",
            meta,
            slab,
        });
    }
    if at != payload.len() {
        return Err(SnapshotFileError::Truncated("trailing bytes"));
    }

    Ok(SnapshotFile {
        schema_digest,
        frame,
        sections,
    })
}
