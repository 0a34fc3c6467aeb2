// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Replay file codec.
//!
//! Layout (little-endian throughout):
//!
//! ```text
//! magic "REPL" (4)
//! version:u32
//! session_seed:u32
//! start_frame:u32
//! hash_mix_id:u8          frame-hash mixing function identifier
//! per_system_depth:u8     per-system hash retention, fixed at match start
//! player_count:u8
//! reserved:u8             zero
//! snapshot_len:u32 | snapshot container bytes (see `snapshot_file`)
//! per frame, ascending:
//!   frame:u32 | input_count:u8 | (player:u8 | input_bytes[48]) x count | hash:u64
//! footer:
//!   crc32 over every preceding byte
//! ```
//!
//! End-of-match is implicit: records run to the footer. The mixing id and
//! retention depth ride in the header because both are free design choices
//! that must be pinned for the whole match.

use std::io::{self, Write};

use bytemuck::Zeroable;
use tempo_core::{PlayerInput, INPUT_BYTES};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"REPL";
/// Current replay format version.
pub const REPLAY_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 4 + 4;

/// Fixed per-match parameters recorded up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayHeader {
    /// Match seed.
    pub session_seed: u32,
    /// Frame the embedded snapshot captures; records start here.
    pub start_frame: u32,
    /// Frame-hash mixing function identifier ([`tempo_core::HASH_MIX_ID`]).
    pub hash_mix_id: u8,
    /// Per-system hash retention depth.
    pub per_system_depth: u8,
    /// Active player slots.
    pub player_count: u8,
}

/// One recorded frame: the confirmed inputs that landed on it and the hash
/// the recorder computed after executing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRecord {
    /// Frame number.
    pub frame: u32,
    /// `(player, input)` pairs; players without an entry had empty input.
    pub inputs: Vec<(u8, PlayerInput)>,
    /// Frame hash after execution.
    pub hash: u64,
}

/// Replay parsing failures.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// Missing or wrong magic bytes.
    #[error("not a replay file (bad magic)")]
    BadMagic,
    /// Version this build does not read.
    #[error("unsupported replay version {0}")]
    UnsupportedVersion(u32),
    /// Stream ended inside a claimed structure.
    #[error("replay truncated while reading {0}")]
    Truncated(&'static str),
    /// Footer checksum mismatch.
    #[error("replay checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// crc32 stored in the footer.
        stored: u32,
        /// crc32 computed over the payload.
        computed: u32,
    },
    /// Underlying sink failure while writing.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Streaming replay writer; checksums everything it emits.
pub struct ReplayWriter<W: Write> {
    sink: W,
    crc: crc32fast::Hasher,
}

impl<W: Write> ReplayWriter<W> {
    /// Write the header and starting snapshot, returning the open writer.
    ///
    /// # Errors
    ///
    /// Propagates sink I/O failures.
    pub fn create(
        sink: W,
        header: &ReplayHeader,
        snapshot_container: &[u8],
    ) -> Result<Self, ReplayError> {
        let mut writer = Self {
            sink,
            crc: crc32fast::Hasher::new(),
        };
        let mut head = Vec::with_capacity(HEADER_LEN);
        head.extend_from_slice(MAGIC);
        head.extend_from_slice(&REPLAY_VERSION.to_le_bytes());
        head.extend_from_slice(&header.session_seed.to_le_bytes());
        head.extend_from_slice(&header.start_frame.to_le_bytes());
        head.push(header.hash_mix_id);
        head.push(header.per_system_depth);
        head.push(header.player_count);
        head.push(0);
        writer.emit(&head)?;
        writer.emit(&(snapshot_container.len() as u32).to_le_bytes())?;
        writer.emit(snapshot_container)?;
        Ok(writer)
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<(), ReplayError> {
        self.crc.update(bytes);
        self.sink.write_all(bytes)?;
        Ok(())
    }

    /// Append one frame record. Frames must be appended in ascending order;
    /// the reader trusts the recording order.
    ///
    /// # Errors
    ///
    /// Propagates sink I/O failures.
    pub fn write_frame(&mut self, record: &FrameRecord) -> Result<(), ReplayError> {
        let mut buf = Vec::with_capacity(4 + 1 + record.inputs.len() * (1 + INPUT_BYTES) + 8);
        buf.extend_from_slice(&record.frame.to_le_bytes());
        buf.push(u8::try_from(record.inputs.len()).unwrap_or(u8::MAX));
        for (player, input) in &record.inputs {
            buf.push(*player);
            buf.extend_from_slice(bytemuck::bytes_of(input));
        }
        buf.extend_from_slice(&record.hash.to_le_bytes());
        self.emit(&buf)
    }

    /// Write the crc footer and hand back the sink.
    ///
    /// # Errors
    ///
    /// Propagates sink I/O failures.
    pub fn finish(mut self) -> Result<W, ReplayError> {
        let crc = self.crc.clone().finalize();
        self.sink.write_all(&crc.to_le_bytes())?;
        self.sink.flush()?;
        Ok(self.sink)
    }
}

/// In-memory replay reader over a fully loaded file.
pub struct ReplayReader<'a> {
    header: ReplayHeader,
    snapshot: &'a [u8],
    records: &'a [u8],
    at: usize,
}

impl<'a> ReplayReader<'a> {
    /// Verify magic, version, and checksum, and position at the first
    /// record.
    ///
    /// # Errors
    ///
    /// Fails with [`ReplayError`] on any structural problem.
    pub fn open(bytes: &'a [u8]) -> Result<Self, ReplayError> {
        if bytes.len() < HEADER_LEN + 4 + 4 {
            return Err(ReplayError::Truncated("header"));
        }
        if &bytes[0..4] != MAGIC {
            return Err(ReplayError::BadMagic);
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
            return Err(ReplayError::ChecksumMismatch { stored, computed });
        }

        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != REPLAY_VERSION {
            return Err(ReplayError::UnsupportedVersion(version));
        }
        let session_seed = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let start_frame = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        let header = ReplayHeader {
            session_seed,
            start_frame,
            hash_mix_id: bytes[16],
            per_system_depth: bytes[17],
            player_count: bytes[18],
        };

        let snap_len =
            u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]) as usize;
        let snap_start = HEADER_LEN + 4;
        let snap_end = snap_start
            .checked_add(snap_len)
            .ok_or(ReplayError::Truncated("snapshot"))?;
        if snap_end > payload_len {
            return Err(ReplayError::Truncated("snapshot"));
        }

        Ok(Self {
            header,
            snapshot: &bytes[snap_start..snap_end],
            records: &bytes[snap_end..payload_len],
            at: 0,
        })
    }

    /// Fixed per-match parameters.
    #[must_use]
    pub fn header(&self) -> &ReplayHeader {
        &self.header
    }

    /// The embedded starting snapshot container.
    #[must_use]
    pub fn snapshot_container(&self) -> &'a [u8] {
        self.snapshot
    }

    /// Next frame record, or `None` at end of match.
    ///
    /// # Errors
    ///
    /// Fails with [`ReplayError::Truncated`] when a record is cut short.
    pub fn next_frame(&mut self) -> Result<Option<FrameRecord>, ReplayError> {
        if self.at == self.records.len() {
            return Ok(None);
        }
        let rest = &self.records[self.at..];
        if rest.len() < 5 {
            return Err(ReplayError::Truncated("record header"));
        }
        let frame = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let count = rest[4] as usize;
        let body_len = count * (1 + INPUT_BYTES);
        let need = 5 + body_len + 8;
        if rest.len() < need {
            return Err(ReplayError::Truncated("record body"));
        }

        let mut inputs = Vec::with_capacity(count);
        let mut at = 5_usize;
        for _ in 0..count {
            let player = rest[at];
            let mut input = PlayerInput::zeroed();
            bytemuck::bytes_of_mut(&mut input)
                .copy_from_slice(&rest[at + 1..at + 1 + INPUT_BYTES]);
            inputs.push((player, input));
            at += 1 + INPUT_BYTES;
        }
        let hash = u64::from_le_bytes([
            rest[at],
            rest[at + 1],
            rest[at + 2],
            rest[at + 3],
            rest[at + 4],
            rest[at + 5],
            rest[at + 6],
            rest[at + 7],
        ]);
        self.at += need;
        Ok(Some(FrameRecord {
            frame,
            inputs,
            hash,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_core::math::Fixed2;
    use tempo_core::BUTTON_MOVE;

    fn header() -> ReplayHeader {
        ReplayHeader {
            session_seed: 42,
            start_frame: 0,
            hash_mix_id: tempo_core::HASH_MIX_ID,
            per_system_depth: 16,
            player_count: 2,
        }
    }

    fn move_input(x: i64) -> PlayerInput {
        PlayerInput {
            move_target: Fixed2::from_ints(x, 0),
            buttons: BUTTON_MOVE,
            ..PlayerInput::zeroed()
        }
    }

    fn sample_records() -> Vec<FrameRecord> {
        vec![
            FrameRecord {
                frame: 0,
                inputs: vec![(0, move_input(3))],
                hash: 0x1111,
            },
            FrameRecord {
                frame: 1,
                inputs: Vec::new(),
                hash: 0x2222,
            },
            FrameRecord {
                frame: 2,
                inputs: vec![(0, move_input(-1)), (1, move_input(9))],
                hash: 0x3333,
            },
        ]
    }

    fn write_sample() -> Vec<u8> {
        let mut writer =
            ReplayWriter::create(Vec::new(), &header(), b"snapshot-bytes").expect("create failed");
        for record in sample_records() {
            writer.write_frame(&record).expect("write failed");
        }
        writer.finish().expect("finish failed")
    }

    #[test]
    fn round_trip_preserves_everything() {
        let bytes = write_sample();
        let mut reader = ReplayReader::open(&bytes).expect("open failed");
        assert_eq!(*reader.header(), header());
        assert_eq!(reader.snapshot_container(), b"snapshot-bytes");

        let mut got = Vec::new();
        while let Some(record) = reader.next_frame().expect("record read failed") {
            got.push(record);
        }
        assert_eq!(got, sample_records());
    }

    #[test]
    fn corruption_fails_the_checksum() {
        let mut bytes = write_sample();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        assert!(matches!(
            ReplayReader::open(&bytes),
            Err(ReplayError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let mut bytes = write_sample();
        bytes[0] = b'Q';
        assert!(matches!(ReplayReader::open(&bytes), Err(ReplayError::BadMagic)));

        let mut bytes = write_sample();
        bytes[4] = 99;
        // The checksum no longer matches once the version byte changes, and
        // that is the right first failure: corruption beats version here.
        assert!(ReplayReader::open(&bytes).is_err());
    }

    #[test]
    fn truncated_record_is_reported() {
        let bytes = write_sample();
        // Drop the footer and half the last record, then re-checksum so the
        // reader reaches the record parser.
        let cut = bytes.len() - 4 - 20;
        let mut truncated = bytes[..cut].to_vec();
        let crc = crc32fast::hash(&truncated);
        truncated.extend_from_slice(&crc.to_le_bytes());

        let mut reader = ReplayReader::open(&truncated).expect("open failed");
        let mut outcome = Ok(());
        loop {
            match reader.next_frame() {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        assert!(matches!(outcome, Err(ReplayError::Truncated(_))));
    }
}
