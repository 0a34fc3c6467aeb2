// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! tempo-proto: wire schema for Tempo peers.
//!
//! Three codecs live here, all fixed-layout little-endian binary:
//! - [`wire`]: unreliable input/hash datagrams exchanged between peers,
//! - [`snapshot_file`]: the persisted snapshot container (header, per-table
//!   sections, crc32 footer),
//! - [`replay`]: the replay file (header, starting snapshot, per-frame
//!   records, crc32 footer).
//!
//! Byte layouts are part of the cross-peer determinism boundary; changing
//! any of them is a breaking protocol change and requires a version bump.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

pub mod replay;
pub mod snapshot_file;
pub mod wire;

pub use replay::{
    FrameRecord, ReplayError, ReplayHeader, ReplayReader, ReplayWriter, REPLAY_VERSION,
};
pub use snapshot_file::{
    read_snapshot_file, write_snapshot_file, SnapshotFile, SnapshotFileError,
    SNAPSHOT_FILE_VERSION,
};
pub use wire::{decode_datagram, encode_datagram, HashMsg, InputMsg, Msg, WireError};
