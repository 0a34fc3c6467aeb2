// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! tempo-core: deterministic lockstep simulation core with rollback netcode.
//!
//! The core maintains an authoritative world state that advances one
//! fixed-size tick at a time, accepts per-player inputs with bounded delay,
//! saves periodic snapshots, detects cross-peer divergence via state hashing,
//! and resimulates previously executed frames whenever a late-arriving
//! confirmed input invalidates a prediction.
//!
//! Determinism contract
//! - Simulation state is built exclusively from fixed-point integers and
//!   blittable rows; no floating point, no hash-container iteration, no
//!   wall-clock reads anywhere on a simulated path.
//! - For a given sequence of `(frame, confirmed_inputs)` pairs, every peer
//!   produces the same sequence of frame hashes, regardless of how many
//!   rollback-and-replay interleavings occurred along the way.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::use_self
)]

/// Deterministic math subsystem (Fixed, Fixed2, trig, PRNG).
pub mod math;

/// Demo world showcasing every table mode; used by tests and the replayer.
pub mod demo;

mod desync;
mod engine;
mod export;
mod hash;
mod ident;
mod input;
mod pipeline;
mod snapshot;
mod table;
mod world;

/// Desync detection: hash comparison, parking, single-slot mailbox.
pub use desync::{DesyncDetector, DesyncInfo};
/// Rollback engine facade and tick outcomes.
pub use engine::{Engine, EngineConfig, TickFault, TickOutcome, PER_SYSTEM_DEPTH};
/// Diagnostic bundle export for a diverged frame.
pub use export::{export_debug_bundle, DebugBundle};
/// Frame hashing and hash history.
pub use hash::{world_hash, HashHistory, HASH_MIX_ID};
/// Packed entity handles and the identity allocator.
pub use ident::{Handle, IdentityAllocator, KindId};
/// Per-frame, per-player input storage.
pub use input::{
    FrameInputs, InputError, InputRing, PlayerInput, BUTTON_ATTACK, BUTTON_MOVE, INPUT_BYTES,
    INPUT_RING_FRAMES, MAX_PLAYERS,
};
/// Ordered system list with structural-change playback.
pub use pipeline::{Pipeline, SystemFn};
/// Snapshot codec and ring.
pub use snapshot::{
    assemble_snapshot, save_sections, SnapshotError, SnapshotRing, TableSection,
};
/// Archetype row tables with spatial indexing and deferred structural changes.
pub use table::{
    Eviction, GridSpec, QueryOutcome, Row, SpatialSpec, Table, TableError,
};
/// World container: ordered tables plus auto-allocated singletons.
pub use world::{TableKey, World, WorldBuilder};
