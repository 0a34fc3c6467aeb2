// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! tempo-cli: replay verification library behind the `tempo-replay` binary.
//!
//! The logic lives here rather than in `main.rs` so integration tests can
//! drive verification (and record fixture replays) in-process.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

pub mod replayer;
