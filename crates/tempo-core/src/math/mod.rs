// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Deterministic math for the simulation core.
//!
//! Everything in this module is a pure function of raw integer inputs. The
//! simulation never touches platform floating point; results are bit-identical
//! on every target for the same raw operands.

mod fixed;
mod prng;
mod trig;

pub use fixed::{Fixed, Fixed2, MathError};
pub use prng::Prng;
