// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Datagram codec for peer messages.
//!
//! Transport is an opaque unreliable datagram boundary (UDP, ICE, whatever
//! the platform provides); none of that enters this crate. Per
//! `(player, frame)` the receiver applies last-writer-wins, and any arrival
//! order is legal.
//!
//! Layout (little-endian, no padding):
//!
//! ```text
//! InputMsg: kind:u8 (1) | player:u8 | frame:u32 | input_bytes[48]
//! HashMsg:  kind:u8 (2) | player:u8 | frame:u32 | hash:u64
//! ```

use bytemuck::Zeroable;
use tempo_core::{PlayerInput, INPUT_BYTES};
use thiserror::Error;

const KIND_INPUT: u8 = 1;
const KIND_HASH: u8 = 2;

const HEADER_LEN: usize = 1 + 1 + 4;

/// A confirmed input for one `(player, frame)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputMsg {
    /// Originating player slot.
    pub player: u8,
    /// Frame the input applies to.
    pub frame: u32,
    /// The input value.
    pub input: PlayerInput,
}

/// A frame hash report for desync detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashMsg {
    /// Originating player slot.
    pub player: u8,
    /// Frame the hash commits to.
    pub frame: u32,
    /// 64-bit frame hash.
    pub hash: u64,
}

/// Any peer datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Msg {
    /// Confirmed input.
    Input(InputMsg),
    /// Frame hash.
    Hash(HashMsg),
}

/// Decode failures. Malformed datagrams are dropped at the boundary; they
/// never abort a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    /// The buffer is shorter than the claimed message layout.
    #[error("datagram truncated: {got} bytes, need {need}")]
    Truncated {
        /// Bytes received.
        got: usize,
        /// Bytes the layout requires.
        need: usize,
    },
    /// The kind byte is not a known message.
    #[error("unknown datagram kind {0}")]
    UnknownKind(u8),
    /// Trailing bytes after a complete message.
    #[error("datagram has {0} trailing bytes")]
    TrailingBytes(usize),
}

/// Serialize a message into a fresh datagram buffer.
#[must_use]
pub fn encode_datagram(msg: &Msg) -> Vec<u8> {
    match msg {
        Msg::Input(m) => {
            let mut out = Vec::with_capacity(HEADER_LEN + INPUT_BYTES);
            out.push(KIND_INPUT);
            out.push(m.player);
            out.extend_from_slice(&m.frame.to_le_bytes());
            out.extend_from_slice(bytemuck::bytes_of(&m.input));
            out
        }
        Msg::Hash(m) => {
            let mut out = Vec::with_capacity(HEADER_LEN + 8);
            out.push(KIND_HASH);
            out.push(m.player);
            out.extend_from_slice(&m.frame.to_le_bytes());
            out.extend_from_slice(&m.hash.to_le_bytes());
            out
        }
    }
}

/// Decode one datagram.
///
/// # Errors
///
/// Fails with [`WireError`] on truncation, an unknown kind byte, or
/// trailing garbage.
pub fn decode_datagram(bytes: &[u8]) -> Result<Msg, WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::Truncated {
            got: bytes.len(),
            need: HEADER_LEN,
        });
    }
    let kind = bytes[0];
    let player = bytes[1];
    let frame = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    let body = &bytes[HEADER_LEN..];
    match kind {
        KIND_INPUT => {
            if body.len() < INPUT_BYTES {
                return Err(WireError::Truncated {
                    got: bytes.len(),
                    need: HEADER_LEN + INPUT_BYTES,
                });
            }
            if body.len() > INPUT_BYTES {
                return Err(WireError::TrailingBytes(body.len() - INPUT_BYTES));
            }
            let mut input = PlayerInput::zeroed();
            bytemuck::bytes_of_mut(&mut input).copy_from_slice(body);
            Ok(Msg::Input(InputMsg {
                player,
                frame,
                input,
            }))
        }
        KIND_HASH => {
            if body.len() < 8 {
                return Err(WireError::Truncated {
                    got: bytes.len(),
                    need: HEADER_LEN + 8,
                });
            }
            if body.len() > 8 {
                return Err(WireError::TrailingBytes(body.len() - 8));
            }
            let hash = u64::from_le_bytes([
                body[0], body[1], body[2], body[3], body[4], body[5], body[6], body[7],
            ]);
            Ok(Msg::Hash(HashMsg {
                player,
                frame,
                hash,
            }))
        }
        other => Err(WireError::UnknownKind(other)),
    }
}
