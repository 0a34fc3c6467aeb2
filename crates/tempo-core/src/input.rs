// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Per-frame, per-player input storage with predict/confirm tracking.
//!
//! The ring stores `input[frame][player]` in a preallocated 2-D array.
//! Slots are tagged empty, predicted, or confirmed. When a remote
//! confirmation lands on a slot that was predicted differently, the ring
//! records the earliest such frame; the rollback manager consumes it and
//! resimulates from there.

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::math::Fixed2;

/// Maximum players per match.
pub const MAX_PLAYERS: usize = 8;

/// Frames retained per player. Must exceed the snapshot ring span plus the
/// maximum predicted lookahead so every frame inside the rollback budget is
/// still comparable.
pub const INPUT_RING_FRAMES: usize = 64;

/// Button bit: issue a move order toward `move_target`.
pub const BUTTON_MOVE: u32 = 1 << 0;
/// Button bit: attack the nearest enemy in range.
pub const BUTTON_ATTACK: u32 = 1 << 1;

/// One player's input for one frame. Fixed layout, blittable, 48 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PlayerInput {
    /// Move-order target position (Q32.32 pair).
    pub move_target: Fixed2,
    /// Aim/attack direction target (Q32.32 pair).
    pub aim_target: Fixed2,
    /// Button bitmask (`BUTTON_*`).
    pub buttons: u32,
    /// Net change to the player's selection set.
    pub selection_delta: i32,
    /// Requested building kind; zero means no build request.
    pub build_kind: u16,
    /// Reserved; always zero.
    pub flags: u16,
    /// Reserved; always zero.
    pub reserved: u32,
}

impl PlayerInput {
    /// The "no input" predicate is intrinsic: all-zero bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::zeroed()
    }
}

/// Wire size of one input value.
pub const INPUT_BYTES: usize = core::mem::size_of::<PlayerInput>();

/// Inputs for one frame across all player slots.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameInputs {
    /// One input per player slot; absent players stay empty.
    pub players: [PlayerInput; MAX_PLAYERS],
    /// Number of player slots active in this match.
    pub player_count: usize,
}

/// Rejection reasons at the input boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InputError {
    /// The frame is beyond the bounded lookahead window.
    #[error("input for frame {frame} rejected: beyond lookahead (current {current}, max {lookahead})")]
    FutureInput {
        /// Frame the message claimed.
        frame: u64,
        /// Frame the simulation is about to execute.
        current: u64,
        /// Configured lookahead bound.
        lookahead: u64,
    },
    /// The frame left the retention window; its slot has been reused.
    #[error("input for frame {frame} rejected: outside retention (current {current})")]
    Expired {
        /// Frame the message claimed.
        frame: u64,
        /// Frame the simulation is about to execute.
        current: u64,
    },
    /// The player id is outside the match's player count.
    #[error("unknown player {0}")]
    UnknownPlayer(u8),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SlotState {
    Empty,
    Predicted,
    Confirmed,
}

/// Preallocated `frame x player` input ring.
pub struct InputRing {
    player_count: usize,
    lookahead: u64,
    inputs: Vec<PlayerInput>,
    states: Vec<SlotState>,
    /// Frame each ring row currently represents (slot validity check).
    slot_frames: Vec<u64>,
    /// Most recent confirmed input per player, for prediction.
    last_confirmed: Vec<PlayerInput>,
    last_confirmed_frame: Vec<Option<u64>>,
    /// Per player, the largest frame `g` such that every frame `0..=g` is
    /// confirmed (contiguous prefix).
    confirmed_prefix: Vec<Option<u64>>,
    earliest_dirty: Option<u64>,
}

impl InputRing {
    /// Ring for `player_count` players with the given lookahead bound.
    #[must_use]
    pub fn new(player_count: usize, lookahead: u64) -> Self {
        debug_assert!(player_count <= MAX_PLAYERS);
        Self {
            player_count,
            lookahead,
            inputs: vec![PlayerInput::zeroed(); INPUT_RING_FRAMES * MAX_PLAYERS],
            states: vec![SlotState::Empty; INPUT_RING_FRAMES * MAX_PLAYERS],
            slot_frames: vec![u64::MAX; INPUT_RING_FRAMES],
            last_confirmed: vec![PlayerInput::zeroed(); MAX_PLAYERS],
            last_confirmed_frame: vec![None; MAX_PLAYERS],
            confirmed_prefix: vec![None; MAX_PLAYERS],
            earliest_dirty: None,
        }
    }

    /// Number of active player slots.
    #[must_use]
    pub fn player_count(&self) -> usize {
        self.player_count
    }

    fn ring_row(frame: u64) -> usize {
        usize::try_from(frame).unwrap_or(0) % INPUT_RING_FRAMES
    }

    fn slot(frame: u64, player: usize) -> usize {
        Self::ring_row(frame) * MAX_PLAYERS + player
    }

    /// Claim the ring row for `frame`, clearing slots left from an earlier
    /// wrap of the ring.
    fn claim_row(&mut self, frame: u64) {
        let row = Self::ring_row(frame);
        if self.slot_frames[row] != frame {
            self.slot_frames[row] = frame;
            for p in 0..MAX_PLAYERS {
                let at = row * MAX_PLAYERS + p;
                self.inputs[at] = PlayerInput::zeroed();
                self.states[at] = SlotState::Empty;
            }
        }
    }

    fn check_player(&self, player: u8) -> Result<usize, InputError> {
        let p = usize::from(player);
        if p >= self.player_count {
            return Err(InputError::UnknownPlayer(player));
        }
        Ok(p)
    }

    fn check_window(&self, frame: u64, current: u64) -> Result<(), InputError> {
        if frame > current + self.lookahead {
            return Err(InputError::FutureInput {
                frame,
                current,
                lookahead: self.lookahead,
            });
        }
        if frame + INPUT_RING_FRAMES as u64 <= current {
            return Err(InputError::Expired { frame, current });
        }
        Ok(())
    }

    fn note_confirmed(&mut self, frame: u64, player: usize, input: PlayerInput) {
        let newer = self.last_confirmed_frame[player].is_none_or(|f| frame >= f);
        if newer {
            self.last_confirmed_frame[player] = Some(frame);
            self.last_confirmed[player] = input;
        }
        // Extend the contiguous confirmed prefix as far as the ring allows.
        let player_u8 = u8::try_from(player).unwrap_or(0);
        loop {
            let next = self.confirmed_prefix[player].map_or(0, |g| g + 1);
            if self.is_confirmed(next, player_u8) {
                self.confirmed_prefix[player] = Some(next);
            } else {
                break;
            }
        }
    }

    /// Largest frame `g` such that every player's inputs for frames
    /// `0..=g` are confirmed; `None` before any such frame exists. Hash
    /// comparison against peers is only meaningful at or below this
    /// frontier.
    #[must_use]
    pub fn confirmed_frontier(&self) -> Option<u64> {
        let mut frontier: Option<u64> = None;
        for p in 0..self.player_count {
            match self.confirmed_prefix[p] {
                None => return None,
                Some(g) => {
                    frontier = Some(match frontier {
                        None => g,
                        Some(cur) => cur.min(g),
                    });
                }
            }
        }
        frontier
    }

    /// Store the local player's input, confirmed.
    ///
    /// # Errors
    ///
    /// Rejects frames outside the lookahead or retention windows, and
    /// unknown player ids.
    pub fn submit_local(
        &mut self,
        frame: u64,
        player: u8,
        input: PlayerInput,
        current: u64,
    ) -> Result<(), InputError> {
        let p = self.check_player(player)?;
        self.check_window(frame, current)?;
        self.claim_row(frame);
        let at = Self::slot(frame, p);
        self.inputs[at] = input;
        self.states[at] = SlotState::Confirmed;
        self.note_confirmed(frame, p, input);
        Ok(())
    }

    /// Store a remote player's confirmed input, last-writer-wins per
    /// `(player, frame)`. If the slot held a different value for a frame
    /// that already executed — a contradicted prediction, or a confirmed
    /// value rewritten by a later datagram — the frame is recorded as dirty
    /// for the rollback manager.
    ///
    /// # Errors
    ///
    /// Rejects frames outside the lookahead or retention windows, and
    /// unknown player ids.
    pub fn submit_remote(
        &mut self,
        frame: u64,
        player: u8,
        input: PlayerInput,
        current: u64,
    ) -> Result<(), InputError> {
        let p = self.check_player(player)?;
        self.check_window(frame, current)?;
        self.claim_row(frame);
        let at = Self::slot(frame, p);
        let was = self.states[at];
        let differs = self.inputs[at] != input;
        self.inputs[at] = input;
        self.states[at] = SlotState::Confirmed;
        self.note_confirmed(frame, p, input);
        if differs && frame < current && was != SlotState::Empty {
            self.earliest_dirty = Some(match self.earliest_dirty {
                Some(d) => d.min(frame),
                None => frame,
            });
        }
        Ok(())
    }

    /// Input for `(frame, player)`: the confirmed value when present,
    /// otherwise the most recent confirmed input repeated (empty at match
    /// start). A miss marks the slot predicted so a later confirmation can
    /// detect the misprediction.
    pub fn confirmed_or_predicted(&mut self, frame: u64, player: u8) -> PlayerInput {
        let Ok(p) = self.check_player(player) else {
            return PlayerInput::zeroed();
        };
        self.claim_row(frame);
        let at = Self::slot(frame, p);
        if self.states[at] == SlotState::Confirmed {
            return self.inputs[at];
        }
        let predicted = self.last_confirmed[p];
        self.inputs[at] = predicted;
        self.states[at] = SlotState::Predicted;
        predicted
    }

    /// Stored input for `(frame, player)` without prediction side effects.
    #[must_use]
    pub fn get(&self, frame: u64, player: u8) -> Option<PlayerInput> {
        let p = usize::from(player);
        if p >= self.player_count || self.slot_frames[Self::ring_row(frame)] != frame {
            return None;
        }
        let at = Self::slot(frame, p);
        (self.states[at] != SlotState::Empty).then(|| self.inputs[at])
    }

    /// Whether the stored input for `(frame, player)` is confirmed.
    #[must_use]
    pub fn is_confirmed(&self, frame: u64, player: u8) -> bool {
        let p = usize::from(player);
        p < self.player_count
            && self.slot_frames[Self::ring_row(frame)] == frame
            && self.states[Self::slot(frame, p)] == SlotState::Confirmed
    }

    /// Gather the inputs a tick of `frame` should consume, predicting where
    /// confirmation has not arrived.
    pub fn fetch_for_tick(&mut self, frame: u64) -> FrameInputs {
        let mut out = FrameInputs {
            players: [PlayerInput::zeroed(); MAX_PLAYERS],
            player_count: self.player_count,
        };
        for p in 0..self.player_count {
            out.players[p] = self.confirmed_or_predicted(frame, u8::try_from(p).unwrap_or(0));
        }
        out
    }

    /// Earliest frame whose prediction was contradicted, consumed by the
    /// rollback manager.
    pub fn take_earliest_dirty(&mut self) -> Option<u64> {
        self.earliest_dirty.take()
    }

    /// Forget everything (match reset).
    pub fn clear(&mut self) {
        for i in &mut self.inputs {
            *i = PlayerInput::zeroed();
        }
        for s in &mut self.states {
            *s = SlotState::Empty;
        }
        for f in &mut self.slot_frames {
            *f = u64::MAX;
        }
        for i in &mut self.last_confirmed {
            *i = PlayerInput::zeroed();
        }
        for f in &mut self.last_confirmed_frame {
            *f = None;
        }
        for f in &mut self.confirmed_prefix {
            *f = None;
        }
        self.earliest_dirty = None;
    }
}
