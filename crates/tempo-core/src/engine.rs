// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Rollback manager: the engine facade over world, pipeline, input ring,
//! snapshot ring, and hash history.
//!
//! State machine:
//!
//! ```text
//!             ┌── advance ──┐
//!             ▼             │
//!           Idle ── confirmed input for frame f < current ──► Rollback
//!             ▲                                                  │
//!             └───────── replay reaches current ─────────────────┘
//! ```
//!
//! Frame conventions
//! - `current_frame` is the frame about to be executed.
//! - A snapshot stored for frame `s` captures the state **before** frame `s`
//!   executes; restoring it and replaying with the same inputs reproduces
//!   the original timeline bit-exactly.
//! - `hash_history[f]` is the world hash **after** executing frame `f`, so
//!   the hash after restoring snapshot `s` equals `hash_history[s - 1]`.
//!
//! During replay the ring's mispredicted snapshots are overwritten in place,
//! preserving the `snapshot[s].frame == s` invariant; after replay the hash
//! history is what a single-pass run from `s` with the same inputs would
//! have produced.
//!
//! Concurrency: the engine is single-threaded and cooperative. Nothing here
//! suspends; blocking I/O happens strictly outside `tick`, between ticks,
//! on the same thread.

use bytemuck::Zeroable;
use thiserror::Error;

use crate::hash::HashHistory;
use crate::input::{InputError, InputRing, PlayerInput};
use crate::pipeline::Pipeline;
use crate::snapshot::{self, SnapshotError, SnapshotRing};
use crate::table::TableError;
use crate::world::World;

/// Frames of per-system hash vectors retained for diagnostics. A free
/// design choice, fixed at match start and recorded in the replay header.
pub const PER_SYSTEM_DEPTH: usize = 16;

/// Tunables for a match. Environment overrides happen at the CLI boundary;
/// the core only ever sees the resolved values.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Active player slots.
    pub player_count: usize,
    /// Local player id.
    pub local_player: u8,
    /// Frames of delay applied to locally captured input.
    pub input_delay: u64,
    /// Bounded lookahead for remote input acceptance.
    pub lookahead_max: u64,
    /// Maximum frames a rollback may rewind before it becomes a hard desync.
    pub max_rollback: u64,
    /// A snapshot is taken every `snapshot_interval` frames.
    pub snapshot_interval: u64,
    /// Snapshot ring slots.
    pub snapshot_ring: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            player_count: 2,
            local_player: 0,
            input_delay: 2,
            lookahead_max: 8,
            max_rollback: 15,
            snapshot_interval: 1,
            snapshot_ring: 16,
        }
    }
}

/// Match-scoped faults. Any of these aborts the match: the caller exports a
/// diagnostic bundle and returns to the lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TickFault {
    /// The dirty frame is older than the rollback budget allows.
    #[error(
        "rollback budget exceeded: current frame {current}, snapshot {snapshot}, budget {budget}"
    )]
    RollbackBudgetExceeded {
        /// Frame the simulation had reached.
        current: u64,
        /// Snapshot frame the rollback would have restored.
        snapshot: u64,
        /// Configured budget.
        budget: u64,
    },
    /// The snapshot ring no longer covers the required frame.
    #[error("snapshot ring does not cover frame {0}")]
    SnapshotMiss(u64),
    /// Snapshot bytes were rejected (schema mismatch or corruption).
    #[error(transparent)]
    Snapshot(SnapshotError),
    /// Structural playback overflowed a table.
    #[error("command playback overflowed table `{table}` at frame {frame}")]
    CommandOverflow {
        /// Table that rejected the spawn.
        table: &'static str,
        /// Frame being executed.
        frame: u64,
    },
}

impl TickFault {
    fn from_snapshot(err: SnapshotError) -> Self {
        match err {
            SnapshotError::Miss(frame) => Self::SnapshotMiss(frame),
            other => Self::Snapshot(other),
        }
    }

    fn from_table(err: TableError, frame: u64) -> Self {
        let table = match err {
            TableError::Full(t) => t,
            // Playback skips stale despawns; this arm is unreachable from
            // the pipeline.
            TableError::Stale(_) => "<stale>",
        };
        Self::CommandOverflow { table, frame }
    }
}

/// What a successful [`Engine::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Advanced one frame normally.
    Advanced {
        /// Frame that was executed.
        frame: u64,
        /// Hash after executing it.
        hash: u64,
    },
    /// Rolled back, replayed, then advanced one frame.
    RolledBack {
        /// Snapshot frame the rollback restored.
        restored: u64,
        /// Frame that was executed after replay caught up.
        frame: u64,
        /// Hash after executing it.
        hash: u64,
    },
}

impl TickOutcome {
    /// Frame the tick executed.
    #[must_use]
    pub fn frame(&self) -> u64 {
        match self {
            Self::Advanced { frame, .. } | Self::RolledBack { frame, .. } => *frame,
        }
    }

    /// Hash after the executed frame.
    #[must_use]
    pub fn hash(&self) -> u64 {
        match self {
            Self::Advanced { hash, .. } | Self::RolledBack { hash, .. } => *hash,
        }
    }
}

/// The rollback engine.
pub struct Engine {
    world: World,
    pipeline: Pipeline,
    inputs: InputRing,
    snapshots: SnapshotRing,
    hashes: HashHistory,
    /// `(frame, per-system hash vector)` pairs, newest last.
    per_system: Vec<(u64, Vec<u64>)>,
    cfg: EngineConfig,
    scratch: Vec<u8>,
}

impl Engine {
    /// Wire an engine around a freshly built world at frame zero. The
    /// initial state is snapshotted immediately so rollbacks near the start
    /// of the match have a floor to land on.
    #[must_use]
    pub fn new(world: World, pipeline: Pipeline, cfg: EngineConfig) -> Self {
        debug_assert_eq!(world.current_frame(), 0, "engine expects a fresh world");
        debug_assert!(cfg.snapshot_interval > 0);
        let max_bytes = snapshot::max_snapshot_bytes(&world);
        let mut engine = Self {
            world,
            pipeline,
            inputs: InputRing::new(cfg.player_count, cfg.lookahead_max),
            snapshots: SnapshotRing::new(cfg.snapshot_ring, max_bytes),
            hashes: HashHistory::new(),
            per_system: Vec::new(),
            cfg,
            scratch: Vec::new(),
        };
        engine.snapshots.store(&engine.world);
        // Frames before the input delay are implicitly empty for every
        // player; confirming them up front keeps the confirmed frontier
        // contiguous from frame zero on every peer.
        debug_assert!(cfg.input_delay <= cfg.lookahead_max);
        for frame in 0..cfg.input_delay {
            for player in 0..cfg.player_count {
                let _ = engine.inputs.submit_remote(
                    frame,
                    u8::try_from(player).unwrap_or(0),
                    PlayerInput::zeroed(),
                    0,
                );
            }
        }
        engine
    }

    /// Resolved configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Read access to the world.
    #[must_use]
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Mutable world access for match setup and test scaffolding, strictly
    /// between ticks. Mutations here are not covered by earlier snapshots
    /// or recorded hashes.
    pub fn world_mut_for_setup(&mut self) -> &mut World {
        &mut self.world
    }

    /// Frame about to be executed.
    #[must_use]
    pub fn current_frame(&self) -> u64 {
        self.world.current_frame()
    }

    /// Recorded frame hashes.
    #[must_use]
    pub fn hash_history(&self) -> &HashHistory {
        &self.hashes
    }

    /// Declared system names, in execution order.
    #[must_use]
    pub fn system_names(&self) -> Vec<&'static str> {
        self.pipeline.system_names()
    }

    /// Stored input for `(frame, player)`, if retained.
    #[must_use]
    pub fn input_at(&self, frame: u64, player: u8) -> Option<PlayerInput> {
        self.inputs.get(frame, player)
    }

    /// Largest frame whose inputs are confirmed for every player. Peer hash
    /// comparison is only meaningful at or below this frontier.
    #[must_use]
    pub fn confirmed_frontier(&self) -> Option<u64> {
        self.inputs.confirmed_frontier()
    }

    /// Capture local input: scheduled `input_delay` frames ahead, stored
    /// confirmed. Returns the frame the input was submitted for.
    ///
    /// # Errors
    ///
    /// Propagates ring rejections ([`InputError`]).
    pub fn submit_local_input(&mut self, input: PlayerInput) -> Result<u64, InputError> {
        let current = self.world.current_frame();
        let frame = current + self.cfg.input_delay;
        self.inputs
            .submit_local(frame, self.cfg.local_player, input, current)?;
        Ok(frame)
    }

    /// Store a remote player's confirmed input.
    ///
    /// # Errors
    ///
    /// Propagates ring rejections ([`InputError`]).
    pub fn submit_remote_input(
        &mut self,
        player: u8,
        frame: u64,
        input: PlayerInput,
    ) -> Result<(), InputError> {
        self.inputs
            .submit_remote(frame, player, input, self.world.current_frame())
    }

    /// Advance the simulation by one frame, rolling back and replaying
    /// first if a confirmed input contradicted a prediction.
    ///
    /// # Errors
    ///
    /// Match-scoped faults only; see [`TickFault`]. On
    /// [`TickFault::RollbackBudgetExceeded`] the hash history is untouched.
    pub fn tick(&mut self) -> Result<TickOutcome, TickFault> {
        let restored = match self.inputs.take_earliest_dirty() {
            Some(dirty) => self.rollback_and_replay(dirty)?,
            None => None,
        };
        let frame = self.world.current_frame();
        let hash = self.advance_one()?;
        Ok(match restored {
            Some(snapshot) => TickOutcome::RolledBack {
                restored: snapshot,
                frame,
                hash,
            },
            None => TickOutcome::Advanced { frame, hash },
        })
    }

    /// Execute the current frame and do post-tick bookkeeping.
    fn advance_one(&mut self) -> Result<u64, TickFault> {
        let frame = self.world.current_frame();
        let fi = self.inputs.fetch_for_tick(frame);
        let hash = self
            .pipeline
            .tick(&mut self.world, &fi, &mut self.scratch)
            .map_err(|e| TickFault::from_table(e, frame))?;
        self.hashes.record(frame, hash);
        if self.world.current_frame() % self.cfg.snapshot_interval == 0 {
            self.snapshots.store(&self.world);
        }
        Ok(hash)
    }

    /// Restore the newest snapshot at or before `dirty` and replay forward
    /// to where the simulation had been. Returns the restored snapshot
    /// frame.
    fn rollback_and_replay(&mut self, dirty: u64) -> Result<Option<u64>, TickFault> {
        let saved = self.world.current_frame();
        if dirty >= saved {
            // A prediction can only exist for an executed frame; nothing to
            // resimulate.
            debug_assert!(dirty < saved, "dirty frame {dirty} >= current {saved}");
            return Ok(None);
        }

        // Budget check happens before any mutation so a refused rollback
        // leaves the hash history untouched.
        let (snap_frame, bytes) = self
            .snapshots
            .latest_at_or_before(dirty)
            .map_err(TickFault::from_snapshot)?;
        if saved - snap_frame > self.cfg.max_rollback {
            return Err(TickFault::RollbackBudgetExceeded {
                current: saved,
                snapshot: snap_frame,
                budget: self.cfg.max_rollback,
            });
        }

        // `restore_world` flags every spatial index dirty; the first
        // replayed tick rebuilds them.
        snapshot::restore_world(&mut self.world, bytes).map_err(TickFault::from_snapshot)?;

        while self.world.current_frame() < saved {
            let frame = self.world.current_frame();
            let fi = self.inputs.fetch_for_tick(frame);
            let hash = self
                .pipeline
                .tick(&mut self.world, &fi, &mut self.scratch)
                .map_err(|e| TickFault::from_table(e, frame))?;
            self.hashes.record(frame, hash);
            // Overwrite the mispredicted snapshots in place; the slot
            // invariant `snapshot[s].frame == s` is preserved.
            if self.world.current_frame() % self.cfg.snapshot_interval == 0 {
                self.snapshots.store(&self.world);
            }
        }
        Ok(Some(snap_frame))
    }

    /// Diagnostic resimulation of frame `d` in per-system hash mode.
    ///
    /// Restores the snapshot for `d`, runs exactly one tick hashing after
    /// every system, and retains the vector keyed by `d` (up to
    /// [`PER_SYSTEM_DEPTH`] frames). Destructive: the world is left at frame
    /// `d + 1`, which is acceptable only because a desynced match is already
    /// lost.
    ///
    /// # Errors
    ///
    /// Fails with [`TickFault::SnapshotMiss`] when the ring no longer holds
    /// frame `d`.
    pub fn resimulate_with_system_hashes(&mut self, d: u64) -> Result<Vec<u64>, TickFault> {
        let bytes = self.snapshots.exact(d).map_err(TickFault::from_snapshot)?;
        snapshot::restore_world(&mut self.world, bytes).map_err(TickFault::from_snapshot)?;
        let fi = self.inputs.fetch_for_tick(d);
        let (_, per_system) = self
            .pipeline
            .tick_per_system(&mut self.world, &fi, &mut self.scratch)
            .map_err(|e| TickFault::from_table(e, d))?;
        self.per_system.push((d, per_system.clone()));
        if self.per_system.len() > PER_SYSTEM_DEPTH {
            self.per_system.remove(0);
        }
        Ok(per_system)
    }

    /// Retained per-system hash vector for `frame`, if any.
    #[must_use]
    pub fn per_system_hashes(&self, frame: u64) -> Option<&[u64]> {
        self.per_system
            .iter()
            .rev()
            .find(|(f, _)| *f == frame)
            .map(|(_, v)| v.as_slice())
    }

    /// Snapshot bytes for exactly `frame`, if the ring still holds them.
    ///
    /// # Errors
    ///
    /// Fails with [`SnapshotError::Miss`] otherwise.
    pub fn snapshot_exact(&self, frame: u64) -> Result<&[u8], SnapshotError> {
        self.snapshots.exact(frame)
    }

    /// Serialize the current world state into `out`.
    pub fn save_current_snapshot(&self, out: &mut Vec<u8>) {
        snapshot::save_world(&self.world, out);
    }

    /// Restore the world to exactly `frame` from the snapshot ring. Used by
    /// the debug exporter; reports success without unwinding the caller.
    pub fn try_restore_exact(&mut self, frame: u64) -> bool {
        match self.snapshots.exact(frame) {
            Ok(bytes) => snapshot::restore_world(&mut self.world, bytes).is_ok(),
            Err(_) => false,
        }
    }

    /// Adopt external snapshot bytes as the new timeline origin: restore,
    /// clear every ring, and re-seed the snapshot ring at the restored
    /// frame. Used by the headless replayer.
    ///
    /// # Errors
    ///
    /// Fails with [`TickFault::Snapshot`] when the bytes do not match the
    /// world schema.
    pub fn reseed_from_snapshot(&mut self, bytes: &[u8]) -> Result<(), TickFault> {
        snapshot::restore_world(&mut self.world, bytes).map_err(TickFault::from_snapshot)?;
        self.inputs.clear();
        self.hashes.clear();
        self.snapshots.clear();
        self.per_system.clear();
        self.snapshots.store(&self.world);
        Ok(())
    }

    /// Return to frame zero: reset the world (singletons re-allocated),
    /// clear every ring, snapshot the fresh state.
    pub fn reset(&mut self) {
        self.world.reset();
        self.inputs.clear();
        self.hashes.clear();
        self.snapshots.clear();
        self.per_system.clear();
        self.snapshots.store(&self.world);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::KindId;
    use crate::input::{FrameInputs, PlayerInput, BUTTON_MOVE};
    use crate::math::Fixed2;
    use crate::table::Row;
    use crate::world::{World, WorldBuilder};
    use bytemuck::{Pod, Zeroable};

    /// Accumulator whose value depends on every input seen so far, so a
    /// changed historical input changes every later hash.
    #[repr(C)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
    struct Acc {
        sum: i64,
    }

    impl Row for Acc {
        const NAME: &'static str = "acc";
        const KIND: KindId = 96;
    }

    fn accumulate(world: &mut World, inputs: &FrameInputs) {
        let mut delta = 1_i64;
        for p in 0..inputs.player_count {
            let input = &inputs.players[p];
            if input.buttons & BUTTON_MOVE != 0 {
                delta += input.move_target.x.to_int_floor();
            }
        }
        world.singleton_mut::<Acc>().sum += delta;
    }

    fn build_engine(cfg: EngineConfig) -> Engine {
        let mut b = WorldBuilder::new();
        b.register_singleton::<Acc>();
        let world = b.build();
        let mut pipeline = Pipeline::new();
        pipeline.register_system("accumulate", accumulate);
        Engine::new(world, pipeline, cfg)
    }

    fn move_input(x: i64) -> PlayerInput {
        PlayerInput {
            move_target: Fixed2::from_ints(x, 0),
            buttons: BUTTON_MOVE,
            ..PlayerInput::zeroed()
        }
    }

    fn run_frames(engine: &mut Engine, n: u64) {
        for _ in 0..n {
            match engine.tick() {
                Ok(_) => {}
                Err(e) => unreachable!("tick failed: {e}"),
            }
        }
    }

    #[test]
    fn advance_records_hash_per_frame() {
        let mut engine = build_engine(EngineConfig::default());
        run_frames(&mut engine, 5);
        assert_eq!(engine.current_frame(), 5);
        for f in 0..5 {
            assert!(engine.hash_history().get(f).is_some());
        }
    }

    #[test]
    fn late_confirmed_input_triggers_rollback_to_equivalent_history() {
        // Reference run: the remote input for frame 3 is known up front.
        let mut reference = build_engine(EngineConfig::default());
        for f in 0..8_u64 {
            let input = if f == 3 {
                move_input(10)
            } else {
                PlayerInput::zeroed()
            };
            assert!(reference.submit_remote_input(1, f, input).is_ok());
        }
        run_frames(&mut reference, 8);

        // Live run: remote inputs are silent (predicted empty) until the
        // frame-3 confirmation lands at frame 6.
        let mut live = build_engine(EngineConfig::default());
        for f in 0..3_u64 {
            assert!(live.submit_remote_input(1, f, PlayerInput::zeroed()).is_ok());
        }
        run_frames(&mut live, 6);
        assert!(live.submit_remote_input(1, 3, move_input(10)).is_ok());
        for f in 4..8_u64 {
            assert!(live.submit_remote_input(1, f, PlayerInput::zeroed()).is_ok());
        }

        let Ok(outcome) = live.tick() else {
            unreachable!("rollback tick failed")
        };
        assert!(
            matches!(outcome, TickOutcome::RolledBack { restored, .. } if restored <= 3),
            "expected a rollback, got {outcome:?}"
        );
        run_frames(&mut live, 1);

        for f in 0..8_u64 {
            assert_eq!(
                live.hash_history().get(f),
                reference.hash_history().get(f),
                "hash divergence at frame {f}"
            );
        }
    }

    #[test]
    fn budget_overrun_is_refused_and_history_untouched() {
        let cfg = EngineConfig {
            max_rollback: 4,
            ..EngineConfig::default()
        };
        let mut engine = build_engine(cfg);
        run_frames(&mut engine, 20);
        let before: Vec<Option<u64>> = (0..20).map(|f| engine.hash_history().get(f)).collect();

        // Confirm a contradicting input far beyond the budget.
        assert!(engine.submit_remote_input(1, 10, move_input(5)).is_ok());
        let err = engine.tick();
        assert!(
            matches!(err, Err(TickFault::RollbackBudgetExceeded { .. })),
            "expected budget fault, got {err:?}"
        );
        let after: Vec<Option<u64>> = (0..20).map(|f| engine.hash_history().get(f)).collect();
        assert_eq!(before, after, "refused rollback must not touch history");
    }

    #[test]
    fn matching_confirmation_does_not_roll_back() {
        let mut engine = build_engine(EngineConfig::default());
        run_frames(&mut engine, 4);
        // Predictions were empty; confirming empty matches them.
        assert!(engine
            .submit_remote_input(1, 2, PlayerInput::zeroed())
            .is_ok());
        let Ok(outcome) = engine.tick() else {
            unreachable!("tick failed")
        };
        assert!(matches!(outcome, TickOutcome::Advanced { .. }));
    }

    #[test]
    fn hash_after_restore_matches_history() {
        let mut engine = build_engine(EngineConfig::default());
        run_frames(&mut engine, 6);
        let recorded = engine.hash_history().get(3);
        assert!(engine.try_restore_exact(4), "ring should cover frame 4");
        let mut scratch = Vec::new();
        let now = crate::hash::world_hash(engine.world(), &mut scratch);
        assert_eq!(Some(now), recorded);
    }

    #[test]
    fn per_system_resim_is_stable_for_a_frame() {
        let mut engine = build_engine(EngineConfig::default());
        run_frames(&mut engine, 6);
        let Ok(first) = engine.resimulate_with_system_hashes(4) else {
            unreachable!("resim failed")
        };
        let Ok(second) = engine.resimulate_with_system_hashes(4) else {
            unreachable!("resim failed")
        };
        assert_eq!(first, second);
        assert_eq!(engine.per_system_hashes(4), Some(first.as_slice()));
    }

    #[test]
    fn local_input_is_scheduled_with_delay() {
        let mut engine = build_engine(EngineConfig::default());
        let Ok(frame) = engine.submit_local_input(move_input(1)) else {
            unreachable!("submit failed")
        };
        assert_eq!(frame, engine.config().input_delay);
        assert_eq!(engine.input_at(frame, 0), Some(move_input(1)));
    }

    #[test]
    fn reseed_adopts_external_timeline() {
        let mut donor = build_engine(EngineConfig::default());
        run_frames(&mut donor, 5);
        let mut bytes = Vec::new();
        donor.save_current_snapshot(&mut bytes);

        let mut fresh = build_engine(EngineConfig::default());
        assert!(fresh.reseed_from_snapshot(&bytes).is_ok());
        assert_eq!(fresh.current_frame(), 5);
        assert_eq!(
            fresh.world().singleton::<Acc>().sum,
            donor.world().singleton::<Acc>().sum
        );
    }
}
