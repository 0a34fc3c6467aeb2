// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Demo world: a minimal RTS-flavoured match wired through the full engine.
//!
//! Exercises every table mode — units on a single grid, buildings on a
//! chunked grid, projectiles under LRU eviction, and a match singleton —
//! and every input path (move orders, build requests, attacks). Integration
//! tests and the headless replayer run on this world.

mod systems;

use bytemuck::{Pod, Zeroable};

use crate::engine::{Engine, EngineConfig};
use crate::ident::{Handle, KindId};
use crate::math::{Fixed, Fixed2, Prng};
use crate::pipeline::Pipeline;
use crate::table::{Eviction, GridSpec, Row, SpatialSpec};
use crate::world::WorldBuilder;

pub use systems::{command_system, income_system, movement_system, projectile_system};

/// Units a player starts the match with.
pub const STARTING_UNITS: usize = 4;
/// Starting resource stock per player.
pub const STARTING_RESOURCES: i64 = 100;
/// Resources granted to every player each frame.
pub const INCOME_PER_FRAME: i64 = 1;
/// Cost of one building.
pub const BUILD_COST: i64 = 25;
/// Unit movement per frame, world units.
pub const UNIT_SPEED: Fixed = Fixed::from_raw(1 << 31); // 0.5
/// Projectile movement per frame, world units.
pub const PROJECTILE_SPEED: Fixed = Fixed::from_raw(3 << 31); // 1.5
/// Attack search radius around the aim target.
pub const ATTACK_RANGE: Fixed = Fixed::from_raw(24_i64 << 32);
/// Distance at which a projectile connects.
pub const HIT_RADIUS: Fixed = Fixed::from_raw(1 << 32);
/// Damage per projectile hit.
pub const PROJECTILE_DAMAGE: i32 = 10;
/// Half-side of the square arena; positions clamp inside.
pub const ARENA_HALF: Fixed = Fixed::from_raw(200_i64 << 32);

/// A combat unit.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct UnitRow {
    /// World position.
    pub pos: Fixed2,
    /// Current move-order destination; equal to `pos` when idle.
    pub target: Fixed2,
    /// Hit points; the unit despawns at zero.
    pub hp: i32,
    /// Owning player slot.
    pub owner: u32,
}

impl Row for UnitRow {
    const NAME: &'static str = "units";
    const KIND: KindId = 1;

    fn position(&self) -> Option<Fixed2> {
        Some(self.pos)
    }
}

/// A placed structure.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BuildingRow {
    /// World position (chunked-grid indexed).
    pub pos: Fixed2,
    /// Hit points.
    pub hp: i32,
    /// Building kind from the input's `build_kind`.
    pub kind: u32,
    /// Frame the building was placed.
    pub built_frame: u32,
    /// Owning player slot.
    pub owner: u32,
}

impl Row for BuildingRow {
    const NAME: &'static str = "buildings";
    const KIND: KindId = 2;

    fn position(&self) -> Option<Fixed2> {
        Some(self.pos)
    }
}

/// A projectile in flight toward a unit.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ProjectileRow {
    /// World position.
    pub pos: Fixed2,
    /// Flight direction, refreshed while the target lives.
    pub vel: Fixed2,
    /// Target unit; stale handles despawn the projectile.
    pub target: Handle,
    /// Damage on connect.
    pub damage: i32,
    /// Frame the projectile spawned; LRU key when the table fills.
    pub spawn_frame: u32,
}

impl Row for ProjectileRow {
    const NAME: &'static str = "projectiles";
    const KIND: KindId = 3;

    fn lru_key(&self) -> i64 {
        i64::from(self.spawn_frame)
    }
}

/// Match-wide singleton state.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MatchRow {
    /// Session seed recorded in the replay header.
    pub seed: u64,
    /// Resource stock per player slot.
    pub resources: [i64; crate::input::MAX_PLAYERS],
}

impl Row for MatchRow {
    const NAME: &'static str = "match";
    const KIND: KindId = 4;
}

/// Build the demo engine: tables, systems, seed-fixed starting armies.
///
/// The same `(seed, cfg)` pair produces a bit-identical engine on every
/// peer, which is what makes the replayer's hash comparison meaningful.
#[must_use]
pub fn build_demo_engine(seed: u64, cfg: EngineConfig) -> Engine {
    let mut builder = WorldBuilder::new();
    builder.register::<UnitRow>(
        1024,
        Some(SpatialSpec::Single(GridSpec {
            cell_size: Fixed::from_int(8),
            grid_size: 64,
        })),
        Eviction::None,
    );
    builder.register::<BuildingRow>(
        256,
        Some(SpatialSpec::Chunked(GridSpec {
            cell_size: Fixed::from_int(16),
            grid_size: 8,
        })),
        Eviction::None,
    );
    builder.register::<ProjectileRow>(512, None, Eviction::Lru);
    builder.register_singleton::<MatchRow>();
    let mut world = builder.build();

    {
        let match_row = world.singleton_mut::<MatchRow>();
        match_row.seed = seed;
        for p in 0..cfg.player_count {
            match_row.resources[p] = STARTING_RESOURCES;
        }
    }

    // Seed-fixed starting positions, spread per player around opposite
    // corners of the arena.
    let mut rng = Prng::new(seed);
    for player in 0..cfg.player_count {
        let side = if player % 2 == 0 { -1_i64 } else { 1 };
        let base = Fixed2::from_ints(side * 60, side * 60);
        for _ in 0..STARTING_UNITS {
            let jitter = Fixed2::from_ints(rng.next_signed(10), rng.next_signed(10));
            let pos = base + jitter;
            let spawned = world.table_mut::<UnitRow>().allocate_with(UnitRow {
                pos,
                target: pos,
                hp: 100,
                owner: u32::try_from(player).unwrap_or(0),
            });
            debug_assert!(spawned.is_ok());
        }
    }
    world.table_mut::<UnitRow>().rebuild_spatial_index();

    let mut pipeline = Pipeline::new();
    pipeline.register_system("commands", command_system);
    pipeline.register_system("movement", movement_system);
    pipeline.register_system("projectiles", projectile_system);
    pipeline.register_system("income", income_system);

    Engine::new(world, pipeline, cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_engine_is_reproducible() {
        let mut a = build_demo_engine(42, EngineConfig::default());
        let mut b = build_demo_engine(42, EngineConfig::default());
        for _ in 0..32 {
            let (ra, rb) = (a.tick(), b.tick());
            assert!(ra.is_ok() && rb.is_ok());
        }
        for f in 0..32 {
            assert_eq!(
                a.hash_history().get(f),
                b.hash_history().get(f),
                "hash mismatch at frame {f}"
            );
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = build_demo_engine(1, EngineConfig::default());
        let mut b = build_demo_engine(2, EngineConfig::default());
        assert!(a.tick().is_ok() && b.tick().is_ok());
        assert_ne!(a.hash_history().get(0), b.hash_history().get(0));
    }

    #[test]
    fn starting_layout_matches_config() {
        let e = build_demo_engine(7, EngineConfig::default());
        let units = e.world().table::<UnitRow>();
        assert_eq!(units.count(), STARTING_UNITS * 2);
        assert_eq!(
            e.world().singleton::<MatchRow>().resources[0],
            STARTING_RESOURCES
        );
    }
}
