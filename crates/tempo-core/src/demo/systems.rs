// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Demo systems. Every loop runs `0..count` over dense rows; structural
//! changes go through the command buffers and are played back between
//! systems by the pipeline.

use super::{
    BuildingRow, MatchRow, ProjectileRow, UnitRow, ARENA_HALF, ATTACK_RANGE, BUILD_COST,
    HIT_RADIUS, INCOME_PER_FRAME, PROJECTILE_DAMAGE, PROJECTILE_SPEED, UNIT_SPEED,
};
use crate::input::{FrameInputs, BUTTON_ATTACK, BUTTON_MOVE};
use crate::math::{Fixed, Fixed2};
use crate::world::World;

/// Span size for spatial query results inside systems.
const QUERY_SPAN: usize = 64;

fn clamp_to_arena(p: Fixed2) -> Fixed2 {
    Fixed2::new(
        p.x.clamp(-ARENA_HALF, ARENA_HALF),
        p.y.clamp(-ARENA_HALF, ARENA_HALF),
    )
}

/// Step `from` toward `to` by at most `speed`, landing exactly on `to` when
/// within reach.
fn step_toward(from: Fixed2, to: Fixed2, speed: Fixed) -> Fixed2 {
    let delta = to - from;
    if delta.length() <= speed {
        return to;
    }
    match delta.normalize() {
        Ok(dir) => from + dir.scale(speed),
        Err(_) => to,
    }
}

/// Interpret each player's input: move orders, build requests, attacks.
pub fn command_system(world: &mut World, inputs: &FrameInputs) {
    let frame = world.current_frame();
    for player in 0..inputs.player_count {
        let input = inputs.players[player];
        if input.is_empty() {
            continue;
        }
        let owner = u32::try_from(player).unwrap_or(0);

        if input.buttons & BUTTON_MOVE != 0 {
            let target = clamp_to_arena(input.move_target);
            for unit in world.table_mut::<UnitRow>().rows_mut() {
                if unit.owner == owner {
                    unit.target = target;
                }
            }
        }

        if input.build_kind != 0 {
            let can_afford = world.singleton::<MatchRow>().resources[player] >= BUILD_COST;
            if can_afford {
                world.singleton_mut::<MatchRow>().resources[player] -= BUILD_COST;
                let pos = clamp_to_arena(input.move_target);
                world.table_mut::<BuildingRow>().queue_spawn(BuildingRow {
                    pos,
                    hp: 500,
                    kind: u32::from(input.build_kind),
                    built_frame: u32::try_from(frame).unwrap_or(u32::MAX),
                    owner,
                });
            }
        }

        if input.buttons & BUTTON_ATTACK != 0 {
            launch_attack(world, owner, clamp_to_arena(input.aim_target), frame);
        }
    }
}

/// Fire at the nearest enemy unit within range of the aim point. The query
/// returns rows in canonical cell-then-row order; the precise nearest test
/// breaks ties toward the earlier row, so the choice is deterministic.
fn launch_attack(world: &mut World, owner: u32, aim: Fixed2, frame: u64) {
    let mut span = [0_u32; QUERY_SPAN];
    let (target, target_pos) = {
        let units = world.table::<UnitRow>();
        let got = units.query_radius(aim, ATTACK_RANGE, &mut span);
        let mut best: Option<(crate::ident::Handle, Fixed2, Fixed)> = None;
        for &row in &span[..got.count] {
            let unit = &units.rows()[row as usize];
            if unit.owner == owner {
                continue;
            }
            let dist = (unit.pos - aim).length();
            let closer = best.as_ref().is_none_or(|(_, _, d)| dist < *d);
            if closer {
                best = Some((units.handle_at(row as usize), unit.pos, dist));
            }
        }
        match best {
            Some((h, p, _)) => (h, p),
            None => return,
        }
    };

    // Launch from the attacker's first own unit; no units, no attack.
    let origin = world
        .table::<UnitRow>()
        .rows()
        .iter()
        .find(|u| u.owner == owner)
        .map(|u| u.pos);
    let Some(origin) = origin else {
        return;
    };

    let vel = match (target_pos - origin).normalize() {
        Ok(dir) => dir.scale(PROJECTILE_SPEED),
        Err(_) => Fixed2::ZERO,
    };
    world.table_mut::<ProjectileRow>().queue_spawn(ProjectileRow {
        pos: origin,
        vel,
        target,
        damage: PROJECTILE_DAMAGE,
        spawn_frame: u32::try_from(frame).unwrap_or(u32::MAX),
    });
}

/// Advance every unit toward its move target.
pub fn movement_system(world: &mut World, _inputs: &FrameInputs) {
    for unit in world.table_mut::<UnitRow>().rows_mut() {
        if unit.pos != unit.target {
            unit.pos = clamp_to_arena(step_toward(unit.pos, unit.target, UNIT_SPEED));
        }
    }
}

/// Fly projectiles, connect hits, cull the dead.
pub fn projectile_system(world: &mut World, _inputs: &FrameInputs) {
    // Pass 1: integrate flight and collect hits; table borrows stay
    // one-at-a-time and application order is projectile row order.
    struct Hit {
        projectile_row: usize,
        target: crate::ident::Handle,
        damage: i32,
    }
    let mut hits: Vec<Hit> = Vec::new();
    let mut expired: Vec<usize> = Vec::new();

    {
        let targets: Vec<Option<Fixed2>> = {
            let units = world.table::<UnitRow>();
            world
                .table::<ProjectileRow>()
                .rows()
                .iter()
                .map(|p| units.get(p.target).ok().map(|u| u.pos))
                .collect()
        };
        let projectiles = world.table_mut::<ProjectileRow>();
        for (row, projectile) in projectiles.rows_mut().iter_mut().enumerate() {
            match targets[row] {
                None => expired.push(row),
                Some(target_pos) => {
                    projectile.pos = step_toward(projectile.pos, target_pos, PROJECTILE_SPEED);
                    if (projectile.pos - target_pos).length() <= HIT_RADIUS {
                        hits.push(Hit {
                            projectile_row: row,
                            target: projectile.target,
                            damage: projectile.damage,
                        });
                    }
                }
            }
        }
    }

    // Pass 2: apply damage, queue despawns for spent projectiles and dead
    // units.
    for hit in &hits {
        let units = world.table_mut::<UnitRow>();
        if let Ok(unit) = units.get_mut(hit.target) {
            unit.hp -= hit.damage;
            if unit.hp <= 0 {
                units.queue_despawn(hit.target);
            }
        }
    }
    {
        let projectiles = world.table_mut::<ProjectileRow>();
        for hit in &hits {
            let h = projectiles.handle_at(hit.projectile_row);
            projectiles.queue_despawn(h);
        }
        for &row in &expired {
            let h = projectiles.handle_at(row);
            projectiles.queue_despawn(h);
        }
    }
}

/// Grant per-frame income to every active player.
pub fn income_system(world: &mut World, inputs: &FrameInputs) {
    let match_row = world.singleton_mut::<MatchRow>();
    for player in 0..inputs.player_count {
        match_row.resources[player] += INCOME_PER_FRAME;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{build_demo_engine, STARTING_RESOURCES};
    use bytemuck::Zeroable;
    use crate::engine::EngineConfig;
    use crate::input::PlayerInput;

    fn input_move(x: i64, y: i64) -> PlayerInput {
        PlayerInput {
            move_target: Fixed2::from_ints(x, y),
            buttons: BUTTON_MOVE,
            ..PlayerInput::zeroed()
        }
    }

    fn input_build(kind: u16, x: i64, y: i64) -> PlayerInput {
        PlayerInput {
            move_target: Fixed2::from_ints(x, y),
            build_kind: kind,
            ..PlayerInput::zeroed()
        }
    }

    fn input_attack(x: i64, y: i64) -> PlayerInput {
        PlayerInput {
            aim_target: Fixed2::from_ints(x, y),
            buttons: BUTTON_ATTACK,
            ..PlayerInput::zeroed()
        }
    }

    #[test]
    fn move_order_converges_units_on_target() {
        let mut e = build_demo_engine(11, EngineConfig::default());
        let Ok(frame) = e.submit_local_input(input_move(0, 0)) else {
            unreachable!("submit failed")
        };
        for _ in 0..frame + 400 {
            assert!(e.tick().is_ok());
        }
        let units = e.world().table::<UnitRow>();
        for unit in units.rows().iter().filter(|u| u.owner == 0) {
            assert_eq!(unit.pos, Fixed2::from_ints(0, 0), "unit did not arrive");
        }
    }

    #[test]
    fn build_request_spawns_building_and_charges() {
        let mut e = build_demo_engine(11, EngineConfig::default());
        let Ok(frame) = e.submit_local_input(input_build(3, 40, 40)) else {
            unreachable!("submit failed")
        };
        for _ in 0..=frame {
            assert!(e.tick().is_ok());
        }
        let buildings = e.world().table::<BuildingRow>();
        assert_eq!(buildings.count(), 1);
        assert_eq!(buildings.rows()[0].kind, 3);
        let resources = e.world().singleton::<MatchRow>().resources[0];
        let executed = i64::try_from(frame).unwrap_or(0) + 1;
        assert_eq!(
            resources,
            STARTING_RESOURCES - crate::demo::BUILD_COST + executed * INCOME_PER_FRAME
        );
    }

    #[test]
    fn attack_spawns_projectile_that_kills() {
        let mut e = build_demo_engine(11, EngineConfig::default());
        // Player 1's army sits near (60, 60); aim there repeatedly.
        for _ in 0..200 {
            let _ = e.submit_local_input(input_attack(60, 60));
            assert!(e.tick().is_ok());
        }
        let units = e.world().table::<UnitRow>();
        let enemy_units = units.rows().iter().filter(|u| u.owner == 1).count();
        assert!(
            enemy_units < crate::demo::STARTING_UNITS,
            "sustained fire should have killed at least one unit"
        );
    }

    #[test]
    fn income_accrues_per_frame() {
        let mut e = build_demo_engine(11, EngineConfig::default());
        for _ in 0..10 {
            assert!(e.tick().is_ok());
        }
        let resources = e.world().singleton::<MatchRow>().resources;
        assert_eq!(resources[0], STARTING_RESOURCES + 10 * INCOME_PER_FRAME);
        assert_eq!(resources[1], STARTING_RESOURCES + 10 * INCOME_PER_FRAME);
    }
}
