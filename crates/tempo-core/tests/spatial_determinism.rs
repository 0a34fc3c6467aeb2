// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]

//! Spatial query determinism at scale: 10 000 seed-fixed rows, identical
//! result sequences across rebuilds, exact membership against a brute-force
//! filter.

use bytemuck::{Pod, Zeroable};
use tempo_core::math::{Fixed, Fixed2, Prng};
use tempo_core::{Eviction, GridSpec, KindId, Row, SpatialSpec, Table};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
struct Dot {
    pos: Fixed2,
    id: u64,
}

impl Row for Dot {
    const NAME: &'static str = "dots";
    const KIND: KindId = 80;

    fn position(&self) -> Option<Fixed2> {
        Some(self.pos)
    }
}

const ROWS: usize = 10_000;

fn populate(spec: SpatialSpec) -> Table<Dot> {
    let mut table = Table::new(ROWS, Some(spec), Eviction::None);
    let mut rng = Prng::new(42);
    for id in 0..ROWS as u64 {
        let pos = Fixed2::from_raw(
            rng.next_signed(400_i64 << 32),
            rng.next_signed(400_i64 << 32),
        );
        table
            .allocate_with(Dot { pos, id })
            .expect("table filled early");
    }
    table.rebuild_spatial_index();
    table
}

fn query_ids(table: &Table<Dot>, centre: Fixed2, radius: Fixed) -> Vec<u64> {
    let mut span = vec![0_u32; ROWS];
    let got = table.query_radius(centre, radius, &mut span);
    assert!(!got.truncated);
    span[..got.count]
        .iter()
        .map(|&row| table.rows()[row as usize].id)
        .collect()
}

fn brute_force_ids(table: &Table<Dot>, centre: Fixed2, radius: Fixed) -> Vec<u64> {
    let rr = i128::from(radius.raw()) * i128::from(radius.raw());
    table
        .rows()
        .iter()
        .filter(|d| {
            let dx = i128::from(d.pos.x.raw()) - i128::from(centre.x.raw());
            let dy = i128::from(d.pos.y.raw()) - i128::from(centre.y.raw());
            dx * dx + dy * dy <= rr
        })
        .map(|d| d.id)
        .collect()
}

fn check_grid(spec: SpatialSpec) {
    let mut table = populate(spec);
    let centre = Fixed2::from_ints(17, -23);
    let radius = Fixed::from_int(75);

    let first = query_ids(&table, centre, radius);
    assert!(!first.is_empty(), "seeded query should land on rows");

    // Exactness: every row inside the radius appears exactly once, none
    // outside it appear at all.
    let mut expected = brute_force_ids(&table, centre, radius);
    let mut sorted = first.clone();
    sorted.sort_unstable();
    expected.sort_unstable();
    assert_eq!(sorted, expected, "query membership must be exact");
    let mut dedup = sorted.clone();
    dedup.dedup();
    assert_eq!(dedup.len(), sorted.len(), "no row may appear twice");

    // Rebuilding the index must not perturb the result sequence.
    table.rebuild_spatial_index();
    let second = query_ids(&table, centre, radius);
    assert_eq!(first, second, "rebuild changed the query sequence");
}

#[test]
fn single_grid_queries_are_deterministic_and_exact() {
    check_grid(SpatialSpec::Single(GridSpec {
        cell_size: Fixed::from_int(16),
        grid_size: 64,
    }));
}

#[test]
fn chunked_grid_queries_are_deterministic_and_exact() {
    check_grid(SpatialSpec::Chunked(GridSpec {
        cell_size: Fixed::from_int(16),
        grid_size: 8,
    }));
}

#[test]
fn single_and_chunked_agree_on_membership() {
    let single = populate(SpatialSpec::Single(GridSpec {
        cell_size: Fixed::from_int(16),
        grid_size: 64,
    }));
    let chunked = populate(SpatialSpec::Chunked(GridSpec {
        cell_size: Fixed::from_int(16),
        grid_size: 8,
    }));
    let centre = Fixed2::from_ints(-40, 88);
    let radius = Fixed::from_int(50);

    let mut a = query_ids(&single, centre, radius);
    let mut b = query_ids(&chunked, centre, radius);
    a.sort_unstable();
    b.sort_unstable();
    assert_eq!(a, b, "layouts disagree on membership");
}
