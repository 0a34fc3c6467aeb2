// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Integer-only CORDIC backend for Q32.32 trigonometry.
//!
//! This module intentionally does **not** call platform transcendentals or
//! touch floating point at all. The arctan table and gain constant below are
//! committed as Q32.32 raw integers; they are data, not startup computation.
//!
//! Strategy:
//! - range-reduce the raw angle into `[0, TAU)` with integer `rem_euclid`
//! - split into a quadrant by comparison (no division at the boundary)
//! - run 32 circular CORDIC iterations over the quarter-wave argument
//! - apply quadrant symmetries to reconstruct full-wave `sin` and `cos`
//!
//! All angle constants are exact multiples of the committed `HALF_PI_RAW`, so
//! quadrant arithmetic never drifts by a raw unit between peers.

/// Q32.32 raw value of `pi / 2`. The single committed angle constant.
pub(crate) const HALF_PI_RAW: i64 = 6746518852;

/// Q32.32 raw value of `pi`, derived so that `PI == 2 * HALF_PI` exactly.
pub(crate) const PI_RAW: i64 = 2 * HALF_PI_RAW;

/// Q32.32 raw value of `2 * pi`, derived so that `TAU == 4 * HALF_PI` exactly.
pub(crate) const TAU_RAW: i64 = 4 * HALF_PI_RAW;

/// Q32.32 raw value of `1.0`.
pub(crate) const ONE_RAW: i64 = 1_i64 << 32;

/// `atan(2^-i)` for `i` in `0..32`, Q32.32 raw.
const ATAN_TABLE: [i64; 32] = [
    3373259426, 1991351318, 1052175346, 534100635, 268086748, 134174063, 67103403, 33553749,
    16777131, 8388597, 4194303, 2097152, 1048576, 524288, 262144, 131072, 65536, 32768, 16384,
    8192, 4096, 2048, 1024, 512, 256, 128, 64, 32, 16, 8, 4, 2,
];

/// CORDIC gain compensation `K = prod cos(atan(2^-i))`, Q32.32 raw.
const GAIN_RAW: i64 = 2608131496;

/// Quarter-wave rotation: `sin` and `cos` of an angle in `[0, HALF_PI]`.
///
/// Outputs are clamped to `[0, ONE]`; the iteration can undershoot zero by a
/// raw unit near the endpoints and the clamp keeps the canonical range. A
/// zero angle returns exactly `(0, ONE)` so the quadrant boundaries land on
/// exact values.
fn rotate_quarter(angle: i64) -> (i64, i64) {
    if angle == 0 {
        return (0, ONE_RAW);
    }
    let mut x = GAIN_RAW;
    let mut y = 0_i64;
    let mut z = angle;
    for (i, &step) in ATAN_TABLE.iter().enumerate() {
        let dx = x >> i;
        let dy = y >> i;
        if z >= 0 {
            x -= dy;
            y += dx;
            z -= step;
        } else {
            x += dy;
            y -= dx;
            z += step;
        }
    }
    (y.clamp(0, ONE_RAW), x.clamp(0, ONE_RAW))
}

/// Deterministic `sin` and `cos` for a Q32.32 raw angle in radians.
pub(crate) fn sin_cos_raw(angle: i64) -> (i64, i64) {
    // Enforce exact odd symmetry for sine: reduce `|angle|` and apply the
    // sign at the end, so `sin(-x)` is the exact negation of `sin(x)` and
    // `cos(-x)` matches `cos(x)` raw-for-raw.
    let negate_sin = angle < 0;
    let r = saturating_abs(angle).rem_euclid(TAU_RAW);

    let (quadrant, a) = if r < HALF_PI_RAW {
        (0_u8, r)
    } else if r < PI_RAW {
        (1_u8, r - HALF_PI_RAW)
    } else if r < PI_RAW + HALF_PI_RAW {
        (2_u8, r - PI_RAW)
    } else {
        (3_u8, r - (PI_RAW + HALF_PI_RAW))
    };

    let (s, c) = rotate_quarter(a);
    let (mut s, c) = match quadrant {
        0 => (s, c),
        1 => (c, -s),
        2 => (-s, -c),
        // 3
        _ => (-c, s),
    };

    if negate_sin {
        s = -s;
    }
    (s, c)
}

/// Vectoring mode: `atan(y / x)` for `x > 0`, result in `(-HALF_PI, HALF_PI)`.
///
/// Callers must pre-scale so `max(|x|, |y|) < 2^61`; the CORDIC gain of
/// ~1.647 then keeps every intermediate inside `i64`.
fn vector_half_plane(mut x: i64, mut y: i64) -> i64 {
    let mut z = 0_i64;
    for (i, &step) in ATAN_TABLE.iter().enumerate() {
        let dx = x >> i;
        let dy = y >> i;
        if y > 0 {
            x += dy;
            y -= dx;
            z += step;
        } else {
            x -= dy;
            y += dx;
            z -= step;
        }
    }
    z
}

/// Deterministic `atan2(y, x)` over Q32.32 raws, result in `[-PI, PI]`.
///
/// `atan2(0, 0)` returns `0` by policy, matching the canonical treatment of
/// degenerate inputs elsewhere in the math layer.
pub(crate) fn atan2_raw(y: i64, x: i64) -> i64 {
    if x == 0 && y == 0 {
        return 0;
    }
    if x == 0 {
        return if y > 0 { HALF_PI_RAW } else { -HALF_PI_RAW };
    }

    // Angle is scale-invariant: shift both operands to put the larger
    // magnitude near 2^60. Small inputs gain precision, large inputs gain
    // overflow headroom.
    let mag = saturating_abs(x).max(saturating_abs(y));
    let lz = i32::try_from(mag.leading_zeros()).unwrap_or(0);
    let shift = lz - 3;
    let (xs, ys) = if shift >= 0 {
        (x << shift, y << shift)
    } else {
        (x >> -shift, y >> -shift)
    };

    if x > 0 {
        vector_half_plane(xs, ys)
    } else if y >= 0 {
        PI_RAW - vector_half_plane(-xs, ys)
    } else {
        -PI_RAW - vector_half_plane(-xs, ys)
    }
}

/// `abs` that maps `i64::MIN` to `i64::MAX` instead of overflowing.
fn saturating_abs(v: i64) -> i64 {
    if v == i64::MIN {
        i64::MAX
    } else {
        v.abs()
    }
}
