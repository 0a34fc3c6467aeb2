// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Q32.32 fixed-point scalar and 2-vector.
//!
//! The representation is an `i64` storing an integer scaled by `2^32`:
//! `real_value = raw / 2^32`. Every operation is a pure, total function of
//! its raw integer inputs:
//!
//! - addition and subtraction saturate at the `i64` boundary,
//! - multiplication runs through an `i128` intermediate and saturates on
//!   overflow; [`Fixed::mul_check`] exposes the saturation flag,
//! - the `/` operator returns a sign-directed saturation sentinel for a zero
//!   divisor; [`Fixed::checked_div`] is the fallible form,
//! - `sqrt`, `sin`, `cos` and `atan2` are integer-only (binary square root
//!   and CORDIC); their tables are committed data, never derived at startup.

use core::cmp::Ordering;
use core::ops::{Add, Div, Mul, Neg, Sub};

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use super::trig;

/// Number of fractional bits in the Q32.32 encoding.
const FRAC_BITS: u32 = 32;

/// Domain failures in the math layer.
///
/// These are operation-local results; they become match-scoped faults only
/// if an assertion or test observes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Error)]
pub enum MathError {
    /// Division by zero.
    #[error("division by zero")]
    DivideByZero,
    /// Square root of a negative value.
    #[error("square root of negative value")]
    NegativeSqrt,
}

/// Q32.32 fixed-point scalar.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable)]
pub struct Fixed(i64);

impl core::fmt::Debug for Fixed {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Fixed({}/2^32)", self.0)
    }
}

impl Fixed {
    /// The additive identity.
    pub const ZERO: Self = Self(0);
    /// The multiplicative identity.
    pub const ONE: Self = Self(1_i64 << FRAC_BITS);
    /// One half.
    pub const HALF: Self = Self(1_i64 << (FRAC_BITS - 1));
    /// Largest representable value.
    pub const MAX: Self = Self(i64::MAX);
    /// Smallest representable value.
    pub const MIN: Self = Self(i64::MIN);
    /// Smallest positive increment (one raw unit).
    pub const EPSILON: Self = Self(1);
    /// `pi / 2`.
    pub const HALF_PI: Self = Self(trig::HALF_PI_RAW);
    /// `pi`, exactly `2 * HALF_PI`.
    pub const PI: Self = Self(trig::PI_RAW);
    /// `2 * pi`, exactly `4 * HALF_PI`.
    pub const TAU: Self = Self(trig::TAU_RAW);

    /// Construct directly from raw Q32.32 bits.
    #[must_use]
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Return the raw Q32.32 representation.
    #[must_use]
    pub fn raw(self) -> i64 {
        self.0
    }

    /// Construct from an integer value, saturating outside `i32`-ish range.
    #[must_use]
    pub fn from_int(n: i64) -> Self {
        Self(n.saturating_mul(1_i64 << FRAC_BITS))
    }

    /// Construct the exact ratio `num / den`.
    ///
    /// # Errors
    ///
    /// Fails with [`MathError::DivideByZero`] when `den` is zero.
    pub fn from_ratio(num: i64, den: i64) -> Result<Self, MathError> {
        if den == 0 {
            return Err(MathError::DivideByZero);
        }
        let wide = (i128::from(num) << FRAC_BITS) / i128::from(den);
        Ok(Self(saturate_i128(wide)))
    }

    /// Floor of the value as an integer (arithmetic shift, exact).
    #[must_use]
    pub fn to_int_floor(self) -> i64 {
        self.0 >> FRAC_BITS
    }

    /// Nearest integer; halves round toward positive infinity.
    #[must_use]
    pub fn to_int_round(self) -> i64 {
        self.0.saturating_add(Self::HALF.0) >> FRAC_BITS
    }

    /// Absolute value; `MIN` saturates to `MAX`.
    #[must_use]
    pub fn abs(self) -> Self {
        if self.0 == i64::MIN {
            Self::MAX
        } else {
            Self(self.0.abs())
        }
    }

    /// Sign as a fixed value: `-1`, `0`, or `1`.
    #[must_use]
    pub fn signum(self) -> Self {
        match self.0.cmp(&0) {
            Ordering::Less => Self(-Self::ONE.0),
            Ordering::Equal => Self::ZERO,
            Ordering::Greater => Self::ONE,
        }
    }

    /// Multiply, reporting whether the result saturated.
    ///
    /// The `*` operator uses this and discards the flag; tests observing
    /// overflow behaviour go through `mul_check`.
    #[must_use]
    pub fn mul_check(self, rhs: Self) -> (Self, bool) {
        let wide = i128::from(self.0) * i128::from(rhs.0);
        let shifted = wide >> FRAC_BITS;
        i64::try_from(shifted).map_or_else(
            |_| {
                let sat = if shifted.is_negative() {
                    i64::MIN
                } else {
                    i64::MAX
                };
                (Self(sat), true)
            },
            |v| (Self(v), false),
        )
    }

    /// Divide, failing on a zero divisor.
    ///
    /// # Errors
    ///
    /// Fails with [`MathError::DivideByZero`] when `rhs` is zero.
    pub fn checked_div(self, rhs: Self) -> Result<Self, MathError> {
        if rhs.0 == 0 {
            return Err(MathError::DivideByZero);
        }
        let wide = (i128::from(self.0) << FRAC_BITS) / i128::from(rhs.0);
        Ok(Self(saturate_i128(wide)))
    }

    /// Integer binary square root.
    ///
    /// # Errors
    ///
    /// Fails with [`MathError::NegativeSqrt`] for negative inputs.
    pub fn sqrt(self) -> Result<Self, MathError> {
        if self.0 < 0 {
            return Err(MathError::NegativeSqrt);
        }
        let wide = u128::try_from(self.0).unwrap_or(0) << FRAC_BITS;
        let root = isqrt_u128(wide);
        Ok(Self(i64::try_from(root).unwrap_or(i64::MAX)))
    }

    /// Deterministic sine (radians).
    #[must_use]
    pub fn sin(self) -> Self {
        Self(trig::sin_cos_raw(self.0).0)
    }

    /// Deterministic cosine (radians).
    #[must_use]
    pub fn cos(self) -> Self {
        Self(trig::sin_cos_raw(self.0).1)
    }

    /// Sine and cosine together, sharing one range reduction.
    #[must_use]
    pub fn sin_cos(self) -> (Self, Self) {
        let (s, c) = trig::sin_cos_raw(self.0);
        (Self(s), Self(c))
    }

    /// Deterministic `atan2(self, x)`, result in `[-PI, PI]`.
    ///
    /// `atan2(0, 0)` returns zero by policy.
    #[must_use]
    pub fn atan2(self, x: Self) -> Self {
        Self(trig::atan2_raw(self.0, x.0))
    }
}

impl Add for Fixed {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Fixed {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Mul for Fixed {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        self.mul_check(rhs).0
    }
}

impl Div for Fixed {
    type Output = Self;
    /// Division by zero yields the sign-directed saturation sentinel
    /// (`MAX` for a non-negative dividend, `MIN` otherwise).
    fn div(self, rhs: Self) -> Self {
        self.checked_div(rhs).unwrap_or(if self.0 >= 0 {
            Self::MAX
        } else {
            Self::MIN
        })
    }
}

impl Neg for Fixed {
    type Output = Self;
    fn neg(self) -> Self {
        Self(self.0.checked_neg().unwrap_or(i64::MAX))
    }
}

fn saturate_i128(value: i128) -> i64 {
    i64::try_from(value).unwrap_or_else(|_| {
        if value.is_negative() {
            i64::MIN
        } else {
            i64::MAX
        }
    })
}

/// Restoring binary square root over `u128`.
fn isqrt_u128(v: u128) -> u128 {
    if v == 0 {
        return 0;
    }
    let top = 127 - v.leading_zeros();
    let mut bit = 1_u128 << (top & !1);
    let mut rem = v;
    let mut root = 0_u128;
    while bit != 0 {
        if rem >= root + bit {
            rem -= root + bit;
            root = (root >> 1) + bit;
        } else {
            root >>= 1;
        }
        bit >>= 2;
    }
    root
}

/// Pair of Q32.32 scalars: a point or direction in the simulation plane.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct Fixed2 {
    /// Horizontal component.
    pub x: Fixed,
    /// Vertical component.
    pub y: Fixed,
}

impl Fixed2 {
    /// The origin.
    pub const ZERO: Self = Self {
        x: Fixed::ZERO,
        y: Fixed::ZERO,
    };

    /// Construct from two scalars.
    #[must_use]
    pub fn new(x: Fixed, y: Fixed) -> Self {
        Self { x, y }
    }

    /// Construct from integer components.
    #[must_use]
    pub fn from_ints(x: i64, y: i64) -> Self {
        Self {
            x: Fixed::from_int(x),
            y: Fixed::from_int(y),
        }
    }

    /// Construct from raw Q32.32 components.
    #[must_use]
    pub fn from_raw(x: i64, y: i64) -> Self {
        Self {
            x: Fixed::from_raw(x),
            y: Fixed::from_raw(y),
        }
    }

    /// Dot product, saturating at the scalar boundary.
    #[must_use]
    pub fn dot(self, rhs: Self) -> Fixed {
        let wide = i128::from(self.x.raw()) * i128::from(rhs.x.raw())
            + i128::from(self.y.raw()) * i128::from(rhs.y.raw());
        Fixed::from_raw(saturate_i128(wide >> FRAC_BITS))
    }

    /// Squared length, saturating at the scalar boundary.
    #[must_use]
    pub fn length_sq(self) -> Fixed {
        self.dot(self)
    }

    /// Euclidean length via the exact widened sum of squares.
    #[must_use]
    pub fn length(self) -> Fixed {
        let ax = u128::from(self.x.raw().unsigned_abs());
        let ay = u128::from(self.y.raw().unsigned_abs());
        let wide = ax * ax + ay * ay;
        // wide is (value^2) << 64; the root of (wide) is (length) << 32.
        let root = isqrt_u128(wide);
        Fixed::from_raw(i64::try_from(root).unwrap_or(i64::MAX))
    }

    /// Unit vector in the same direction.
    ///
    /// # Errors
    ///
    /// Fails with [`MathError::DivideByZero`] for the zero vector.
    pub fn normalize(self) -> Result<Self, MathError> {
        let len = self.length();
        Ok(Self {
            x: self.x.checked_div(len)?,
            y: self.y.checked_div(len)?,
        })
    }

    /// Scale by a scalar.
    #[must_use]
    pub fn scale(self, s: Fixed) -> Self {
        Self {
            x: self.x * s,
            y: self.y * s,
        }
    }
}

impl Add for Fixed2 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
        }
    }
}

impl Sub for Fixed2 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
        }
    }
}

impl Neg for Fixed2 {
    type Output = Self;
    fn neg(self) -> Self {
        Self {
            x: -self.x,
            y: -self.y,
        }
    }
}
