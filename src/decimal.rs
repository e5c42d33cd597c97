//! Fixed-point decimal type with 4 decimal places precision.
//!
//! Uses `rust_decimal` internally with scale enforcement so that allocation
//! arithmetic never touches floating point.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

/// A decimal type that maintains exactly 4 decimal places of precision.
///
/// This type wraps `rust_decimal::Decimal` and ensures consistent scale
/// for all arithmetic operations, suitable for monetary calculations.
///
/// # Examples
///
/// ```
/// use std::str::FromStr;
/// use deposit_allocator::Decimal4;
///
/// let amount = Decimal4::from_str("10.5").unwrap();
/// assert_eq!(amount.to_string(), "10.5000");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Decimal4(Decimal);

impl Decimal4 {
    /// The number of decimal places to maintain.
    pub const SCALE: u32 = 4;

    /// Zero value.
    pub const ZERO: Self = Decimal4(Decimal::ZERO);

    /// Creates a new `Decimal4` from a `Decimal`, normalizing to 4 decimal places.
    pub fn new(value: Decimal) -> Self {
        let mut normalized = value;
        normalized.rescale(Self::SCALE);
        Decimal4(normalized)
    }

    /// Like [`Decimal4::new`], but `None` when the value is too large to keep
    /// 4 decimal places.
    pub fn checked_new(value: Decimal) -> Option<Self> {
        let mut normalized = value;
        normalized.rescale(Self::SCALE);
        (normalized.scale() == Self::SCALE).then_some(Decimal4(normalized))
    }

    /// `self + rhs`, or `None` on overflow or loss of scale.
    pub fn checked_add(self, rhs: Decimal4) -> Option<Self> {
        self.0.checked_add(rhs.0).and_then(Decimal4::checked_new)
    }

    /// `self - rhs`, or `None` on overflow or loss of scale.
    pub fn checked_sub(self, rhs: Decimal4) -> Option<Self> {
        self.0.checked_sub(rhs.0).and_then(Decimal4::checked_new)
    }

    /// Sum of `values`, or `None` as soon as a partial sum overflows.
    pub fn checked_sum<I>(values: I) -> Option<Self>
    where
        I: IntoIterator<Item = Decimal4>,
    {
        values
            .into_iter()
            .try_fold(Decimal4::ZERO, |acc, value| acc.checked_add(value))
    }

    /// Returns `true` if this value is zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Returns `true` if this value is strictly greater than zero.
    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// Returns `true` if this value is strictly less than zero.
    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    /// Computes `self × part / whole`, rounded to 4 decimal places.
    ///
    /// Returns `None` when `whole` is zero or the intermediate product overflows.
    pub fn share(self, part: Decimal4, whole: Decimal4) -> Option<Self> {
        if whole.is_zero() {
            return None;
        }
        self.0
            .checked_mul(part.0)
            .and_then(|product| product.checked_div(whole.0))
            .and_then(Decimal4::checked_new)
    }

    /// Half of this value, rounded to 4 decimal places.
    ///
    /// `x - x.half()` is the exact complement, so splitting a value in two
    /// never loses the last unit of precision.
    pub fn half(self) -> Self {
        Decimal4::new(self.0 / Decimal::TWO)
    }

    /// Returns the underlying `Decimal`.
    pub fn into_inner(self) -> Decimal {
        self.0
    }
}

impl From<Decimal> for Decimal4 {
    fn from(value: Decimal) -> Self {
        Decimal4::new(value)
    }
}

impl From<i64> for Decimal4 {
    fn from(value: i64) -> Self {
        Decimal4::new(Decimal::from(value))
    }
}

impl FromStr for Decimal4 {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let decimal = Decimal::from_str(trimmed)?;
        Decimal4::checked_new(decimal).ok_or(if decimal.is_sign_negative() {
            rust_decimal::Error::LessThanMinimumPossibleValue
        } else {
            rust_decimal::Error::ExceedsMaximumPossibleValue
        })
    }
}

impl fmt::Display for Decimal4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

impl Add for Decimal4 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Decimal4::new(self.0 + rhs.0)
    }
}

impl AddAssign for Decimal4 {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
        self.0.rescale(Self::SCALE);
    }
}

impl Sub for Decimal4 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Decimal4::new(self.0 - rhs.0)
    }
}

impl SubAssign for Decimal4 {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
        self.0.rescale(Self::SCALE);
    }
}

impl Sum for Decimal4 {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Decimal4::ZERO, |acc, value| acc + value)
    }
}

impl<'a> Sum<&'a Decimal4> for Decimal4 {
    fn sum<I: Iterator<Item = &'a Decimal4>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

impl Serialize for Decimal4 {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:.4}", self.0))
    }
}

impl<'de> Deserialize<'de> for Decimal4 {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Decimal4::from_str(&s).map_err(serde::de::Error::custom)
    }
}
