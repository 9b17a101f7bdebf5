//! Fixed-Point Money and Multipliers
//!
//! All stake, balance and payout arithmetic uses integer hundredths.
//! Floats only appear at the wire boundary (JSON numbers) and are
//! rounded to hundredths on the way in.
//!
//! ## Format
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Amount      i64 hundredths      12345  ==  123.45          │
//! │  Multiplier  u32 hundredths        115  ==  1.15x           │
//! │                                                             │
//! │  payout = round_half_up(stake * multiplier / 100)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Hundredths per whole unit.
pub const HUNDREDTHS: i64 = 100;

/// A currency amount in hundredths ("cents").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

impl Amount {
    /// Zero.
    pub const ZERO: Amount = Amount(0);

    /// Create from raw hundredths.
    #[inline]
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Create from whole units.
    #[inline]
    pub const fn from_units(units: i64) -> Self {
        Self(units * HUNDREDTHS)
    }

    /// Convert a decimal to hundredths, rounding half away from zero.
    ///
    /// Returns `None` for NaN, infinities and values outside the i64 range.
    pub fn from_decimal(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        let scaled = (value * HUNDREDTHS as f64).round();
        if scaled.abs() >= i64::MAX as f64 {
            return None;
        }
        Some(Self(scaled as i64))
    }

    /// Raw hundredths.
    #[inline]
    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Value as a float for display and the wire.
    #[inline]
    pub fn to_decimal(self) -> f64 {
        self.0 as f64 / HUNDREDTHS as f64
    }

    /// Strictly greater than zero.
    #[inline]
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Checked addition.
    #[inline]
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Checked subtraction.
    #[inline]
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Payout of this stake at `multiplier`, rounded half up to hundredths.
    ///
    /// Saturates at `i64::MAX` instead of wrapping.
    pub fn scaled_by(self, multiplier: Multiplier) -> Amount {
        let product = self.0 as i128 * multiplier.hundredths() as i128;
        let half = if product >= 0 { 50 } else { -50 };
        let rounded = (product + half) / HUNDREDTHS as i128;
        Amount(rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_decimal())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Amount::from_decimal(value).ok_or_else(|| D::Error::custom("amount is not a finite number"))
    }
}

/// A payout multiplier in hundredths (`100` == 1.00x).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Multiplier(u32);

impl Multiplier {
    /// 1.00x, the value every round starts at.
    pub const ONE: Multiplier = Multiplier(100);

    /// Create from raw hundredths.
    #[inline]
    pub const fn from_hundredths(hundredths: u32) -> Self {
        Self(hundredths)
    }

    /// Convert a decimal multiplier, rounding to hundredths.
    pub fn from_decimal(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let scaled = (value * 100.0).round();
        if scaled > u32::MAX as f64 {
            return None;
        }
        Some(Self(scaled as u32))
    }

    /// Raw hundredths.
    #[inline]
    pub const fn hundredths(self) -> u32 {
        self.0
    }

    /// Value as a float for display and the wire.
    #[inline]
    pub fn to_decimal(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl Default for Multiplier {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}x", self.0 / 100, self.0 % 100)
    }
}

impl Serialize for Multiplier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_decimal())
    }
}

impl<'de> Deserialize<'de> for Multiplier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Multiplier::from_decimal(value)
            .ok_or_else(|| D::Error::custom("multiplier is not a finite non-negative number"))
    }
}
