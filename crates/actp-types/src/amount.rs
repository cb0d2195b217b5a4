//! Amount type with 6-decimal micro-unit precision
//!
//! ACTP amounts are unsigned integers in smallest currency units with six
//! implied decimal places (value x 10^6). Display formatting beyond the
//! canonical decimal form is the caller's responsibility.

use crate::{ActpError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};

/// Number of implied decimal places
pub const DECIMALS: u32 = 6;

/// Micro-units per whole unit (10^6)
pub const MICRO_PER_UNIT: u64 = 1_000_000;

/// Unsigned amount in micro-units (6 implied decimals)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Amount(pub u64);

impl Amount {
    /// Create an amount from raw micro-units
    pub fn from_micro(micro: u64) -> Self {
        Self(micro)
    }

    /// Create an amount from whole units (e.g. 10 -> 10_000000 micro)
    pub fn from_units(units: u64) -> Self {
        Self(units * MICRO_PER_UNIT)
    }

    /// Create a zero amount
    pub fn zero() -> Self {
        Self(0)
    }

    /// Raw micro-unit value
    pub fn micro(&self) -> u64 {
        self.0
    }

    /// Check if the amount is zero
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checked addition
    pub fn checked_add(self, other: Self) -> Result<Self> {
        self.0
            .checked_add(other.0)
            .map(Self)
            .ok_or(ActpError::AmountOverflow)
    }

    /// Checked subtraction
    pub fn checked_sub(self, other: Self) -> Result<Self> {
        self.0
            .checked_sub(other.0)
            .map(Self)
            .ok_or(ActpError::AmountUnderflow)
    }

    /// Sum a payout list with overflow checking
    pub fn checked_sum<'a, I: IntoIterator<Item = &'a Amount>>(amounts: I) -> Result<Self> {
        amounts
            .into_iter()
            .try_fold(Amount::zero(), |acc, a| acc.checked_add(*a))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.0 / MICRO_PER_UNIT,
            self.0 % MICRO_PER_UNIT
        )
    }
}

// Convenience operators for test code; protocol code uses the checked forms.
impl Add for Amount {
    type Output = Self;

    fn add(self, other: Self) -> Self::Output {
        Self(self.0 + other.0)
    }
}

impl Sub for Amount {
    type Output = Self;

    fn sub(self, other: Self) -> Self::Output {
        Self(self.0 - other.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self(iter.map(|a| a.0).sum())
    }
}
