//! # Quantity Module
//!
//! `Liters` and `Price`: decimal newtypes for fuel volumes and unit prices.
//!
//! ## Why Decimal?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  THE FLOATING POINT PROBLEM                                             │
//! │                                                                         │
//! │  With f64:  0.1 L + 0.2 L = 0.30000000000000004 L                       │
//! │  A ledger that sums thousands of partial fills drifts.                  │
//! │                                                                         │
//! │  OUR SOLUTION: rust_decimal::Decimal in memory and on the wire,         │
//! │  integer milli-liters in SQLite so the aggregate upsert is one          │
//! │  atomic integer addition.                                               │
//! │                                                                         │
//! │     "12.5" ──parse──► Liters(12.5) ──to_milli──► 12500                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::ValidationError;

/// Milli-units per unit.
const MILLI: i64 = 1000;

/// Decimal places a reported quantity may carry.
const MILLI_SCALE: u32 = 3;

// =============================================================================
// Liters
// =============================================================================

/// A fuel volume in liters.
///
/// Negative values are representable so subtraction stays total, but every
/// ledger entry and every wire quantity is validated as non-negative or
/// positive before it is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Liters(Decimal);

impl Liters {
    /// Zero liters.
    pub const ZERO: Liters = Liters(Decimal::ZERO);

    /// Largest quantity accepted in one request, and the cap on a tank level.
    pub const MAX: Liters = Liters(Decimal::from_parts(1_000_000_000, 0, 0, false, 0));

    /// Wraps a raw decimal.
    pub fn new(value: Decimal) -> Self {
        Liters(value)
    }

    /// Whole liters.
    pub fn from_whole(liters: u32) -> Self {
        Liters(Decimal::from(liters))
    }

    /// From integer milli-liters (database representation).
    pub fn from_milli(milli: i64) -> Self {
        Liters(Decimal::new(milli, 3))
    }

    /// To integer milli-liters, rounding to the nearest milli-liter.
    ///
    /// Returns `None` if the value does not fit in an `i64`.
    pub fn to_milli(&self) -> Option<i64> {
        self.0.checked_mul(Decimal::from(MILLI))?.round().to_i64()
    }

    /// `None` on decimal overflow.
    pub fn checked_add(self, rhs: Liters) -> Option<Liters> {
        self.0.checked_add(rhs.0).map(Liters)
    }

    /// Clamps at the decimal limits instead of overflowing.
    pub fn saturating_add(self, rhs: Liters) -> Liters {
        Liters(self.0.saturating_add(rhs.0))
    }

    /// The raw decimal.
    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    /// Parses a quantity that must be strictly positive.
    pub fn parse_positive(field: &str, raw: &str) -> Result<Liters, ValidationError> {
        let liters = Liters::parse_bounded(field, raw)?;
        if !liters.is_positive() {
            return Err(ValidationError::MustBePositive {
                field: field.to_string(),
            });
        }
        Ok(liters)
    }

    /// Parses a requested quantity: at most [`Liters::MAX`] in magnitude and
    /// no finer than one milli-liter. The sign is left to the caller.
    pub fn parse_bounded(field: &str, raw: &str) -> Result<Liters, ValidationError> {
        let liters = Liters::parse_field(field, raw)?;
        if liters.0.abs() > Liters::MAX.0 {
            return Err(ValidationError::OutOfRange {
                field: field.to_string(),
                max: Liters::MAX.to_string(),
            });
        }
        if liters.0.normalize().scale() > MILLI_SCALE {
            return Err(ValidationError::invalid_format(
                field,
                format!("at most {} decimal places", MILLI_SCALE),
            ));
        }
        Ok(liters)
    }

    fn parse_field(field: &str, raw: &str) -> Result<Liters, ValidationError> {
        parse_decimal(raw)
            .map(Liters)
            .map_err(|reason| ValidationError::invalid_format(field, reason))
    }
}

impl fmt::Display for Liters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0.normalize().to_string())
    }
}

impl FromStr for Liters {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Liters::parse_field("quantity", s)
    }
}

impl Add for Liters {
    type Output = Liters;

    fn add(self, rhs: Liters) -> Liters {
        Liters(self.0 + rhs.0)
    }
}

impl Sub for Liters {
    type Output = Liters;

    fn sub(self, rhs: Liters) -> Liters {
        Liters(self.0 - rhs.0)
    }
}

impl Sum for Liters {
    fn sum<I: Iterator<Item = Liters>>(iter: I) -> Liters {
        iter.fold(Liters::ZERO, |acc, l| acc + l)
    }
}

// =============================================================================
// Price
// =============================================================================

/// Price of one liter of a commodity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Price(Decimal);

impl Price {
    pub fn new(value: Decimal) -> Self {
        Price(value)
    }

    pub fn from_whole(amount: u32) -> Self {
        Price(Decimal::from(amount))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Parses a price that must not be negative.
    pub fn parse_non_negative(field: &str, raw: &str) -> Result<Price, ValidationError> {
        let value =
            parse_decimal(raw).map_err(|reason| ValidationError::invalid_format(field, reason))?;
        if value < Decimal::ZERO {
            return Err(ValidationError::MustNotBeNegative {
                field: field.to_string(),
            });
        }
        Ok(Price(value))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0.normalize().to_string())
    }
}

impl FromStr for Price {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Price::parse_non_negative("price", s)
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Parses a plain decimal literal such as `10`, `10.0` or `-2.75`.
fn parse_decimal(raw: &str) -> Result<Decimal, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty value".to_string());
    }
    Decimal::from_str(trimmed).map_err(|_| format!("'{}' is not a number", trimmed))
}

// =============================================================================
// Tests
// =============================================================================
