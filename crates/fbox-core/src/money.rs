//! # Money Module
//!
//! Provides the `Money` type for voucher balances and rental charges.
//!
//! ## Why a Newtype?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Won has no minor unit in practice, so every amount is a whole i64.    │
//! │                                                                         │
//! │  VoucherProduct.charge_amount ──► MemberVoucher.remaining_amount       │
//! │                                          │                              │
//! │  Product.price × confirmed qty ──► charge ──► deduction per voucher    │
//! │                                                                         │
//! │  Wrapping the integer keeps quantities (units dispensed) and amounts   │
//! │  (won charged) from being mixed up in the settlement arithmetic.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use fbox_core::money::Money;
//!
//! let price = Money::from_won(600);
//! let owed = price * 2;
//! assert_eq!(owed.won(), 1200);
//! assert_eq!(owed.to_string(), "₩1,200");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};

// =============================================================================
// Money Type
// =============================================================================

/// A monetary amount in won.
///
/// ## Design Decisions
/// - **i64 (signed)**: differences such as `owed - paid` stay representable
/// - **transparent serde**: serialises as a bare integer on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from whole won.
    #[inline]
    pub const fn from_won(won: i64) -> Self {
        Money(won)
    }

    /// Returns the amount in won.
    #[inline]
    pub const fn won(&self) -> i64 {
        self.0
    }

    /// Returns zero money value.
    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    /// Checks if the value is zero.
    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checks if the value is positive (greater than zero).
    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Checks if the value is negative (less than zero).
    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Multiplies a unit price by a quantity.
    ///
    /// ## Example
    /// ```rust
    /// use fbox_core::money::Money;
    ///
    /// let unit_price = Money::from_won(1000);
    /// assert_eq!(unit_price.multiply_quantity(3).won(), 3000);
    /// ```
    #[inline]
    pub const fn multiply_quantity(&self, qty: i64) -> Self {
        Money(self.0 * qty)
    }

    /// Adds, returning `None` on overflow.
    ///
    /// Caller-supplied amounts are totalled with this; `+` and `Sum` are for
    /// ledger-bounded values.
    #[inline]
    pub const fn checked_add(self, other: Money) -> Option<Money> {
        match self.0.checked_add(other.0) {
            Some(won) => Some(Money(won)),
            None => None,
        }
    }

    /// Subtracts, returning `None` if the result would go below zero.
    ///
    /// Balances never go negative, so deduction paths use this instead of `-`.
    #[inline]
    pub fn checked_deduct(self, amount: Money) -> Option<Money> {
        if amount.0 > self.0 {
            None
        } else {
            Some(Money(self.0 - amount.0))
        }
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

/// Renders as `₩1,200` (thousands grouped, sign in front).
impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let digits = self.0.unsigned_abs().to_string();
        let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
        for (i, ch) in digits.chars().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                grouped.push(',');
            }
            grouped.push(ch);
        }
        write!(f, "{}₩{}", sign, grouped)
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::zero()
    }
}

impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Money(self.0 - other.0)
    }
}

impl SubAssign for Money {
    #[inline]
    fn sub_assign(&mut self, other: Self) {
        self.0 -= other.0;
    }
}

impl Mul<i64> for Money {
    type Output = Self;

    #[inline]
    fn mul(self, qty: i64) -> Self {
        Money(self.0 * qty)
    }
}

/// Sums ledger-bounded amounts (prices, balances, deductions). Use
/// [`Money::checked_add`] for totals of untrusted input.
impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), |acc, m| acc + *m)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
