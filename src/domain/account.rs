use super::ids::UserId;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// A balance bucket expressed in minor currency units.
///
/// The engine never lets a bucket go below zero; the clamping helpers on the
/// projections below are the only way to take money out of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Balance(pub i64);

/// A strictly positive amount of minor currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub fn new(value: i64) -> Result<Self> {
        if value > 0 {
            Ok(Self(value))
        } else {
            Err(PaymentError::ValidationError(format!(
                "Amount must be positive, got {}",
                value
            )))
        }
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for Amount {
    type Error = PaymentError;

    fn try_from(value: i64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Amount> for Balance {
    fn from(amount: Amount) -> Self {
        Self(amount.0)
    }
}

impl Balance {
    pub const ZERO: Self = Self(0);

    pub fn new(minor_units: i64) -> Self {
        Self(minor_units)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    /// Removes up to `amount` from this bucket and returns what was actually removed.
    pub fn take_up_to(&mut self, amount: i64) -> i64 {
        let taken = amount.clamp(0, self.0.max(0));
        self.0 -= taken;
        taken
    }
}

impl Add for Balance {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Balance {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl AddAssign for Balance {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Balance {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl From<Amount> for i64 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

/// Fails with `ValidationError` when crediting `amount` would push
/// `available + locked` past `i64::MAX`. With that sum bounded, moves between
/// the two buckets cannot overflow either.
fn check_headroom(available: Balance, locked: Balance, amount: Amount) -> Result<()> {
    available
        .0
        .checked_add(locked.0)
        .and_then(|total| total.checked_add(amount.value()))
        .map(|_| ())
        .ok_or_else(|| {
            PaymentError::ValidationError(format!(
                "Crediting {} would overflow balance {}",
                amount.value(),
                available.0.saturating_add(locked.0)
            ))
        })
}

/// Converts a major-unit decimal (e.g. `600.50`) into minor units.
///
/// Rejects values carrying more precision than one minor unit.
pub fn to_minor_units(value: Decimal, exponent: u32) -> Result<i64> {
    let factor = Decimal::from(10i64.pow(exponent));
    let scaled = value
        .checked_mul(factor)
        .ok_or_else(|| PaymentError::ValidationError(format!("Amount {} overflows", value)))?;
    if !scaled.fract().is_zero() {
        return Err(PaymentError::ValidationError(format!(
            "Amount {} has more than {} decimal places",
            value, exponent
        )));
    }
    scaled
        .to_i64()
        .ok_or_else(|| PaymentError::ValidationError(format!("Amount {} overflows", value)))
}

pub fn from_minor_units(minor_units: i64, exponent: u32) -> Decimal {
    Decimal::new(minor_units, exponent).normalize()
}

/// Denormalized student wallet projection.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct WalletBalance {
    pub user_id: UserId,
    /// Spendable funds.
    pub available: Balance,
    /// Funds reserved against pending sessions.
    pub locked: Balance,
    pub currency: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl WalletBalance {
    pub fn new(user_id: UserId, currency: &str) -> Self {
        Self {
            user_id,
            available: Balance::ZERO,
            locked: Balance::ZERO,
            currency: currency.to_string(),
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn total(&self) -> Balance {
        self.available + self.locked
    }

    pub fn credit(&mut self, amount: Amount) -> Result<()> {
        check_headroom(self.available, self.locked, amount)?;
        self.available += amount.into();
        Ok(())
    }

    /// Moves funds from available to locked.
    pub fn reserve(&mut self, amount: Amount) -> Result<()> {
        if self.available >= amount.into() {
            self.available -= amount.into();
            self.locked += amount.into();
            Ok(())
        } else {
            Err(PaymentError::InsufficientFunds {
                available: self.available.value(),
                requested: amount.value(),
            })
        }
    }

    /// Returns up to `amount` of locked funds to available; yields the amount moved.
    pub fn release(&mut self, amount: Amount) -> i64 {
        let moved = self.locked.take_up_to(amount.value());
        self.available += Balance(moved);
        moved
    }

    /// Consumes locked funds on capture.
    pub fn settle_locked(&mut self, amount: Amount) -> Result<()> {
        if self.locked >= amount.into() {
            self.locked -= amount.into();
            Ok(())
        } else {
            Err(PaymentError::InsufficientFunds {
                available: self.locked.value(),
                requested: amount.value(),
            })
        }
    }
}

/// How a mentor-side reversal was funded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reversal {
    pub from_locked: i64,
    pub from_available: i64,
}

impl Reversal {
    pub fn total(&self) -> i64 {
        self.from_locked + self.from_available
    }
}

/// Denormalized mentor earnings projection.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct MentorEarnings {
    pub mentor_id: UserId,
    /// Matured earnings, withdrawable through payouts.
    pub available: Balance,
    /// Captured earnings still inside the maturation window.
    pub locked: Balance,
    pub currency: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl MentorEarnings {
    pub fn new(mentor_id: UserId, currency: &str) -> Self {
        Self {
            mentor_id,
            available: Balance::ZERO,
            locked: Balance::ZERO,
            currency: currency.to_string(),
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn total(&self) -> Balance {
        self.available + self.locked
    }

    pub fn lock(&mut self, amount: Amount) -> Result<()> {
        check_headroom(self.available, self.locked, amount)?;
        self.locked += amount.into();
        Ok(())
    }

    /// Moves up to `amount` from locked to available; yields the amount moved.
    pub fn mature(&mut self, amount: i64) -> i64 {
        let moved = self.locked.take_up_to(amount);
        self.available += Balance(moved);
        moved
    }

    /// Debits a refund share, locked bucket first.
    pub fn reverse(&mut self, amount: Amount) -> Reversal {
        let from_locked = self.locked.take_up_to(amount.value());
        let from_available = self.available.take_up_to(amount.value() - from_locked);
        Reversal {
            from_locked,
            from_available,
        }
    }

    pub fn withdraw(&mut self, amount: Amount) -> Result<()> {
        if self.available >= amount.into() {
            self.available -= amount.into();
            Ok(())
        } else {
            Err(PaymentError::InsufficientFunds {
                available: self.available.value(),
                requested: amount.value(),
            })
        }
    }

    pub fn credit_available(&mut self, amount: Amount) -> Result<()> {
        check_headroom(self.available, self.locked, amount)?;
        self.available += amount.into();
        Ok(())
    }
}
