//! Decimal arithmetic helpers and the normative cash rounding policy.
//!
//! Share quantities, prices and audit-precision costs are
//! `rust_decimal::Decimal`; every persisted cash amount is an `i64` of minor
//! units. The three conversions below are the only Decimal → minor-unit cash
//! boundaries in the crate:
//!
//! - debits to the user round half-up (the user pays at least the decimal
//!   amount),
//! - credits to the user round half-down,
//! - fees are computed last and floored.
//!
//! The asymmetry leaves the house holding sub-cent dust, which reconciliation
//! reports under custody and fee revenue.

use crate::error::{CoreError, CoreResult};
use rust_decimal::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};

/// Minor units per currency unit (cents).
pub const MINOR_PER_UNIT: i64 = 100;

/// Clamp band for exponent arguments. exp(709) overflows an IEEE double;
/// inputs outside the band saturate rather than produce infinities.
pub const EXP_CLAMP: f64 = 700.0;

/// exp with the argument clamped to [-EXP_CLAMP, EXP_CLAMP].
#[inline]
pub fn safe_exp(x: f64) -> f64 {
    x.clamp(-EXP_CLAMP, EXP_CLAMP).exp()
}

/// ln that fails instead of returning NaN or -inf.
#[inline]
pub fn safe_ln(x: f64) -> CoreResult<f64> {
    if !x.is_finite() || x <= 0.0 {
        return Err(CoreError::Domain(format!(
            "ln undefined for non-positive argument {x}"
        )));
    }
    Ok(x.ln())
}

/// Decimal → f64 bridge for the log-domain LMSR internals.
#[inline]
pub fn to_f64(value: Decimal) -> CoreResult<f64> {
    value
        .to_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| CoreError::Domain(format!("value {value} is not representable as f64")))
}

/// f64 → Decimal bridge; rejects NaN and infinities.
#[inline]
pub fn from_f64(value: f64) -> CoreResult<Decimal> {
    if !value.is_finite() {
        return Err(CoreError::Domain(format!(
            "non-finite value {value} cannot become a Decimal"
        )));
    }
    Decimal::from_f64(value)
        .ok_or_else(|| CoreError::Domain(format!("value {value} out of Decimal range")))
}

/// Round to `dp` decimal places, half-up.
#[inline]
pub fn to_fixed(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

/// Cash the user pays, in minor units: round half-up.
pub fn debit_minor(amount: Decimal) -> CoreResult<i64> {
    if amount < Decimal::ZERO {
        return Err(CoreError::Domain(format!(
            "debit amount {amount} must be non-negative"
        )));
    }
    let cents = to_fixed(amount * Decimal::from(MINOR_PER_UNIT), 0);
    cents
        .to_i64()
        .ok_or_else(|| CoreError::Domain(format!("debit {amount} out of minor-unit range")))
}

/// Cash the user receives, in minor units: round half-down.
pub fn credit_minor(amount: Decimal) -> CoreResult<i64> {
    if amount < Decimal::ZERO {
        return Err(CoreError::Domain(format!(
            "credit amount {amount} must be non-negative"
        )));
    }
    let cents = (amount * Decimal::from(MINOR_PER_UNIT))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointTowardZero);
    cents
        .to_i64()
        .ok_or_else(|| CoreError::Domain(format!("credit {amount} out of minor-unit range")))
}

/// Fee on a cash leg, computed last and floored.
pub fn fee_minor(amount_minor: i64, bps: u32) -> i64 {
    let fee = amount_minor.unsigned_abs() as u128 * bps as u128 / 10_000;
    fee as i64
}

/// Minor units back to a Decimal of currency units.
#[inline]
pub fn minor_to_decimal(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}
