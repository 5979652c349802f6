//! LMSR (Logarithmic Market Scoring Rule) pricing engine.
//!
//! State is (b, q_yes, q_no). Cost and price follow Hanson:
//!
//! ```text
//! C(q)     = b * ln(exp(q_yes/b) + exp(q_no/b))
//! p_yes(q) = exp(q_yes/b) / (exp(q_yes/b) + exp(q_no/b))
//! ```
//!
//! Internals run in f64 log-domain with max-shifted exponentials so large
//! q/b never overflows; the public surface speaks Decimal and signed
//! minor-unit cash. Position sufficiency for sells is the trading
//! pipeline's job, not this module's.

use crate::config::Config;
use crate::decimal::{self, credit_minor, debit_minor, safe_exp, safe_ln};
use crate::error::{CoreError, CoreResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Convergence tolerance for prices, and the band checked by tests on
/// p_yes + p_no.
pub const PRICE_TOLERANCE: f64 = 1e-4;

const DEPTH_MAX_SHARES: f64 = 10_000.0;
const DEPTH_MAX_ITERATIONS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Yes => "yes",
            Outcome::No => "no",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "yes" => Ok(Outcome::Yes),
            "no" => Ok(Outcome::No),
            other => Err(CoreError::InvalidOutcome(format!(
                "expected 'yes' or 'no', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "buy" => Ok(TradeSide::Buy),
            "sell" => Ok(TradeSide::Sell),
            other => Err(CoreError::InvalidOutcome(format!(
                "expected 'buy' or 'sell', got '{other}'"
            ))),
        }
    }
}

/// Market-maker state, 1:1 with a market. `liquidity_b` is immutable after
/// seeding; quantities are signed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LmsrState {
    pub liquidity_b: Decimal,
    pub q_yes: Decimal,
    pub q_no: Decimal,
}

impl LmsrState {
    pub fn new(liquidity_b: Decimal) -> Self {
        Self {
            liquidity_b,
            q_yes: Decimal::ZERO,
            q_no: Decimal::ZERO,
        }
    }

    fn to_f64(&self) -> CoreResult<(f64, f64, f64)> {
        let b = decimal::to_f64(self.liquidity_b)?;
        let q_yes = decimal::to_f64(self.q_yes)?;
        let q_no = decimal::to_f64(self.q_no)?;
        if b <= 0.0 {
            return Err(CoreError::InvalidLiquidity(self.liquidity_b.to_string()));
        }
        Ok((b, q_yes, q_no))
    }
}

/// Everything a quote needs: prices around the fill, decimal cost for audit,
/// and the authoritative signed minor-unit cash amount (positive = user
/// pays, negative = user receives).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteComputation {
    pub outcome: Outcome,
    pub side: TradeSide,
    pub shares: Decimal,
    pub cost: Decimal,
    pub cost_minor: i64,
    pub avg_price: Decimal,
    pub start_price: Decimal,
    pub end_price: Decimal,
    pub price_impact: Decimal,
    pub new_q_yes: Decimal,
    pub new_q_no: Decimal,
}

#[inline]
fn log_sum_exp(a: f64, b: f64) -> f64 {
    let m = a.max(b);
    // if m is -inf (both inputs -inf), this still returns -inf
    m + (safe_exp(a - m) + safe_exp(b - m)).ln()
}

#[inline]
fn cost_f64(q_yes: f64, q_no: f64, b: f64) -> f64 {
    b * log_sum_exp(q_yes / b, q_no / b)
}

#[inline]
fn prob_yes_f64(q_yes: f64, q_no: f64, b: f64) -> f64 {
    let a = q_yes / b;
    let c = q_no / b;
    let m = a.max(c);
    let ey = safe_exp(a - m);
    let en = safe_exp(c - m);
    ey / (ey + en)
}

fn prob_of(outcome: Outcome, q_yes: f64, q_no: f64, b: f64) -> f64 {
    match outcome {
        Outcome::Yes => prob_yes_f64(q_yes, q_no, b),
        Outcome::No => 1.0 - prob_yes_f64(q_yes, q_no, b),
    }
}

/// C(S) as a Decimal of currency units.
pub fn cost(state: &LmsrState) -> CoreResult<Decimal> {
    let (b, q_yes, q_no) = state.to_f64()?;
    decimal::from_f64(cost_f64(q_yes, q_no, b))
}

/// (p_yes, p_no). p_no is the exact complement so the pair sums to one.
pub fn prices(state: &LmsrState) -> CoreResult<(Decimal, Decimal)> {
    let (b, q_yes, q_no) = state.to_f64()?;
    let p_yes = decimal::from_f64(prob_yes_f64(q_yes, q_no, b))?;
    Ok((p_yes, Decimal::ONE - p_yes))
}

pub fn validate_liquidity(config: &Config, liquidity_b: Decimal) -> CoreResult<()> {
    if liquidity_b < config.lmsr.b_min || liquidity_b > config.lmsr.b_max {
        return Err(CoreError::InvalidLiquidity(format!(
            "{liquidity_b} not in [{}, {}]",
            config.lmsr.b_min, config.lmsr.b_max
        )));
    }
    Ok(())
}

pub fn validate_shares(config: &Config, shares: Decimal) -> CoreResult<()> {
    if shares < config.lmsr.shares_min || shares > config.lmsr.shares_max {
        return Err(CoreError::InvalidShares(format!(
            "{shares} not in [{}, {}]",
            config.lmsr.shares_min, config.lmsr.shares_max
        )));
    }
    Ok(())
}

/// Quote the cost of buying `shares` of `outcome` against `state`.
pub fn buy_quote(
    config: &Config,
    state: &LmsrState,
    outcome: Outcome,
    shares: Decimal,
) -> CoreResult<QuoteComputation> {
    validate_liquidity(config, state.liquidity_b)?;
    validate_shares(config, shares)?;

    let (b, q_yes, q_no) = state.to_f64()?;
    let delta = decimal::to_f64(shares)?;

    let start_price = prob_of(outcome, q_yes, q_no, b);
    let (new_q_yes, new_q_no) = match outcome {
        Outcome::Yes => (q_yes + delta, q_no),
        Outcome::No => (q_yes, q_no + delta),
    };
    let cost = cost_f64(new_q_yes, new_q_no, b) - cost_f64(q_yes, q_no, b);
    let end_price = prob_of(outcome, new_q_yes, new_q_no, b);

    let cost_dec = decimal::from_f64(cost)?;
    let cost_minor = debit_minor(cost_dec)?;
    let start_dec = decimal::from_f64(start_price)?;
    let end_dec = decimal::from_f64(end_price)?;

    Ok(QuoteComputation {
        outcome,
        side: TradeSide::Buy,
        shares,
        cost: cost_dec,
        cost_minor,
        avg_price: cost_dec / shares,
        start_price: start_dec,
        end_price: end_dec,
        price_impact: end_dec - start_dec,
        new_q_yes: decimal::from_f64(new_q_yes)?,
        new_q_no: decimal::from_f64(new_q_no)?,
    })
}

/// Quote the proceeds of selling `shares` of `outcome` back to the market.
/// Reported as a negative cost; whether the caller actually holds the
/// shares is checked by the trading pipeline.
pub fn sell_quote(
    config: &Config,
    state: &LmsrState,
    outcome: Outcome,
    shares: Decimal,
) -> CoreResult<QuoteComputation> {
    validate_liquidity(config, state.liquidity_b)?;
    validate_shares(config, shares)?;

    let (b, q_yes, q_no) = state.to_f64()?;
    let delta = decimal::to_f64(shares)?;

    let start_price = prob_of(outcome, q_yes, q_no, b);
    let (new_q_yes, new_q_no) = match outcome {
        Outcome::Yes => (q_yes - delta, q_no),
        Outcome::No => (q_yes, q_no - delta),
    };
    let proceeds = cost_f64(q_yes, q_no, b) - cost_f64(new_q_yes, new_q_no, b);
    let end_price = prob_of(outcome, new_q_yes, new_q_no, b);

    let proceeds_dec = decimal::from_f64(proceeds)?;
    let proceeds_minor = credit_minor(proceeds_dec)?;
    let start_dec = decimal::from_f64(start_price)?;
    let end_dec = decimal::from_f64(end_price)?;

    Ok(QuoteComputation {
        outcome,
        side: TradeSide::Sell,
        shares,
        cost: -proceeds_dec,
        cost_minor: -proceeds_minor,
        avg_price: proceeds_dec / shares,
        start_price: start_dec,
        end_price: end_dec,
        price_impact: end_dec - start_dec,
        new_q_yes: decimal::from_f64(new_q_yes)?,
        new_q_no: decimal::from_f64(new_q_no)?,
    })
}

/// Initial state for a market targeting `initial_p_yes` (default 50/50):
/// q_no = 0, q_yes = b * ln(p / (1 - p)).
pub fn seed(
    config: &Config,
    liquidity_b: Decimal,
    initial_p_yes: Option<Decimal>,
) -> CoreResult<LmsrState> {
    validate_liquidity(config, liquidity_b)?;

    let Some(p_yes) = initial_p_yes else {
        return Ok(LmsrState::new(liquidity_b));
    };
    if p_yes <= Decimal::ZERO || p_yes >= Decimal::ONE {
        return Err(CoreError::Domain(format!(
            "initial probability {p_yes} must lie strictly between 0 and 1"
        )));
    }

    let b = decimal::to_f64(liquidity_b)?;
    let p = decimal::to_f64(p_yes)?;
    let q_yes = b * safe_ln(p / (1.0 - p))?;

    Ok(LmsrState {
        liquidity_b,
        q_yes: decimal::from_f64(q_yes)?,
        q_no: Decimal::ZERO,
    })
}

/// Shares of `outcome` to buy before p_outcome reaches `target`: binary
/// search on [shares_min, 10000], 1e-4 tolerance, midpoint after 50
/// iterations.
pub fn depth_to_price(
    config: &Config,
    state: &LmsrState,
    outcome: Outcome,
    target: Decimal,
) -> CoreResult<Decimal> {
    validate_liquidity(config, state.liquidity_b)?;
    if target <= Decimal::ZERO || target >= Decimal::ONE {
        return Err(CoreError::Domain(format!(
            "target price {target} must lie strictly between 0 and 1"
        )));
    }

    let (b, q_yes, q_no) = state.to_f64()?;
    let target_f = decimal::to_f64(target)?;
    let current = prob_of(outcome, q_yes, q_no, b);
    if target_f <= current {
        return Err(CoreError::Domain(format!(
            "target price {target} is not above the current price"
        )));
    }

    let price_after = |delta: f64| -> f64 {
        match outcome {
            Outcome::Yes => prob_of(outcome, q_yes + delta, q_no, b),
            Outcome::No => prob_of(outcome, q_yes, q_no + delta, b),
        }
    };

    let mut lo = decimal::to_f64(config.lmsr.shares_min)?;
    let mut hi = DEPTH_MAX_SHARES;
    for _ in 0..DEPTH_MAX_ITERATIONS {
        let mid = (lo + hi) / 2.0;
        let p = price_after(mid);
        if (p - target_f).abs() < PRICE_TOLERANCE {
            return decimal::from_f64(mid);
        }
        if p < target_f {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    decimal::from_f64((lo + hi) / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn config() -> Config {
        Config::default()
    }

    fn fresh(b: i64) -> LmsrState {
        LmsrState::new(Decimal::from(b))
    }

    fn p_yes(state: &LmsrState) -> f64 {
        decimal::to_f64(prices(state).unwrap().0).unwrap()
    }

    #[test]
    fn fresh_market_prices_at_even_money() {
        let state = fresh(100);
        let (yes, no) = prices(&state).unwrap();
        assert!((decimal::to_f64(yes).unwrap() - 0.5).abs() < PRICE_TOLERANCE);
        assert!((decimal::to_f64(no).unwrap() - 0.5).abs() < PRICE_TOLERANCE);

        // C(0,0) = b * ln 2
        let c = decimal::to_f64(cost(&state).unwrap()).unwrap();
        assert!((c - 100.0 * 2.0f64.ln()).abs() < 1e-6, "C = {c}");
        assert!((c - 69.3147).abs() < 1e-3);
    }

    #[test]
    fn buy_ten_yes_at_b_100_costs_512_minor() {
        let quote = buy_quote(&config(), &fresh(100), Outcome::Yes, dec!(10)).unwrap();

        // 100 * (ln(e^0.1 + 1) - ln 2) ~= 5.1249
        let cost = decimal::to_f64(quote.cost).unwrap();
        assert!((cost - 5.1249).abs() < 1e-3, "cost = {cost}");
        assert_eq!(quote.cost_minor, 512);

        let end = decimal::to_f64(quote.end_price).unwrap();
        let start = decimal::to_f64(quote.start_price).unwrap();
        assert!(end > 0.5 && end < 1.0);
        assert!((start - 0.5).abs() < PRICE_TOLERANCE);
        assert!(quote.price_impact > Decimal::ZERO);
    }

    #[test]
    fn no_arbitrage_band_for_matched_buys() {
        // Buy 10 YES then 10 NO from fresh; the pair is worth exactly 10
        // units at resolution, so total cost sits within 1% of 1000 minor.
        let cfg = config();
        let first = buy_quote(&cfg, &fresh(100), Outcome::Yes, dec!(10)).unwrap();
        let mid = LmsrState {
            liquidity_b: Decimal::from(100),
            q_yes: first.new_q_yes,
            q_no: first.new_q_no,
        };
        let second = buy_quote(&cfg, &mid, Outcome::No, dec!(10)).unwrap();

        let total = first.cost_minor + second.cost_minor;
        assert!((990..=1010).contains(&total), "total = {total}");
    }

    #[test]
    fn sell_quote_reports_negative_cash() {
        let cfg = config();
        let buy = buy_quote(&cfg, &fresh(100), Outcome::Yes, dec!(10)).unwrap();
        let held = LmsrState {
            liquidity_b: Decimal::from(100),
            q_yes: buy.new_q_yes,
            q_no: buy.new_q_no,
        };
        let sell = sell_quote(&cfg, &held, Outcome::Yes, dec!(10)).unwrap();

        assert!(sell.cost_minor < 0);
        assert!(sell.cost < Decimal::ZERO);
        // Unwinding the same shares recovers the buy cost up to rounding.
        assert!((buy.cost_minor + sell.cost_minor).abs() <= 1);
        assert!(sell.price_impact < Decimal::ZERO);
    }

    #[test]
    fn marginal_cost_is_convex() {
        // Buying 2D in one go costs at least twice the first D.
        let cfg = config();
        let state = fresh(100);
        let once = buy_quote(&cfg, &state, Outcome::Yes, dec!(25)).unwrap();
        let twice = buy_quote(&cfg, &state, Outcome::Yes, dec!(50)).unwrap();
        let double_first = once.cost * Decimal::from(2);
        assert!(
            twice.cost >= double_first - dec!(0.000001),
            "twice = {}, 2x once = {}",
            twice.cost,
            double_first
        );
    }

    #[test]
    fn price_is_monotonic_in_quantity() {
        let cfg = config();
        let mut state = fresh(500);
        let mut prev = p_yes(&state);
        for _ in 0..20 {
            let quote = buy_quote(&cfg, &state, Outcome::Yes, dec!(50)).unwrap();
            state.q_yes = quote.new_q_yes;
            state.q_no = quote.new_q_no;
            let p = p_yes(&state);
            assert!(p > prev, "p = {p}, prev = {prev}");
            prev = p;
        }
    }

    #[test]
    fn seed_hits_target_probability() {
        let cfg = config();
        let state = seed(&cfg, Decimal::from(100), Some(dec!(0.7))).unwrap();
        assert_eq!(state.q_no, Decimal::ZERO);
        assert!((p_yes(&state) - 0.7).abs() < PRICE_TOLERANCE);

        let even = seed(&cfg, Decimal::from(100), None).unwrap();
        assert_eq!(even.q_yes, Decimal::ZERO);
        assert_eq!(even.q_no, Decimal::ZERO);
    }

    #[test]
    fn seed_rejects_degenerate_probabilities() {
        let cfg = config();
        assert!(seed(&cfg, Decimal::from(100), Some(Decimal::ZERO)).is_err());
        assert!(seed(&cfg, Decimal::from(100), Some(Decimal::ONE)).is_err());
        assert!(seed(&cfg, Decimal::from(100), Some(dec!(1.3))).is_err());
    }

    #[test]
    fn liquidity_and_share_bands_are_enforced() {
        let cfg = config();
        assert!(matches!(
            buy_quote(&cfg, &fresh(0), Outcome::Yes, dec!(10)),
            Err(CoreError::InvalidLiquidity(_))
        ));
        assert!(matches!(
            buy_quote(&cfg, &fresh(20_000), Outcome::Yes, dec!(10)),
            Err(CoreError::InvalidLiquidity(_))
        ));
        assert!(matches!(
            buy_quote(&cfg, &fresh(100), Outcome::Yes, dec!(0.001)),
            Err(CoreError::InvalidShares(_))
        ));
        assert!(matches!(
            buy_quote(&cfg, &fresh(100), Outcome::Yes, dec!(2000000)),
            Err(CoreError::InvalidShares(_))
        ));
    }

    #[test]
    fn depth_search_converges_to_target() {
        let cfg = config();
        let state = fresh(100);
        let delta = depth_to_price(&cfg, &state, Outcome::Yes, dec!(0.6)).unwrap();

        let quote = buy_quote(&cfg, &state, Outcome::Yes, delta).unwrap();
        let end = decimal::to_f64(quote.end_price).unwrap();
        assert!((end - 0.6).abs() < 2.0 * PRICE_TOLERANCE, "end = {end}");
    }

    #[test]
    fn depth_search_rejects_unreachable_targets() {
        let cfg = config();
        let state = fresh(100);
        assert!(depth_to_price(&cfg, &state, Outcome::Yes, dec!(0.5)).is_err());
        assert!(depth_to_price(&cfg, &state, Outcome::Yes, dec!(0.3)).is_err());
        assert!(depth_to_price(&cfg, &state, Outcome::Yes, Decimal::ONE).is_err());
    }

    #[test]
    fn extreme_quantities_stay_finite_and_bounded() {
        let state = LmsrState {
            liquidity_b: Decimal::from(1),
            q_yes: Decimal::from(1_000_000),
            q_no: Decimal::ZERO,
        };
        let (yes, no) = prices(&state).unwrap();
        assert!(yes <= Decimal::ONE && yes >= Decimal::ZERO);
        assert!(no <= Decimal::ONE && no >= Decimal::ZERO);
        assert!(cost(&state).is_ok());
    }

    proptest! {
        #[test]
        fn prices_sum_to_one_and_stay_bounded(
            b in 1i64..10_000,
            q_yes in -5_000i64..5_000,
            q_no in -5_000i64..5_000,
        ) {
            let state = LmsrState {
                liquidity_b: Decimal::from(b),
                q_yes: Decimal::from(q_yes),
                q_no: Decimal::from(q_no),
            };
            let (yes, no) = prices(&state).unwrap();
            prop_assert!(yes >= Decimal::ZERO && yes <= Decimal::ONE);
            prop_assert!(no >= Decimal::ZERO && no <= Decimal::ONE);
            let sum = decimal::to_f64(yes + no).unwrap();
            prop_assert!((sum - 1.0).abs() < PRICE_TOLERANCE);
        }

        #[test]
        fn buy_then_sell_round_trip_is_cash_neutral(
            b in 50i64..10_000,
            shares in 1i64..1_000,
        ) {
            let cfg = Config::default();
            let shares = Decimal::from(shares);
            let buy = buy_quote(&cfg, &fresh(b), Outcome::Yes, shares).unwrap();
            let held = LmsrState {
                liquidity_b: Decimal::from(b),
                q_yes: buy.new_q_yes,
                q_no: buy.new_q_no,
            };
            let sell = sell_quote(&cfg, &held, Outcome::Yes, shares).unwrap();

            // One minor of drift allowed for the debit/credit rounding split.
            prop_assert!((buy.cost_minor + sell.cost_minor).abs() <= 1);
            // Market returns to its starting quantities.
            prop_assert!((decimal::to_f64(sell.new_q_yes).unwrap()).abs() < 1e-9);
            prop_assert!((decimal::to_f64(sell.new_q_no).unwrap()).abs() < 1e-9);
        }

        #[test]
        fn buying_yes_never_lowers_the_yes_price(
            b in 10i64..10_000,
            first in 1i64..500,
            second in 1i64..500,
        ) {
            let cfg = Config::default();
            let state = fresh(b);
            let q1 = buy_quote(&cfg, &state, Outcome::Yes, Decimal::from(first)).unwrap();
            let mid = LmsrState {
                liquidity_b: Decimal::from(b),
                q_yes: q1.new_q_yes,
                q_no: q1.new_q_no,
            };
            let q2 = buy_quote(&cfg, &mid, Outcome::Yes, Decimal::from(second)).unwrap();
            prop_assert!(q2.start_price >= q1.start_price);
            prop_assert!(q2.end_price > q2.start_price);
        }
    }
}
