//! Configuration for the exchange core.
//! Supports environment variables and default values; the loaded snapshot is
//! frozen and injected at construction, never mutated afterwards.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub fees: FeeConfig,
    pub quote: QuoteConfig,
    pub lmsr: LmsrConfig,
    pub txn: TxnConfig,
}

/// Trading and settlement fee rates, in basis points on the cash leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Flat trading fee applied to buy cost and sell proceeds (default: 100 = 1%)
    pub fee_bps: u32,

    /// Settlement fee on gross payout (default: 50 = 0.5%)
    pub settlement_fee_bps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteConfig {
    /// Quote envelope lifetime (default: 15 seconds)
    pub ttl_seconds: i64,

    /// Allowed drift between quoted and recomputed cost before an execute
    /// fails PriceMoved, in basis points with a 2-minor floor (default: 100 = 1%)
    pub slippage_tolerance_bps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmsrConfig {
    /// Liquidity parameter band (default: [1, 10000])
    pub b_min: Decimal,
    pub b_max: Decimal,

    /// Per-trade share quantity band (default: [0.01, 1000000])
    pub shares_min: Decimal,
    pub shares_max: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnConfig {
    /// Retries after a serialization failure (default: 3)
    pub retries: u32,

    /// Per-transaction statement timeout (default: 10000 ms)
    pub timeout_ms: u64,

    /// Idempotency record lifetime before cleanup may reap it (default: 24h)
    pub idempotency_ttl_hours: i64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            fee_bps: 100,
            settlement_fee_bps: 50,
        }
    }
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 15,
            slippage_tolerance_bps: 100,
        }
    }
}

impl Default for LmsrConfig {
    fn default() -> Self {
        Self {
            b_min: Decimal::ONE,
            b_max: Decimal::from(10_000),
            shares_min: Decimal::new(1, 2), // 0.01
            shares_max: Decimal::from(1_000_000),
        }
    }
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            timeout_ms: 10_000,
            idempotency_ttl_hours: 24,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fees: FeeConfig::default(),
            quote: QuoteConfig::default(),
            lmsr: LmsrConfig::default(),
            txn: TxnConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables with fallback to defaults.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let mut config = Config::default();

        set_from_env("EXCHANGE_FEE_BPS", &mut config.fees.fee_bps);
        set_from_env(
            "EXCHANGE_SETTLEMENT_FEE_BPS",
            &mut config.fees.settlement_fee_bps,
        );
        set_from_env("EXCHANGE_QUOTE_TTL_SECONDS", &mut config.quote.ttl_seconds);
        set_from_env(
            "EXCHANGE_QUOTE_SLIPPAGE_TOLERANCE_BPS",
            &mut config.quote.slippage_tolerance_bps,
        );
        set_from_env("EXCHANGE_LMSR_B_MIN", &mut config.lmsr.b_min);
        set_from_env("EXCHANGE_LMSR_B_MAX", &mut config.lmsr.b_max);
        set_from_env("EXCHANGE_TRADE_SHARES_MIN", &mut config.lmsr.shares_min);
        set_from_env("EXCHANGE_TRADE_SHARES_MAX", &mut config.lmsr.shares_max);
        set_from_env("EXCHANGE_TXN_RETRIES", &mut config.txn.retries);
        set_from_env("EXCHANGE_TXN_TIMEOUT_MS", &mut config.txn.timeout_ms);
        set_from_env(
            "EXCHANGE_IDEMPOTENCY_TTL_HOURS",
            &mut config.txn.idempotency_ttl_hours,
        );

        config.validate();
        config
    }

    /// Clamp out-of-band values back to defaults, warning as we go.
    fn validate(&mut self) {
        if self.fees.fee_bps > 10_000 {
            tracing::warn!(fee_bps = self.fees.fee_bps, "invalid fee_bps, using default");
            self.fees.fee_bps = FeeConfig::default().fee_bps;
        }
        if self.fees.settlement_fee_bps > 10_000 {
            tracing::warn!(
                settlement_fee_bps = self.fees.settlement_fee_bps,
                "invalid settlement_fee_bps, using default"
            );
            self.fees.settlement_fee_bps = FeeConfig::default().settlement_fee_bps;
        }
        if self.quote.ttl_seconds <= 0 {
            tracing::warn!(
                ttl_seconds = self.quote.ttl_seconds,
                "invalid quote ttl, using default"
            );
            self.quote.ttl_seconds = QuoteConfig::default().ttl_seconds;
        }
        if self.lmsr.b_min <= Decimal::ZERO || self.lmsr.b_min >= self.lmsr.b_max {
            tracing::warn!("invalid LMSR liquidity band, using defaults");
            self.lmsr.b_min = LmsrConfig::default().b_min;
            self.lmsr.b_max = LmsrConfig::default().b_max;
        }
        if self.lmsr.shares_min <= Decimal::ZERO || self.lmsr.shares_min >= self.lmsr.shares_max {
            tracing::warn!("invalid trade share band, using defaults");
            self.lmsr.shares_min = LmsrConfig::default().shares_min;
            self.lmsr.shares_max = LmsrConfig::default().shares_max;
        }
        if self.txn.retries == 0 || self.txn.retries > 10 {
            tracing::warn!(retries = self.txn.retries, "invalid txn retries, using default");
            self.txn.retries = TxnConfig::default().retries;
        }
        if self.txn.timeout_ms == 0 {
            tracing::warn!("invalid txn timeout, using default");
            self.txn.timeout_ms = TxnConfig::default().timeout_ms;
        }
        if self.txn.idempotency_ttl_hours <= 0 {
            tracing::warn!("invalid idempotency ttl, using default");
            self.txn.idempotency_ttl_hours = TxnConfig::default().idempotency_ttl_hours;
        }
    }

    /// Slippage tolerance in minor units for a quoted cost: the configured
    /// rate with a floor of 2 minor.
    pub fn slippage_tolerance_minor(&self, cost_minor: i64) -> i64 {
        let by_rate = cost_minor.abs() * self.quote.slippage_tolerance_bps as i64 / 10_000;
        by_rate.max(2)
    }
}

fn set_from_env<T: FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = env::var(name) {
        match raw.parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(var = name, "unparseable value, keeping default"),
        }
    }
}
