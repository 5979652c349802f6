//! Quote -> execute trading pipeline.
//!
//! `generate_quote` prices against the latest committed LMSR snapshot and
//! returns a signed envelope; nothing is persisted. `execute_trade` re-reads
//! the state under an exclusive row lock, re-prices the envelope, and only
//! fills when the recomputed cost is within the slippage tolerance — the
//! core protection against racing a stale price. Fills are all-or-nothing.

use crate::db::{with_serializable_tx, PgTxn};
use crate::decimal::{self, fee_minor};
use crate::error::{CoreError, CoreResult};
use crate::gates::{decide_with_timeout, monitor_with_timeout, AmlAssessment, AmlVerdict, GateDecision, TradeEvent};
use crate::ledger::{self, AccountKind, EntryInput, EntryKind};
use crate::lmsr::{self, Outcome, QuoteComputation, TradeSide};
use crate::market::{self, Market, MarketStatus, DEFAULT_CURRENCY};
use crate::quote::QuoteEnvelope;
use crate::Exchange;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub market_id: i64,
    pub outcome: Outcome,
    pub side: TradeSide,
    pub shares: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    pub trade_id: i64,
    pub txn_id: Uuid,
    pub user_id: i64,
    pub market_id: i64,
    pub outcome: Outcome,
    pub side: TradeSide,
    pub shares: Decimal,
    pub fill_avg_price: Decimal,
    /// Positive for buys, negative (proceeds) for sells.
    pub cost_minor: i64,
    pub fee_minor: i64,
    pub p_yes_after: Decimal,
    pub p_no_after: Decimal,
    pub flagged_for_review: bool,
    #[serde(skip)]
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub user_id: i64,
    pub market_id: i64,
    pub yes_shares: Decimal,
    pub no_shares: Decimal,
    pub avg_price_yes: Decimal,
    pub avg_price_no: Decimal,
    pub total_invested_minor: i64,
    pub realized_pnl_minor: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn shares_of(&self, outcome: Outcome) -> Decimal {
        match outcome {
            Outcome::Yes => self.yes_shares,
            Outcome::No => self.no_shares,
        }
    }

    pub fn avg_price_of(&self, outcome: Outcome) -> Decimal {
        match outcome {
            Outcome::Yes => self.avg_price_yes,
            Outcome::No => self.avg_price_no,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub txn_id: Uuid,
    pub user_id: i64,
    pub market_id: i64,
    pub outcome: Outcome,
    pub side: TradeSide,
    pub shares: Decimal,
    pub fill_avg_price: Decimal,
    pub cost_minor: i64,
    pub fee_minor: i64,
    pub created_at: DateTime<Utc>,
}

fn ensure_tradeable(market: &Market, now: DateTime<Utc>) -> CoreResult<()> {
    if market.blocked_at.is_some() {
        return Err(CoreError::MarketBlocked(
            market
                .halt_reason
                .clone()
                .unwrap_or_else(|| "accounting halt".to_string()),
        ));
    }
    match market.status {
        MarketStatus::Open => {
            if now < market.open_at || now >= market.close_at {
                return Err(CoreError::MarketNotOpen);
            }
            Ok(())
        }
        MarketStatus::Closed | MarketStatus::Resolved => Err(CoreError::MarketClosed),
        MarketStatus::Draft => Err(CoreError::MarketNotOpen),
    }
}

/// Price a prospective trade and wrap it in a signed, short-lived envelope.
/// Reads the latest committed snapshot without locking; staleness is caught
/// at execute time by the drift check.
pub async fn generate_quote(ex: &Exchange, request: QuoteRequest) -> CoreResult<QuoteEnvelope> {
    let now = Utc::now();
    let market = market::get(ex, request.market_id).await?;
    ensure_tradeable(&market, now)?;

    let state = market::fetch_lmsr_state(ex, request.market_id).await?;
    let computation = match request.side {
        TradeSide::Buy => lmsr::buy_quote(&ex.config, &state, request.outcome, request.shares)?,
        TradeSide::Sell => lmsr::sell_quote(&ex.config, &state, request.outcome, request.shares)?,
    };

    let tolerance = ex.config.slippage_tolerance_minor(computation.cost_minor);
    Ok(ex.signer.issue(
        request.market_id,
        &computation,
        ex.config.quote.ttl_seconds,
        tolerance,
        now,
    ))
}

/// Execute a quoted trade under an idempotency key.
///
/// Inside one SERIALIZABLE transaction: replay check, market state gate,
/// envelope verification, re-pricing against the locked LMSR row, compliance
/// gates, funds/position checks, ledger posting, position and state updates,
/// trade insert, idempotency stamp.
pub async fn execute_trade(
    ex: &Exchange,
    user_id: i64,
    envelope: &QuoteEnvelope,
    idempotency_key: &str,
) -> CoreResult<TradeResult> {
    let attempt = with_serializable_tx!(&ex.pool, &ex.config, tx, {
        if let Some(stored) =
            ledger::idempotency_lookup(&mut tx, ledger::SCOPE_TRADE, idempotency_key).await?
        {
            let mut replay: TradeResult = serde_json::from_value(stored)?;
            replay.replayed = true;
            return Ok(replay);
        }

        let market = market::lock_market_in(&mut tx, envelope.market_id).await?;
        let now = Utc::now();
        ensure_tradeable(&market, now)?;

        ex.signer.verify(envelope, now)?;

        // Re-price against the current state; the envelope's price is only a
        // promise about the state it was quoted from.
        let state = market::lock_lmsr_state_in(&mut tx, envelope.market_id).await?;
        let fresh = match envelope.side {
            TradeSide::Buy => {
                lmsr::buy_quote(&ex.config, &state, envelope.outcome, envelope.shares)?
            }
            TradeSide::Sell => {
                lmsr::sell_quote(&ex.config, &state, envelope.outcome, envelope.shares)?
            }
        };
        let tolerance = ex.config.slippage_tolerance_minor(envelope.cost_minor);
        if (fresh.cost_minor - envelope.cost_minor).abs() > tolerance {
            return Err(CoreError::PriceMoved {
                quoted_minor: envelope.cost_minor,
                current_minor: fresh.cost_minor,
            });
        }

        let gross_minor = fresh.cost_minor.abs();
        if gross_minor < market.min_trade_minor {
            return Err(CoreError::InvalidShares(format!(
                "trade of {gross_minor} minor is below the market minimum {}",
                market.min_trade_minor
            )));
        }
        if let Some(max) = market.max_trade_minor {
            if gross_minor > max {
                return Err(CoreError::InvalidShares(format!(
                    "trade of {gross_minor} minor exceeds the market maximum {max}"
                )));
            }
        }

        // Compliance gates; sells are screened the same as buys.
        let aml = monitor_with_timeout(ex.gates.aml.monitor_trade(
            user_id,
            market.id,
            fresh.cost_minor,
        ))
        .await;
        if aml.verdict == AmlVerdict::Block {
            tracing::warn!(user_id, market_id = market.id, "trade blocked by aml monitor");
            return Err(CoreError::Forbidden(aml.reasons.join("; ")));
        }
        if let GateDecision::Deny { reason } =
            decide_with_timeout(ex.gates.rg.validate_action(user_id, "trade")).await
        {
            return Err(CoreError::Forbidden(reason));
        }
        let flagged_for_review = aml.verdict == AmlVerdict::Review;
        if flagged_for_review {
            record_aml_event_in(&mut tx, user_id, "trade", &aml, market.id).await?;
        }

        let fee = fee_minor(gross_minor, ex.config.fees.fee_bps);
        let user_cash =
            ledger::get_or_create_account_in(&mut tx, AccountKind::UserCash, Some(user_id), DEFAULT_CURRENCY)
                .await?;
        let custody =
            ledger::get_or_create_account_in(&mut tx, AccountKind::CustodyCash, None, DEFAULT_CURRENCY)
                .await?;
        let fee_revenue =
            ledger::get_or_create_account_in(&mut tx, AccountKind::FeeRevenue, None, DEFAULT_CURRENCY)
                .await?;

        let position = lock_position_in(&mut tx, user_id, envelope.market_id).await?;
        match envelope.side {
            TradeSide::Buy => {
                let locked = ledger::lock_account_in(&mut tx, user_cash.id).await?;
                let needed = gross_minor + fee;
                if locked.available_minor < needed {
                    return Err(CoreError::InsufficientFunds {
                        needed_minor: needed,
                        available_minor: locked.available_minor,
                    });
                }
            }
            TradeSide::Sell => {
                let held = position
                    .as_ref()
                    .map(|p| p.shares_of(envelope.outcome))
                    .unwrap_or(Decimal::ZERO);
                if held < envelope.shares {
                    return Err(CoreError::InsufficientShares {
                        outcome: envelope.outcome.as_str(),
                        needed: envelope.shares.to_string(),
                        held: held.to_string(),
                    });
                }
            }
        }

        let txn_id = Uuid::new_v4();
        let metadata = serde_json::json!({
            "market_id": market.id,
            "nonce": envelope.nonce.clone(),
            "flagged_for_review": flagged_for_review,
        });
        let mut entries = Vec::with_capacity(3);
        match envelope.side {
            TradeSide::Buy => {
                entries.push(
                    EntryInput::new(
                        user_cash.id,
                        custody.id,
                        -(gross_minor + fee),
                        EntryKind::Trade,
                        format!("buy {} {}", envelope.shares, envelope.outcome.as_str()),
                    )
                    .for_user(user_id)
                    .with_metadata(metadata.clone()),
                );
                entries.push(
                    EntryInput::new(
                        custody.id,
                        user_cash.id,
                        gross_minor,
                        EntryKind::Trade,
                        "trade cost into custody",
                    )
                    .with_metadata(metadata.clone()),
                );
                if fee > 0 {
                    entries.push(
                        EntryInput::new(
                            fee_revenue.id,
                            user_cash.id,
                            fee,
                            EntryKind::Fee,
                            "trading fee",
                        )
                        .for_user(user_id)
                        .with_metadata(metadata.clone()),
                    );
                }
            }
            TradeSide::Sell => {
                let net = gross_minor - fee;
                if net > 0 {
                    entries.push(
                        EntryInput::new(
                            user_cash.id,
                            custody.id,
                            net,
                            EntryKind::Trade,
                            format!("sell {} {}", envelope.shares, envelope.outcome.as_str()),
                        )
                        .for_user(user_id)
                        .with_metadata(metadata.clone()),
                    );
                }
                entries.push(
                    EntryInput::new(
                        custody.id,
                        user_cash.id,
                        -gross_minor,
                        EntryKind::Trade,
                        "trade proceeds out of custody",
                    )
                    .with_metadata(metadata.clone()),
                );
                if fee > 0 {
                    entries.push(
                        EntryInput::new(
                            fee_revenue.id,
                            user_cash.id,
                            fee,
                            EntryKind::Fee,
                            "trading fee",
                        )
                        .for_user(user_id)
                        .with_metadata(metadata.clone()),
                    );
                }
            }
        }
        ledger::post_entries_in(&mut tx, txn_id, &entries).await?;

        apply_fill_to_position(
            &mut tx,
            user_id,
            envelope.market_id,
            position,
            &fresh,
            gross_minor,
            fee,
        )
        .await?;

        let new_state = lmsr::LmsrState {
            liquidity_b: state.liquidity_b,
            q_yes: fresh.new_q_yes,
            q_no: fresh.new_q_no,
        };
        market::save_lmsr_state_in(&mut tx, envelope.market_id, &new_state).await?;

        let trade_row = sqlx::query(
            "INSERT INTO trades
                 (txn_id, user_id, market_id, outcome, side, shares, fill_avg_price,
                  cost_minor, fee_minor, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING id",
        )
        .bind(txn_id)
        .bind(user_id)
        .bind(envelope.market_id)
        .bind(envelope.outcome.as_str())
        .bind(envelope.side.as_str())
        .bind(envelope.shares)
        .bind(fresh.avg_price)
        .bind(fresh.cost_minor)
        .bind(fee)
        .bind(&metadata)
        .fetch_one(tx.as_mut())
        .await?;

        let (p_yes_after, p_no_after) = lmsr::prices(&new_state)?;
        let result = TradeResult {
            trade_id: trade_row.get("id"),
            txn_id,
            user_id,
            market_id: envelope.market_id,
            outcome: envelope.outcome,
            side: envelope.side,
            shares: envelope.shares,
            fill_avg_price: decimal::to_fixed(fresh.avg_price, 6),
            cost_minor: fresh.cost_minor,
            fee_minor: fee,
            p_yes_after: decimal::to_fixed(p_yes_after, 6),
            p_no_after: decimal::to_fixed(p_no_after, 6),
            flagged_for_review,
            replayed: false,
        };
        ledger::idempotency_stamp(
            &mut tx,
            ledger::SCOPE_TRADE,
            idempotency_key,
            &serde_json::to_value(&result)?,
            ex.config.txn.idempotency_ttl_hours,
        )
        .await?;
        Ok(result)
    });

    let result = match attempt {
        Ok(result) => result,
        Err(error) => {
            if error.is_fatal() {
                market::escalate_fatal(ex, Some(envelope.market_id), &error).await;
            }
            return Err(error);
        }
    };

    if !result.replayed {
        ex.observer.on_trade(&TradeEvent {
            trade_id: result.trade_id,
            txn_id: result.txn_id,
            user_id,
            market_id: result.market_id,
            outcome: result.outcome.as_str(),
            side: result.side.as_str(),
            shares: result.shares,
            cost_minor: result.cost_minor,
            fee_minor: result.fee_minor,
        });
        tracing::info!(
            trade_id = result.trade_id,
            market_id = result.market_id,
            side = result.side.as_str(),
            cost_minor = result.cost_minor,
            "trade executed"
        );
    }
    Ok(result)
}

async fn record_aml_event_in(
    tx: &mut PgTxn<'_>,
    user_id: i64,
    action: &str,
    assessment: &AmlAssessment,
    market_id: i64,
) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO aml_events (user_id, action, verdict, risk_score, reasons, context)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(user_id)
    .bind(action)
    .bind(format!("{:?}", assessment.verdict).to_uppercase())
    .bind(assessment.risk_score)
    .bind(serde_json::to_value(&assessment.reasons)?)
    .bind(serde_json::json!({ "market_id": market_id }))
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

fn position_from_row(row: &sqlx::postgres::PgRow) -> Position {
    Position {
        id: row.get("id"),
        user_id: row.get("user_id"),
        market_id: row.get("market_id"),
        yes_shares: row.get("yes_shares"),
        no_shares: row.get("no_shares"),
        avg_price_yes: row.get("avg_price_yes"),
        avg_price_no: row.get("avg_price_no"),
        total_invested_minor: row.get("total_invested_minor"),
        realized_pnl_minor: row.get("realized_pnl_minor"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub(crate) async fn lock_position_in(
    tx: &mut PgTxn<'_>,
    user_id: i64,
    market_id: i64,
) -> CoreResult<Option<Position>> {
    let row = sqlx::query(
        "SELECT * FROM positions WHERE user_id = $1 AND market_id = $2 FOR UPDATE",
    )
    .bind(user_id)
    .bind(market_id)
    .fetch_optional(tx.as_mut())
    .await?;
    Ok(row.map(|r| position_from_row(&r)))
}

/// Fold a fill into the (user, market) position. Buys move the weighted
/// average price and cost basis; sells release basis proportionally and
/// realize the difference.
async fn apply_fill_to_position(
    tx: &mut PgTxn<'_>,
    user_id: i64,
    market_id: i64,
    position: Option<Position>,
    fill: &QuoteComputation,
    gross_minor: i64,
    fee: i64,
) -> CoreResult<()> {
    match fill.side {
        TradeSide::Buy => {
            let invested_delta = gross_minor + fee;
            let (old_shares, old_avg) = position
                .as_ref()
                .map(|p| (p.shares_of(fill.outcome), p.avg_price_of(fill.outcome)))
                .unwrap_or((Decimal::ZERO, Decimal::ZERO));
            let new_shares = old_shares + fill.shares;
            let new_avg = if new_shares.is_zero() {
                Decimal::ZERO
            } else {
                (old_avg * old_shares + fill.avg_price * fill.shares) / new_shares
            };

            let (yes_delta, no_delta) = match fill.outcome {
                Outcome::Yes => (fill.shares, Decimal::ZERO),
                Outcome::No => (Decimal::ZERO, fill.shares),
            };
            let (avg_yes_col, avg_no_col) = match (position.as_ref(), fill.outcome) {
                (Some(p), Outcome::Yes) => (new_avg, p.avg_price_no),
                (Some(p), Outcome::No) => (p.avg_price_yes, new_avg),
                (None, Outcome::Yes) => (new_avg, Decimal::ZERO),
                (None, Outcome::No) => (Decimal::ZERO, new_avg),
            };

            sqlx::query(
                "INSERT INTO positions
                     (user_id, market_id, yes_shares, no_shares, avg_price_yes,
                      avg_price_no, total_invested_minor)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (market_id, user_id)
                 DO UPDATE SET
                     yes_shares = positions.yes_shares + $3,
                     no_shares = positions.no_shares + $4,
                     avg_price_yes = $5,
                     avg_price_no = $6,
                     total_invested_minor = positions.total_invested_minor + $7,
                     updated_at = NOW()",
            )
            .bind(user_id)
            .bind(market_id)
            .bind(yes_delta)
            .bind(no_delta)
            .bind(avg_yes_col)
            .bind(avg_no_col)
            .bind(invested_delta)
            .execute(tx.as_mut())
            .await?;
        }
        TradeSide::Sell => {
            // Sufficiency was checked before posting; a sell without a
            // position cannot reach this point.
            let position = position.ok_or(CoreError::PositionNotFound)?;
            let avg = position.avg_price_of(fill.outcome);
            let released = decimal::debit_minor(avg * fill.shares)?
                .min(position.total_invested_minor)
                .max(0);
            let net_received = gross_minor - fee;
            let realized_delta = net_received - released;

            let (yes_delta, no_delta) = match fill.outcome {
                Outcome::Yes => (fill.shares, Decimal::ZERO),
                Outcome::No => (Decimal::ZERO, fill.shares),
            };
            sqlx::query(
                "UPDATE positions SET
                     yes_shares = yes_shares - $1,
                     no_shares = no_shares - $2,
                     total_invested_minor = total_invested_minor - $3,
                     realized_pnl_minor = realized_pnl_minor + $4,
                     updated_at = NOW()
                 WHERE id = $5",
            )
            .bind(yes_delta)
            .bind(no_delta)
            .bind(released)
            .bind(realized_delta)
            .bind(position.id)
            .execute(tx.as_mut())
            .await?;
        }
    }
    Ok(())
}

// --- reads ---

fn trade_from_row(row: &sqlx::postgres::PgRow) -> CoreResult<Trade> {
    Ok(Trade {
        id: row.get("id"),
        txn_id: row.get("txn_id"),
        user_id: row.get("user_id"),
        market_id: row.get("market_id"),
        outcome: Outcome::parse(row.get("outcome"))?,
        side: TradeSide::parse(row.get("side"))?,
        shares: row.get("shares"),
        fill_avg_price: row.get("fill_avg_price"),
        cost_minor: row.get("cost_minor"),
        fee_minor: row.get("fee_minor"),
        created_at: row.get("created_at"),
    })
}

pub async fn get_user_trades(
    ex: &Exchange,
    user_id: i64,
    market_id: Option<i64>,
    cursor: Option<i64>,
    limit: i64,
) -> CoreResult<Vec<Trade>> {
    let limit = if limit <= 0 { 50 } else { limit.min(500) };
    let rows = sqlx::query(
        "SELECT * FROM trades
         WHERE user_id = $1
           AND ($2::BIGINT IS NULL OR market_id = $2)
           AND ($3::BIGINT IS NULL OR id < $3)
         ORDER BY id DESC
         LIMIT $4",
    )
    .bind(user_id)
    .bind(market_id)
    .bind(cursor)
    .bind(limit)
    .fetch_all(&ex.pool)
    .await?;
    rows.iter().map(trade_from_row).collect()
}

pub async fn get_user_positions(ex: &Exchange, user_id: i64) -> CoreResult<Vec<Position>> {
    let rows = sqlx::query(
        "SELECT * FROM positions WHERE user_id = $1 ORDER BY market_id",
    )
    .bind(user_id)
    .fetch_all(&ex.pool)
    .await?;
    Ok(rows.iter().map(position_from_row).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn market_at(status: MarketStatus, now: DateTime<Utc>) -> Market {
        Market {
            id: 1,
            slug: "test".to_string(),
            title: "Test market".to_string(),
            category: "general".to_string(),
            status,
            min_trade_minor: 100,
            max_trade_minor: None,
            open_at: now - Duration::hours(1),
            close_at: now + Duration::hours(1),
            resolve_at: None,
            resolution: None,
            blocked_at: None,
            halt_reason: None,
            creator_id: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn draft_and_closed_markets_reject_trading() {
        let now = Utc::now();
        assert!(matches!(
            ensure_tradeable(&market_at(MarketStatus::Draft, now), now),
            Err(CoreError::MarketNotOpen)
        ));
        assert!(matches!(
            ensure_tradeable(&market_at(MarketStatus::Closed, now), now),
            Err(CoreError::MarketClosed)
        ));
        assert!(matches!(
            ensure_tradeable(&market_at(MarketStatus::Resolved, now), now),
            Err(CoreError::MarketClosed)
        ));
        assert!(ensure_tradeable(&market_at(MarketStatus::Open, now), now).is_ok());
    }

    #[test]
    fn blocked_markets_reject_trading_regardless_of_status() {
        let now = Utc::now();
        let mut market = market_at(MarketStatus::Open, now);
        market.blocked_at = Some(now);
        market.halt_reason = Some("custody shortfall".to_string());
        match ensure_tradeable(&market, now) {
            Err(CoreError::MarketBlocked(reason)) => assert_eq!(reason, "custody shortfall"),
            other => panic!("expected MarketBlocked, got {other:?}"),
        }
    }

    #[test]
    fn open_market_outside_window_rejects_trading() {
        let now = Utc::now();
        let mut market = market_at(MarketStatus::Open, now);
        market.open_at = now + Duration::minutes(5);
        assert!(matches!(
            ensure_tradeable(&market, now),
            Err(CoreError::MarketNotOpen)
        ));

        let mut market = market_at(MarketStatus::Open, now);
        market.close_at = now;
        assert!(matches!(
            ensure_tradeable(&market, now),
            Err(CoreError::MarketNotOpen)
        ));
    }

    #[test]
    fn trade_result_replay_flag_is_not_persisted() {
        let result = TradeResult {
            trade_id: 9,
            txn_id: Uuid::new_v4(),
            user_id: 1,
            market_id: 2,
            outcome: Outcome::Yes,
            side: TradeSide::Buy,
            shares: Decimal::from(10),
            fill_avg_price: Decimal::new(512495, 6),
            cost_minor: 512,
            fee_minor: 5,
            p_yes_after: Decimal::new(524979, 6),
            p_no_after: Decimal::new(475021, 6),
            flagged_for_review: false,
            replayed: true,
        };
        let blob = serde_json::to_value(&result).unwrap();
        assert!(blob.get("replayed").is_none());
        let back: TradeResult = serde_json::from_value(blob).unwrap();
        assert!(!back.replayed);
        assert_eq!(back.cost_minor, 512);
    }
}
