//! Terminal payout of winning positions after resolution.
//!
//! Each position settles in its own SERIALIZABLE transaction keyed by
//! `settlement:{market_id}:{user_id}`, so the whole pass can be rerun
//! safely; settled positions replay their stored outcome and are skipped.
//! A payout that would drive custody below zero aborts the pass with
//! `SolvencyViolation` — that means an earlier posting was wrong.

use crate::db::with_serializable_tx;
use crate::decimal::fee_minor;
use crate::error::{CoreError, CoreResult};
use crate::gates::SettlementEvent;
use crate::ledger::{self, AccountKind, EntryInput, EntryKind};
use crate::market::{self, MarketStatus, Resolution, DEFAULT_CURRENCY};
use crate::trading;
use crate::Exchange;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

/// Per-position settlement outcome; the stored idempotency response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSettlement {
    pub market_id: i64,
    pub user_id: i64,
    pub winning_shares: Decimal,
    pub gross_minor: i64,
    pub fee_minor: i64,
    pub net_minor: i64,
    pub refund: bool,
    #[serde(skip)]
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementReport {
    pub market_id: i64,
    pub resolution: Resolution,
    pub settled: u64,
    pub skipped: u64,
    pub gross_minor: i64,
    pub fee_minor: i64,
    pub net_minor: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementSummary {
    pub market_id: i64,
    pub users_paid: i64,
    pub net_paid_minor: i64,
    pub fees_collected_minor: i64,
}

/// Settle every position of a RESOLVED market. Safe to rerun.
pub async fn settle_market(ex: &Exchange, market_id: i64) -> CoreResult<SettlementReport> {
    let market = market::get(ex, market_id).await?;
    if market.blocked_at.is_some() {
        return Err(CoreError::MarketBlocked(
            market
                .halt_reason
                .unwrap_or_else(|| "accounting halt".to_string()),
        ));
    }
    if market.status != MarketStatus::Resolved {
        return Err(CoreError::MarketNotResolved);
    }
    let resolution = market.resolution.ok_or(CoreError::MarketNotResolved)?;

    let user_ids: Vec<i64> = sqlx::query_scalar(
        "SELECT user_id FROM positions WHERE market_id = $1 ORDER BY user_id",
    )
    .bind(market_id)
    .fetch_all(&ex.pool)
    .await?;

    let mut report = SettlementReport {
        market_id,
        resolution,
        settled: 0,
        skipped: 0,
        gross_minor: 0,
        fee_minor: 0,
        net_minor: 0,
    };

    for user_id in user_ids {
        let outcome = match settle_position(ex, market_id, user_id, resolution).await {
            Ok(outcome) => outcome,
            Err(error) => {
                if error.is_fatal() {
                    market::escalate_fatal(ex, Some(market_id), &error).await;
                }
                return Err(error);
            }
        };
        if outcome.replayed {
            report.skipped += 1;
            continue;
        }
        report.settled += 1;
        report.gross_minor += outcome.gross_minor;
        report.fee_minor += outcome.fee_minor;
        report.net_minor += outcome.net_minor;

        ex.observer.on_settlement(&SettlementEvent {
            market_id,
            user_id,
            gross_minor: outcome.gross_minor,
            fee_minor: outcome.fee_minor,
            net_minor: outcome.net_minor,
        });
    }

    tracing::info!(
        market_id,
        resolution = resolution.as_str(),
        settled = report.settled,
        skipped = report.skipped,
        net_minor = report.net_minor,
        "market settlement pass complete"
    );
    Ok(report)
}

async fn settle_position(
    ex: &Exchange,
    market_id: i64,
    user_id: i64,
    resolution: Resolution,
) -> CoreResult<PositionSettlement> {
    let idempotency_key = format!("settlement:{market_id}:{user_id}");

    with_serializable_tx!(&ex.pool, &ex.config, tx, {
        if let Some(stored) =
            ledger::idempotency_lookup(&mut tx, ledger::SCOPE_SETTLEMENT, &idempotency_key).await?
        {
            let mut replay: PositionSettlement = serde_json::from_value(stored)?;
            replay.replayed = true;
            return Ok(replay);
        }

        let position = trading::lock_position_in(&mut tx, user_id, market_id)
            .await?
            .ok_or(CoreError::PositionNotFound)?;

        // Winning shares pay 100 minor each, floored. INVALID refunds the
        // remaining cost basis instead, fee-free.
        let (winning_shares, gross, fee, refund) = match resolution {
            Resolution::Yes => {
                let gross = floor_payout_minor(position.yes_shares)?;
                (
                    position.yes_shares,
                    gross,
                    fee_minor(gross, ex.config.fees.settlement_fee_bps),
                    false,
                )
            }
            Resolution::No => {
                let gross = floor_payout_minor(position.no_shares)?;
                (
                    position.no_shares,
                    gross,
                    fee_minor(gross, ex.config.fees.settlement_fee_bps),
                    false,
                )
            }
            Resolution::Invalid => {
                let refund_minor = position.total_invested_minor.max(0);
                (
                    position.yes_shares + position.no_shares,
                    refund_minor,
                    0,
                    true,
                )
            }
        };
        let net = gross - fee;

        if gross > 0 {
            let custody = ledger::get_or_create_account_in(
                &mut tx,
                AccountKind::CustodyCash,
                None,
                DEFAULT_CURRENCY,
            )
            .await?;
            let locked_custody = ledger::lock_account_in(&mut tx, custody.id).await?;
            if locked_custody.available_minor < gross {
                let shortfall = gross - locked_custody.available_minor;
                tracing::error!(
                    market_id,
                    user_id,
                    shortfall_minor = shortfall,
                    "settlement would overdraw custody; blocking market"
                );
                return Err(CoreError::SolvencyViolation {
                    shortfall_minor: shortfall,
                });
            }

            let user_cash = ledger::get_or_create_account_in(
                &mut tx,
                AccountKind::UserCash,
                Some(user_id),
                DEFAULT_CURRENCY,
            )
            .await?;

            let metadata = serde_json::json!({
                "market_id": market_id,
                "user_id": user_id,
                "resolution": resolution.as_str(),
                "reason": if refund { "invalid_refund" } else { "settlement" },
            });
            let description = if refund {
                "invalid market refund"
            } else {
                "winning share payout"
            };

            let mut entries = vec![
                EntryInput::new(user_cash.id, custody.id, net, EntryKind::Settlement, description)
                    .for_user(user_id)
                    .with_metadata(metadata.clone()),
                EntryInput::new(
                    custody.id,
                    user_cash.id,
                    -net,
                    EntryKind::Settlement,
                    "payout out of custody",
                )
                .with_metadata(metadata.clone()),
            ];
            if fee > 0 {
                let fee_revenue = ledger::get_or_create_account_in(
                    &mut tx,
                    AccountKind::FeeRevenue,
                    None,
                    DEFAULT_CURRENCY,
                )
                .await?;
                let fee_metadata = serde_json::json!({
                    "market_id": market_id,
                    "user_id": user_id,
                    "reason": "settlement_fee",
                });
                entries.push(
                    EntryInput::new(
                        fee_revenue.id,
                        custody.id,
                        fee,
                        EntryKind::Fee,
                        "settlement fee",
                    )
                    .for_user(user_id)
                    .with_metadata(fee_metadata.clone()),
                );
                entries.push(
                    EntryInput::new(
                        custody.id,
                        fee_revenue.id,
                        -fee,
                        EntryKind::Fee,
                        "settlement fee out of custody",
                    )
                    .with_metadata(fee_metadata),
                );
            }
            ledger::post_entries_in(&mut tx, Uuid::new_v4(), &entries).await?;
        }

        sqlx::query(
            "UPDATE positions SET
                 yes_shares = 0,
                 no_shares = 0,
                 total_invested_minor = 0,
                 realized_pnl_minor = realized_pnl_minor + $1,
                 updated_at = NOW()
             WHERE id = $2",
        )
        .bind(net)
        .bind(position.id)
        .execute(tx.as_mut())
        .await?;

        let outcome = PositionSettlement {
            market_id,
            user_id,
            winning_shares,
            gross_minor: gross,
            fee_minor: fee,
            net_minor: net,
            refund,
            replayed: false,
        };
        ledger::idempotency_stamp(
            &mut tx,
            ledger::SCOPE_SETTLEMENT,
            &idempotency_key,
            &serde_json::to_value(&outcome)?,
            ex.config.txn.idempotency_ttl_hours,
        )
        .await?;
        Ok(outcome)
    })
}

/// 100 minor per share, rounded down to whole minor units.
fn floor_payout_minor(shares: Decimal) -> CoreResult<i64> {
    (shares * Decimal::from(crate::decimal::MINOR_PER_UNIT))
        .floor()
        .to_i64()
        .ok_or_else(|| CoreError::Domain(format!("payout for {shares} shares out of range")))
}

/// Totals from the settlement entries already on the ledger.
pub async fn get_settlement_summary(ex: &Exchange, market_id: i64) -> CoreResult<SettlementSummary> {
    // Confirm the market exists before projecting.
    market::get(ex, market_id).await?;

    let row = sqlx::query(
        "SELECT COUNT(DISTINCT user_id) AS users_paid,
                COALESCE(SUM(amount_minor) FILTER (WHERE kind = 'settlement' AND amount_minor > 0), 0)::BIGINT AS net_paid,
                COALESCE(SUM(amount_minor) FILTER (WHERE kind = 'fee' AND amount_minor > 0), 0)::BIGINT AS fees
         FROM ledger_entries
         WHERE metadata->>'market_id' = $1
           AND kind IN ('settlement', 'fee')
           AND metadata->>'reason' IN ('settlement', 'invalid_refund', 'settlement_fee')",
    )
    .bind(market_id.to_string())
    .fetch_one(&ex.pool)
    .await?;

    Ok(SettlementSummary {
        market_id,
        users_paid: row.get("users_paid"),
        net_paid_minor: row.get("net_paid"),
        fees_collected_minor: row.get("fees"),
    })
}
