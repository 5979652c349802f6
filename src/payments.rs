//! Payments bridge: idempotent consumption of provider webhook events, and
//! the two-phase withdrawal flow.
//!
//! Provider retries are expected; `payment:{event_id}` keys in the
//! `payment_webhook` scope make redelivery a no-op. Withdrawals lock funds
//! by moving available -> pending with no ledger entries; the ledger entry
//! is posted at approval against the pending sub-balance, and the provider's
//! completion event only flips the row state.

use crate::db::{with_serializable_tx, PgTxn};
use crate::error::{CoreError, CoreResult};
use crate::gates::{decide_with_timeout, monitor_with_timeout, AmlAssessment, AmlVerdict, GateDecision};
use crate::ledger::{self, AccountKind, EntryInput, EntryKind};
use crate::market::DEFAULT_CURRENCY;
use crate::Exchange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

/// A webhook event as delivered by the provider adapter. `payload` is the
/// raw provider body, passed through opaquely; the core interprets only the
/// tagged fields it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub event_id: String,
    pub kind: String,
    pub user_id: Option<i64>,
    pub amount_minor: Option<i64>,
    pub withdrawal_id: Option<i64>,
    pub signature: String,
    pub payload: serde_json::Value,
}

/// The event kinds the core acts on; everything else is recorded as an
/// idempotent no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EventKind {
    DepositSucceeded,
    PayoutCompleted,
    Unknown,
}

impl EventKind {
    fn parse(kind: &str) -> Self {
        match kind {
            "deposit_succeeded" => EventKind::DepositSucceeded,
            "payout_completed" => EventKind::PayoutCompleted,
            _ => EventKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub event_id: String,
    pub action: String,
    pub txn_id: Option<Uuid>,
    pub flagged_for_review: bool,
    #[serde(skip)]
    pub replayed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Requested,
    Approved,
    Rejected,
    Completed,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Requested => "requested",
            WithdrawalStatus::Approved => "approved",
            WithdrawalStatus::Rejected => "rejected",
            WithdrawalStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "requested" => Ok(WithdrawalStatus::Requested),
            "approved" => Ok(WithdrawalStatus::Approved),
            "rejected" => Ok(WithdrawalStatus::Rejected),
            "completed" => Ok(WithdrawalStatus::Completed),
            other => Err(CoreError::InvalidOutcome(format!(
                "unknown withdrawal status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: i64,
    pub user_id: i64,
    pub amount_minor: i64,
    pub status: WithdrawalStatus,
    pub provider_ref: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub replayed: bool,
}

fn withdrawal_from_row(row: &sqlx::postgres::PgRow) -> CoreResult<Withdrawal> {
    Ok(Withdrawal {
        id: row.get("id"),
        user_id: row.get("user_id"),
        amount_minor: row.get("amount_minor"),
        status: WithdrawalStatus::parse(row.get("status"))?,
        provider_ref: row.get("provider_ref"),
        reason: row.get("reason"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        replayed: false,
    })
}

async fn lock_withdrawal_in(tx: &mut PgTxn<'_>, withdrawal_id: i64) -> CoreResult<Withdrawal> {
    let row = sqlx::query("SELECT * FROM withdrawals WHERE id = $1 FOR UPDATE")
        .bind(withdrawal_id)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or(CoreError::WithdrawalNotFound(withdrawal_id))?;
    withdrawal_from_row(&row)
}

async fn record_aml_event_in(
    tx: &mut PgTxn<'_>,
    user_id: i64,
    action: &str,
    assessment: &AmlAssessment,
    context: serde_json::Value,
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
    .bind(context)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

/// Ingest one provider webhook event. Redelivery of a processed event
/// returns the stored outcome and performs no writes.
pub async fn process_payment_event(
    ex: &Exchange,
    event: &ProviderEvent,
) -> CoreResult<PaymentOutcome> {
    let payload_bytes = serde_json::to_vec(&event.payload)?;
    if !ex
        .gates
        .payments
        .verify_webhook_signature(&payload_bytes, &event.signature)
    {
        return Err(CoreError::ProviderSignatureInvalid);
    }

    let idempotency_key = format!("payment:{}", event.event_id);

    with_serializable_tx!(&ex.pool, &ex.config, tx, {
        if let Some(stored) =
            ledger::idempotency_lookup(&mut tx, ledger::SCOPE_PAYMENT_WEBHOOK, &idempotency_key)
                .await?
        {
            let mut replay: PaymentOutcome = serde_json::from_value(stored)?;
            replay.replayed = true;
            return Ok(replay);
        }

        let outcome = match EventKind::parse(&event.kind) {
            EventKind::DepositSucceeded => apply_deposit_in(ex, &mut tx, event).await?,
            EventKind::PayoutCompleted => apply_payout_completed_in(&mut tx, event).await?,
            EventKind::Unknown => {
                tracing::debug!(kind = %event.kind, "ignoring unknown payment event kind");
                PaymentOutcome {
                    event_id: event.event_id.clone(),
                    action: "ignored".to_string(),
                    txn_id: None,
                    flagged_for_review: false,
                    replayed: false,
                }
            }
        };

        ledger::idempotency_stamp(
            &mut tx,
            ledger::SCOPE_PAYMENT_WEBHOOK,
            &idempotency_key,
            &serde_json::to_value(&outcome)?,
            ex.config.txn.idempotency_ttl_hours,
        )
        .await?;
        Ok(outcome)
    })
}

async fn apply_deposit_in(
    ex: &Exchange,
    tx: &mut PgTxn<'_>,
    event: &ProviderEvent,
) -> CoreResult<PaymentOutcome> {
    let user_id = event.user_id.ok_or_else(|| {
        CoreError::InvalidEntry("deposit event is missing a user id".to_string())
    })?;
    let amount_minor = event
        .amount_minor
        .filter(|a| *a > 0)
        .ok_or_else(|| CoreError::InvalidEntry("deposit amount must be positive".to_string()))?;

    if let GateDecision::Deny { reason } =
        decide_with_timeout(ex.gates.kyc.deposit_eligible(user_id, amount_minor)).await
    {
        return Err(CoreError::Forbidden(reason));
    }
    let aml = monitor_with_timeout(ex.gates.aml.monitor_deposit(user_id, amount_minor)).await;
    if aml.verdict == AmlVerdict::Block {
        tracing::warn!(user_id, "deposit blocked by aml monitor");
        return Err(CoreError::Forbidden(aml.reasons.join("; ")));
    }
    let flagged = aml.verdict == AmlVerdict::Review;
    if flagged {
        record_aml_event_in(
            tx,
            user_id,
            "deposit",
            &aml,
            serde_json::json!({ "event_id": event.event_id.clone() }),
        )
        .await?;
    }

    let user_cash =
        ledger::get_or_create_account_in(tx, AccountKind::UserCash, Some(user_id), DEFAULT_CURRENCY)
            .await?;
    let external =
        ledger::get_or_create_account_in(tx, AccountKind::ExternalBank, None, DEFAULT_CURRENCY)
            .await?;

    let txn_id = Uuid::new_v4();
    let metadata = serde_json::json!({
        "provider_event_id": event.event_id.clone(),
        "flagged_for_review": flagged,
    });
    ledger::post_entries_in(
        tx,
        txn_id,
        &[
            EntryInput::new(
                user_cash.id,
                external.id,
                amount_minor,
                EntryKind::Deposit,
                "deposit from payment provider",
            )
            .for_user(user_id)
            .with_metadata(metadata.clone()),
            EntryInput::new(
                external.id,
                user_cash.id,
                -amount_minor,
                EntryKind::Deposit,
                "deposit funding leg",
            )
            .with_metadata(metadata),
        ],
    )
    .await?;

    Ok(PaymentOutcome {
        event_id: event.event_id.clone(),
        action: "deposit".to_string(),
        txn_id: Some(txn_id),
        flagged_for_review: flagged,
        replayed: false,
    })
}

async fn apply_payout_completed_in(
    tx: &mut PgTxn<'_>,
    event: &ProviderEvent,
) -> CoreResult<PaymentOutcome> {
    let withdrawal_id = event.withdrawal_id.ok_or_else(|| {
        CoreError::InvalidEntry("payout event is missing a withdrawal id".to_string())
    })?;

    let withdrawal = lock_withdrawal_in(tx, withdrawal_id).await?;
    match withdrawal.status {
        WithdrawalStatus::Approved => {
            sqlx::query(
                "UPDATE withdrawals SET status = 'completed', updated_at = NOW() WHERE id = $1",
            )
            .bind(withdrawal_id)
            .execute(tx.as_mut())
            .await?;
            Ok(PaymentOutcome {
                event_id: event.event_id.clone(),
                action: "payout_completed".to_string(),
                txn_id: None,
                flagged_for_review: false,
                replayed: false,
            })
        }
        // The provider can re-announce completion; nothing left to do.
        WithdrawalStatus::Completed => Ok(PaymentOutcome {
            event_id: event.event_id.clone(),
            action: "payout_completed".to_string(),
            txn_id: None,
            flagged_for_review: false,
            replayed: false,
        }),
        other => Err(CoreError::InvalidTransition {
            from: other.as_str(),
            to: WithdrawalStatus::Completed.as_str(),
        }),
    }
}

/// Phase one: lock the amount by moving it from available to pending and
/// record a REQUESTED withdrawal row. No ledger entries yet.
pub async fn request_withdrawal(
    ex: &Exchange,
    user_id: i64,
    amount_minor: i64,
    idempotency_key: &str,
) -> CoreResult<Withdrawal> {
    if amount_minor <= 0 {
        return Err(CoreError::InvalidEntry(
            "withdrawal amount must be positive".to_string(),
        ));
    }

    if let GateDecision::Deny { reason } =
        decide_with_timeout(ex.gates.kyc.withdraw_eligible(user_id, amount_minor)).await
    {
        return Err(CoreError::Forbidden(reason));
    }
    let aml = monitor_with_timeout(ex.gates.aml.monitor_withdrawal(user_id, amount_minor)).await;
    if aml.verdict == AmlVerdict::Block {
        tracing::warn!(user_id, "withdrawal blocked by aml monitor");
        return Err(CoreError::Forbidden(aml.reasons.join("; ")));
    }

    with_serializable_tx!(&ex.pool, &ex.config, tx, {
        if let Some(stored) =
            ledger::idempotency_lookup(&mut tx, ledger::SCOPE_WITHDRAWAL, idempotency_key).await?
        {
            let mut replay: Withdrawal = serde_json::from_value(stored)?;
            replay.replayed = true;
            return Ok(replay);
        }

        if aml.verdict == AmlVerdict::Review {
            record_aml_event_in(
                &mut tx,
                user_id,
                "withdrawal",
                &aml,
                serde_json::json!({ "amount_minor": amount_minor }),
            )
            .await?;
        }

        let user_cash = ledger::get_or_create_account_in(
            &mut tx,
            AccountKind::UserCash,
            Some(user_id),
            DEFAULT_CURRENCY,
        )
        .await?;
        let locked = ledger::lock_account_in(&mut tx, user_cash.id).await?;
        if locked.available_minor < amount_minor {
            return Err(CoreError::InsufficientFunds {
                needed_minor: amount_minor,
                available_minor: locked.available_minor,
            });
        }

        sqlx::query(
            "UPDATE accounts SET
                 available_minor = available_minor - $1,
                 pending_minor = pending_minor + $1,
                 updated_at = NOW()
             WHERE id = $2",
        )
        .bind(amount_minor)
        .bind(user_cash.id)
        .execute(tx.as_mut())
        .await?;

        let row = sqlx::query(
            "INSERT INTO withdrawals (user_id, amount_minor) VALUES ($1, $2) RETURNING *",
        )
        .bind(user_id)
        .bind(amount_minor)
        .fetch_one(tx.as_mut())
        .await?;
        let withdrawal = withdrawal_from_row(&row)?;

        ledger::idempotency_stamp(
            &mut tx,
            ledger::SCOPE_WITHDRAWAL,
            idempotency_key,
            &serde_json::to_value(&withdrawal)?,
            ex.config.txn.idempotency_ttl_hours,
        )
        .await?;
        Ok(withdrawal)
    })
}

/// Phase two (admin approval): hand the payout to the provider and post the
/// ledger transaction against the pending sub-balance.
pub async fn approve_withdrawal(ex: &Exchange, withdrawal_id: i64) -> CoreResult<Withdrawal> {
    with_serializable_tx!(&ex.pool, &ex.config, tx, {
        let withdrawal = lock_withdrawal_in(&mut tx, withdrawal_id).await?;
        if withdrawal.status != WithdrawalStatus::Requested {
            return Err(CoreError::InvalidTransition {
                from: withdrawal.status.as_str(),
                to: WithdrawalStatus::Approved.as_str(),
            });
        }

        let reference = format!("wd-{withdrawal_id}");
        let provider_ref = ex
            .gates
            .payments
            .initiate_payout(withdrawal.user_id, withdrawal.amount_minor, &reference)
            .await
            .map_err(|e| CoreError::ProviderUnavailable(e.to_string()))?;

        let user_cash = ledger::get_or_create_account_in(
            &mut tx,
            AccountKind::UserCash,
            Some(withdrawal.user_id),
            DEFAULT_CURRENCY,
        )
        .await?;
        let external =
            ledger::get_or_create_account_in(&mut tx, AccountKind::ExternalBank, None, DEFAULT_CURRENCY)
                .await?;

        let txn_id = Uuid::new_v4();
        let metadata = serde_json::json!({
            "withdrawal_id": withdrawal_id,
            "provider_ref": provider_ref.clone(),
        });
        ledger::post_entries_in(
            &mut tx,
            txn_id,
            &[
                EntryInput::new(
                    user_cash.id,
                    external.id,
                    -withdrawal.amount_minor,
                    EntryKind::Withdrawal,
                    "approved withdrawal payout",
                )
                .for_user(withdrawal.user_id)
                .with_metadata(metadata.clone())
                .on_pending(),
                EntryInput::new(
                    external.id,
                    user_cash.id,
                    withdrawal.amount_minor,
                    EntryKind::Withdrawal,
                    "withdrawal to external bank",
                )
                .with_metadata(metadata),
            ],
        )
        .await?;

        let row = sqlx::query(
            "UPDATE withdrawals SET status = 'approved', provider_ref = $1, updated_at = NOW()
             WHERE id = $2
             RETURNING *",
        )
        .bind(&provider_ref)
        .bind(withdrawal_id)
        .fetch_one(tx.as_mut())
        .await?;
        withdrawal_from_row(&row)
    })
}

/// Rejection returns the locked amount to the available balance.
pub async fn reject_withdrawal(
    ex: &Exchange,
    withdrawal_id: i64,
    reason: &str,
) -> CoreResult<Withdrawal> {
    with_serializable_tx!(&ex.pool, &ex.config, tx, {
        let withdrawal = lock_withdrawal_in(&mut tx, withdrawal_id).await?;
        if withdrawal.status != WithdrawalStatus::Requested {
            return Err(CoreError::InvalidTransition {
                from: withdrawal.status.as_str(),
                to: WithdrawalStatus::Rejected.as_str(),
            });
        }

        let user_cash = ledger::get_or_create_account_in(
            &mut tx,
            AccountKind::UserCash,
            Some(withdrawal.user_id),
            DEFAULT_CURRENCY,
        )
        .await?;
        sqlx::query(
            "UPDATE accounts SET
                 available_minor = available_minor + $1,
                 pending_minor = pending_minor - $1,
                 updated_at = NOW()
             WHERE id = $2",
        )
        .bind(withdrawal.amount_minor)
        .bind(user_cash.id)
        .execute(tx.as_mut())
        .await?;

        let row = sqlx::query(
            "UPDATE withdrawals SET status = 'rejected', reason = $1, updated_at = NOW()
             WHERE id = $2
             RETURNING *",
        )
        .bind(reason)
        .bind(withdrawal_id)
        .fetch_one(tx.as_mut())
        .await?;
        withdrawal_from_row(&row)
    })
}
