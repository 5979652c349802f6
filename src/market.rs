//! Market entity and lifecycle state machine.
//!
//! DRAFT -(seed)-> OPEN -(close)-> CLOSED -(resolve)-> RESOLVED, with
//! RESOLVED terminal. These operations are the only writers of `status`.
//! Each market owns exactly one LMSR state row; `liquidity_b` is fixed at
//! creation and never changes after seeding.

use crate::db::{with_serializable_tx, PgTxn};
use crate::decimal;
use crate::error::{CoreError, CoreResult};
use crate::gates::AlertEvent;
use crate::ledger::{self, AccountKind, EntryInput, EntryKind};
use crate::lmsr::{self, LmsrState};
use crate::Exchange;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

pub const DEFAULT_CURRENCY: &str = "AUD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Draft,
    Open,
    Closed,
    Resolved,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Draft => "draft",
            MarketStatus::Open => "open",
            MarketStatus::Closed => "closed",
            MarketStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "draft" => Ok(MarketStatus::Draft),
            "open" => Ok(MarketStatus::Open),
            "closed" => Ok(MarketStatus::Closed),
            "resolved" => Ok(MarketStatus::Resolved),
            other => Err(CoreError::InvalidOutcome(format!(
                "unknown market status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Yes,
    No,
    Invalid,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Yes => "yes",
            Resolution::No => "no",
            Resolution::Invalid => "invalid",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "yes" => Ok(Resolution::Yes),
            "no" => Ok(Resolution::No),
            "invalid" => Ok(Resolution::Invalid),
            other => Err(CoreError::InvalidOutcome(format!(
                "unknown resolution '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: i64,
    pub slug: String,
    pub title: String,
    pub category: String,
    pub status: MarketStatus,
    pub min_trade_minor: i64,
    pub max_trade_minor: Option<i64>,
    pub open_at: DateTime<Utc>,
    pub close_at: DateTime<Utc>,
    pub resolve_at: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
    /// Set by the emergency halt; a blocked market accepts no trades and
    /// no settlement until an operator clears it.
    pub blocked_at: Option<DateTime<Utc>>,
    pub halt_reason: Option<String>,
    pub creator_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateMarketParams {
    pub slug: String,
    pub title: String,
    pub category: String,
    pub liquidity_b: Decimal,
    pub min_trade_minor: i64,
    pub max_trade_minor: Option<i64>,
    pub open_at: DateTime<Utc>,
    pub close_at: DateTime<Utc>,
    pub creator_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct MarketFilter {
    pub status: Option<MarketStatus>,
    pub category: Option<String>,
    pub cursor: Option<i64>,
    pub limit: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketStats {
    pub market_id: i64,
    pub p_yes: Decimal,
    pub p_no: Decimal,
    pub liquidity_b: Decimal,
    pub unique_traders: i64,
    pub total_trades: i64,
    pub volume_minor: i64,
}

pub(crate) fn market_from_row(row: &sqlx::postgres::PgRow) -> CoreResult<Market> {
    let resolution: Option<String> = row.get("resolution");
    Ok(Market {
        id: row.get("id"),
        slug: row.get("slug"),
        title: row.get("title"),
        category: row.get("category"),
        status: MarketStatus::parse(row.get("status"))?,
        min_trade_minor: row.get("min_trade_minor"),
        max_trade_minor: row.get("max_trade_minor"),
        open_at: row.get("open_at"),
        close_at: row.get("close_at"),
        resolve_at: row.get("resolve_at"),
        resolution: resolution.as_deref().map(Resolution::parse).transpose()?,
        blocked_at: row.get("blocked_at"),
        halt_reason: row.get("halt_reason"),
        creator_id: row.get("creator_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

// --- LMSR state persistence ---

fn lmsr_state_from_row(row: &sqlx::postgres::PgRow) -> LmsrState {
    LmsrState {
        liquidity_b: row.get("liquidity_b"),
        q_yes: row.get("q_yes"),
        q_no: row.get("q_no"),
    }
}

/// Latest committed snapshot, no lock. Quote generation reads this; the
/// drift check at execute time catches staleness.
pub(crate) async fn fetch_lmsr_state(ex: &Exchange, market_id: i64) -> CoreResult<LmsrState> {
    let row = sqlx::query("SELECT liquidity_b, q_yes, q_no FROM lmsr_state WHERE market_id = $1")
        .bind(market_id)
        .fetch_optional(&ex.pool)
        .await?
        .ok_or(CoreError::MarketNotFound)?;
    Ok(lmsr_state_from_row(&row))
}

/// Exclusive row lock for the duration of an executing transaction. All
/// LMSR transitions for one market serialize on this lock.
pub(crate) async fn lock_lmsr_state_in(
    tx: &mut PgTxn<'_>,
    market_id: i64,
) -> CoreResult<LmsrState> {
    let row = sqlx::query(
        "SELECT liquidity_b, q_yes, q_no FROM lmsr_state WHERE market_id = $1 FOR UPDATE",
    )
    .bind(market_id)
    .fetch_optional(tx.as_mut())
    .await?
    .ok_or(CoreError::MarketNotFound)?;
    Ok(lmsr_state_from_row(&row))
}

pub(crate) async fn save_lmsr_state_in(
    tx: &mut PgTxn<'_>,
    market_id: i64,
    state: &LmsrState,
) -> CoreResult<()> {
    sqlx::query(
        "UPDATE lmsr_state SET q_yes = $1, q_no = $2, updated_at = NOW() WHERE market_id = $3",
    )
    .bind(state.q_yes)
    .bind(state.q_no)
    .bind(market_id)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

pub(crate) async fn lock_market_in(tx: &mut PgTxn<'_>, market_id: i64) -> CoreResult<Market> {
    let row = sqlx::query("SELECT * FROM markets WHERE id = $1 FOR UPDATE")
        .bind(market_id)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or(CoreError::MarketNotFound)?;
    market_from_row(&row)
}

async fn audit_in(
    tx: &mut PgTxn<'_>,
    actor_id: i64,
    action: &str,
    market_id: i64,
    detail: serde_json::Value,
) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO admin_audit_log (actor_id, action, market_id, detail)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(actor_id)
    .bind(action)
    .bind(market_id)
    .bind(detail)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

// --- lifecycle operations ---

/// Create a DRAFT market with its LMSR state (b fixed now, q = 0).
pub async fn create(ex: &Exchange, params: CreateMarketParams) -> CoreResult<Market> {
    lmsr::validate_liquidity(&ex.config, params.liquidity_b)?;
    if params.open_at >= params.close_at {
        return Err(CoreError::InvalidEntry(
            "open_at must precede close_at".to_string(),
        ));
    }
    if params.min_trade_minor <= 0 {
        return Err(CoreError::InvalidEntry(
            "min_trade_minor must be positive".to_string(),
        ));
    }
    if let Some(max) = params.max_trade_minor {
        if max < params.min_trade_minor {
            return Err(CoreError::InvalidEntry(
                "max_trade_minor must be at least min_trade_minor".to_string(),
            ));
        }
    }

    let market = with_serializable_tx!(&ex.pool, &ex.config, tx, {
        let taken: Option<i64> = sqlx::query_scalar("SELECT id FROM markets WHERE slug = $1")
            .bind(&params.slug)
            .fetch_optional(tx.as_mut())
            .await?;
        if taken.is_some() {
            return Err(CoreError::InvalidEntry(format!(
                "slug '{}' already exists",
                params.slug
            )));
        }

        let row = sqlx::query(
            "INSERT INTO markets
                 (slug, title, category, min_trade_minor, max_trade_minor,
                  open_at, close_at, creator_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING *",
        )
        .bind(&params.slug)
        .bind(&params.title)
        .bind(&params.category)
        .bind(params.min_trade_minor)
        .bind(params.max_trade_minor)
        .bind(params.open_at)
        .bind(params.close_at)
        .bind(params.creator_id)
        .fetch_one(tx.as_mut())
        .await?;
        let market = market_from_row(&row)?;

        sqlx::query("INSERT INTO lmsr_state (market_id, liquidity_b) VALUES ($1, $2)")
            .bind(market.id)
            .bind(params.liquidity_b)
            .execute(tx.as_mut())
            .await?;

        audit_in(
            &mut tx,
            params.creator_id,
            "market_create",
            market.id,
            serde_json::json!({ "slug": params.slug.clone(), "liquidity_b": params.liquidity_b }),
        )
        .await?;

        Ok(market)
    })?;

    tracing::info!(market_id = market.id, slug = %market.slug, "market created");
    Ok(market)
}

/// DRAFT -> OPEN. Derives the starting quantities from `initial_p_yes` and
/// records the seed liquidity as a house -> custody ledger transaction.
pub async fn seed(
    ex: &Exchange,
    market_id: i64,
    liquidity_pool_minor: i64,
    initial_p_yes: Option<Decimal>,
) -> CoreResult<Market> {
    if liquidity_pool_minor <= 0 {
        return Err(CoreError::InvalidEntry(
            "seed liquidity must be positive".to_string(),
        ));
    }

    let market = with_serializable_tx!(&ex.pool, &ex.config, tx, {
        let market = lock_market_in(&mut tx, market_id).await?;
        if market.status != MarketStatus::Draft {
            return Err(CoreError::InvalidTransition {
                from: market.status.as_str(),
                to: MarketStatus::Open.as_str(),
            });
        }

        let current = lock_lmsr_state_in(&mut tx, market_id).await?;
        let seeded = lmsr::seed(&ex.config, current.liquidity_b, initial_p_yes)?;
        save_lmsr_state_in(&mut tx, market_id, &seeded).await?;

        let house =
            ledger::get_or_create_account_in(&mut tx, AccountKind::ExternalBank, None, DEFAULT_CURRENCY)
                .await?;
        let custody =
            ledger::get_or_create_account_in(&mut tx, AccountKind::CustodyCash, None, DEFAULT_CURRENCY)
                .await?;

        if let Some(stored) =
            ledger::idempotency_lookup(&mut tx, ledger::SCOPE_LEDGER, &format!("seed:{market_id}"))
                .await?
        {
            // Seed already recorded; the state machine should have caught
            // this, so just surface the original result.
            let _: ledger::TxnResult = serde_json::from_value(stored)?;
            return Ok(market);
        }

        let txn_id = Uuid::new_v4();
        let metadata = serde_json::json!({ "market_id": market_id, "reason": "seed" });
        let entry_ids = ledger::post_entries_in(
            &mut tx,
            txn_id,
            &[
                EntryInput::new(
                    custody.id,
                    house.id,
                    liquidity_pool_minor,
                    EntryKind::Deposit,
                    "market seed liquidity",
                )
                .with_metadata(metadata.clone()),
                EntryInput::new(
                    house.id,
                    custody.id,
                    -liquidity_pool_minor,
                    EntryKind::Deposit,
                    "market seed liquidity",
                )
                .with_metadata(metadata),
            ],
        )
        .await?;
        let result = ledger::TxnResult {
            txn_id,
            entry_ids,
            replayed: false,
        };
        ledger::idempotency_stamp(
            &mut tx,
            ledger::SCOPE_LEDGER,
            &format!("seed:{market_id}"),
            &serde_json::to_value(&result)?,
            ex.config.txn.idempotency_ttl_hours,
        )
        .await?;

        let row = sqlx::query(
            "UPDATE markets SET status = 'open', updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(market_id)
        .fetch_one(tx.as_mut())
        .await?;

        audit_in(
            &mut tx,
            market.creator_id,
            "market_seed",
            market_id,
            serde_json::json!({
                "liquidity_pool_minor": liquidity_pool_minor,
                "initial_p_yes": initial_p_yes,
            }),
        )
        .await?;

        market_from_row(&row)
    })?;

    tracing::info!(market_id, liquidity_pool_minor, "market seeded and opened");
    Ok(market)
}

/// OPEN -> CLOSED. No new trades are accepted afterwards.
pub async fn close(ex: &Exchange, market_id: i64) -> CoreResult<Market> {
    let market = with_serializable_tx!(&ex.pool, &ex.config, tx, {
        let market = lock_market_in(&mut tx, market_id).await?;
        if market.status != MarketStatus::Open {
            return Err(CoreError::InvalidTransition {
                from: market.status.as_str(),
                to: MarketStatus::Closed.as_str(),
            });
        }

        let row = sqlx::query(
            "UPDATE markets SET status = 'closed', updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(market_id)
        .fetch_one(tx.as_mut())
        .await?;

        audit_in(
            &mut tx,
            market.creator_id,
            "market_close",
            market_id,
            serde_json::json!({}),
        )
        .await?;

        market_from_row(&row)
    })?;

    tracing::info!(market_id, "market closed");
    Ok(market)
}

/// CLOSED -> RESOLVED. Re-resolving with the identical outcome is a no-op
/// returning the original row; a different outcome fails.
pub async fn resolve(
    ex: &Exchange,
    market_id: i64,
    outcome: Resolution,
    notes: &str,
    source_url: Option<&str>,
) -> CoreResult<Market> {
    let market = with_serializable_tx!(&ex.pool, &ex.config, tx, {
        let market = lock_market_in(&mut tx, market_id).await?;

        if market.status == MarketStatus::Resolved {
            return if market.resolution == Some(outcome) {
                Ok(market)
            } else {
                Err(CoreError::AlreadyResolved)
            };
        }
        if market.status != MarketStatus::Closed {
            return Err(CoreError::InvalidTransition {
                from: market.status.as_str(),
                to: MarketStatus::Resolved.as_str(),
            });
        }

        let row = sqlx::query(
            "UPDATE markets SET
                status = 'resolved',
                resolution = $1,
                resolution_notes = $2,
                resolution_source_url = $3,
                resolve_at = NOW(),
                updated_at = NOW()
             WHERE id = $4
             RETURNING *",
        )
        .bind(outcome.as_str())
        .bind(notes)
        .bind(source_url)
        .bind(market_id)
        .fetch_one(tx.as_mut())
        .await?;

        audit_in(
            &mut tx,
            market.creator_id,
            "market_resolve",
            market_id,
            serde_json::json!({
                "outcome": outcome.as_str(),
                "notes": notes,
                "source_url": source_url,
            }),
        )
        .await?;

        market_from_row(&row)
    })?;

    tracing::info!(market_id, outcome = outcome.as_str(), "market resolved");
    Ok(market)
}

/// Emergency halt. Runs outside any failing transaction so the block
/// persists even though the posting that detected the failure rolled
/// back. Idempotent; the first block's timestamp and reason win.
pub async fn block(ex: &Exchange, market_id: i64, reason: &str) -> CoreResult<()> {
    let updated = sqlx::query(
        "UPDATE markets SET
             blocked_at = COALESCE(blocked_at, NOW()),
             halt_reason = COALESCE(halt_reason, $1),
             updated_at = NOW()
         WHERE id = $2",
    )
    .bind(reason)
    .bind(market_id)
    .execute(&ex.pool)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(CoreError::MarketNotFound);
    }

    sqlx::query(
        "INSERT INTO admin_audit_log (action, market_id, detail)
         VALUES ('market_block', $1, $2)",
    )
    .bind(market_id)
    .bind(serde_json::json!({ "reason": reason }))
    .execute(&ex.pool)
    .await?;

    tracing::error!(market_id, reason, "market blocked");
    Ok(())
}

/// Escalation path for fatal accounting failures: persist the market
/// block, raise the high-severity alert, and abort the process when the
/// internal invariant itself is broken.
pub(crate) async fn escalate_fatal(ex: &Exchange, market_id: Option<i64>, error: &CoreError) {
    tracing::error!(?market_id, %error, "fatal accounting failure");
    if let Some(id) = market_id {
        if let Err(block_error) = block(ex, id, &error.to_string()).await {
            tracing::error!(market_id = id, %block_error, "failed to persist market block");
        }
    }
    ex.observer.on_alert(&AlertEvent {
        market_id,
        message: error.to_string(),
    });
    if matches!(error, CoreError::InternalInvariantBroken(_)) {
        std::process::abort();
    }
}

// --- reads ---

pub async fn get(ex: &Exchange, market_id: i64) -> CoreResult<Market> {
    let row = sqlx::query("SELECT * FROM markets WHERE id = $1")
        .bind(market_id)
        .fetch_optional(&ex.pool)
        .await?
        .ok_or(CoreError::MarketNotFound)?;
    market_from_row(&row)
}

pub async fn get_by_slug(ex: &Exchange, slug: &str) -> CoreResult<Market> {
    let row = sqlx::query("SELECT * FROM markets WHERE slug = $1")
        .bind(slug)
        .fetch_optional(&ex.pool)
        .await?
        .ok_or(CoreError::MarketNotFound)?;
    market_from_row(&row)
}

pub async fn list(ex: &Exchange, filter: MarketFilter) -> CoreResult<Vec<Market>> {
    let limit = if filter.limit <= 0 { 50 } else { filter.limit.min(200) };
    let status = filter.status.map(|s| s.as_str());

    let rows = sqlx::query(
        "SELECT * FROM markets
         WHERE ($1::TEXT IS NULL OR status = $1)
           AND ($2::TEXT IS NULL OR category = $2)
           AND ($3::BIGINT IS NULL OR id < $3)
         ORDER BY id DESC
         LIMIT $4",
    )
    .bind(status)
    .bind(&filter.category)
    .bind(filter.cursor)
    .bind(limit)
    .fetch_all(&ex.pool)
    .await?;

    rows.iter().map(market_from_row).collect()
}

/// Current prices plus participation counters.
pub async fn stats(ex: &Exchange, market_id: i64) -> CoreResult<MarketStats> {
    let state = fetch_lmsr_state(ex, market_id).await?;
    let (p_yes, p_no) = lmsr::prices(&state)?;

    let row = sqlx::query(
        "SELECT COUNT(DISTINCT user_id) AS unique_traders,
                COUNT(id) AS total_trades,
                COALESCE(SUM(ABS(cost_minor)), 0)::BIGINT AS volume_minor
         FROM trades
         WHERE market_id = $1",
    )
    .bind(market_id)
    .fetch_one(&ex.pool)
    .await?;

    Ok(MarketStats {
        market_id,
        p_yes: decimal::to_fixed(p_yes, 6),
        p_no: decimal::to_fixed(p_no, 6),
        liquidity_b: state.liquidity_b,
        unique_traders: row.get("unique_traders"),
        total_trades: row.get("total_trades"),
        volume_minor: row.get("volume_minor"),
    })
}
