//! Database connection and transaction plumbing.
//!
//! Every mutating operation runs inside one `with_serializable_tx!` block:
//! SERIALIZABLE isolation, a per-transaction statement timeout, and bounded
//! retry with exponential backoff and jitter on retryable SQLSTATEs.

use crate::error::CoreResult;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Base delay for the retry backoff; quadruples per attempt (10/40/160ms).
pub(crate) const BASE_RETRY_DELAY_MS: u64 = 10;

/// Create a connection pool to PostgreSQL.
pub async fn create_pool(database_url: &str) -> CoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    tracing::info!("connected to database");
    Ok(pool)
}

/// Apply the schema in `migrations/`.
pub async fn run_migrations(pool: &PgPool) -> CoreResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))?;
    Ok(())
}

/// Executes `$body` against a transaction bound to `$tx_var` at SERIALIZABLE
/// isolation, committing on Ok. Retryable failures (serialization, deadlock,
/// unique-violation races) roll back and re-run up to `config.txn.retries`
/// times with 10/40/160ms backoff plus jitter; exhaustion surfaces as
/// `CoreError::Serialization`.
macro_rules! with_serializable_tx {
    ($pool:expr, $config:expr, $tx_var:ident, $body:block) => {{
        let mut attempt: u32 = 0;
        let retries = $config.txn.retries;
        loop {
            let mut $tx_var = $pool.begin().await?;

            sqlx::Executor::execute(
                $tx_var.as_mut(),
                sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"),
            )
            .await?;
            sqlx::Executor::execute(
                $tx_var.as_mut(),
                sqlx::query(&format!(
                    "SET LOCAL statement_timeout = {}",
                    $config.txn.timeout_ms
                )),
            )
            .await?;

            let result: crate::error::CoreResult<_> = async { $body }.await;

            match result {
                Ok(value) => {
                    $tx_var.commit().await?;
                    break Ok(value);
                }
                Err(e) => {
                    $tx_var.rollback().await.ok();

                    if e.is_retryable() {
                        if attempt < retries {
                            let jitter = rand::random::<u64>() % 10;
                            let delay_ms =
                                crate::db::BASE_RETRY_DELAY_MS * 4u64.pow(attempt) + jitter;
                            tracing::debug!(attempt, delay_ms, "retrying serializable transaction");
                            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                            attempt += 1;
                            continue;
                        }
                        break Err(crate::error::CoreError::Serialization(retries));
                    }
                    break Err(e);
                }
            }
        }
    }};
}

pub(crate) use with_serializable_tx;

/// A transaction handle as the macro hands it to operation bodies.
pub(crate) type PgTxn<'a> = sqlx::Transaction<'a, sqlx::Postgres>;
