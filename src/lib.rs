//! Trading and accounting core for a binary prediction-market exchange.
//!
//! Three tightly coupled subsystems share one ACID boundary per operation:
//! the LMSR market maker (`lmsr`), the double-entry ledger (`ledger`), and
//! the market lifecycle engine (`market`), wired together by the trading,
//! settlement and payments pipelines. Outside collaborators (KYC, AML,
//! responsible gambling, the payment provider) appear only as the `gates`
//! traits.

pub mod config;
pub mod db;
pub mod decimal;
pub mod error;
pub mod gates;
pub mod ledger;
pub mod lmsr;
pub mod market;
pub mod payments;
pub mod quote;
pub mod settlement;
pub mod trading;


use std::sync::Arc;

pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use gates::{Gates, NoopObserver, Observer};
pub use quote::QuoteSigner;

/// Top-level context owning the values every operation needs: the pool, the
/// frozen config snapshot, the quote-signing key and the collaborator
/// gates. Passed by reference into each operation; there is no other shared
/// mutable state.
pub struct Exchange {
    pub pool: sqlx::PgPool,
    pub config: Config,
    pub signer: QuoteSigner,
    pub gates: Gates,
    pub observer: Arc<dyn Observer>,
}

impl Exchange {
    pub fn new(pool: sqlx::PgPool, config: Config, signer: QuoteSigner, gates: Gates) -> Self {
        Self {
            pool,
            config,
            signer,
            gates,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }
}
