//! Outbound collaborator interfaces.
//!
//! Identity, AML, responsible-gambling and payment-provider rules live
//! outside the core; the core consults them as yes/no gates and never
//! interprets their policies. Calls are bounded to five seconds with no
//! retry; an AML timeout degrades to a conservative REVIEW.

use crate::error::CoreResult;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const GATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateDecision {
    Allow,
    Deny { reason: String },
}

impl GateDecision {
    pub fn deny(reason: impl Into<String>) -> Self {
        GateDecision::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AmlVerdict {
    Approve,
    Review,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmlAssessment {
    pub verdict: AmlVerdict,
    pub risk_score: f64,
    pub reasons: Vec<String>,
}

impl AmlAssessment {
    pub fn approve() -> Self {
        Self {
            verdict: AmlVerdict::Approve,
            risk_score: 0.0,
            reasons: Vec::new(),
        }
    }

    /// The degraded verdict used when the monitor cannot be reached in time.
    pub fn review_timeout() -> Self {
        Self {
            verdict: AmlVerdict::Review,
            risk_score: 0.0,
            reasons: vec!["aml monitor timed out".to_string()],
        }
    }
}

#[async_trait]
pub trait KycGate: Send + Sync {
    async fn deposit_eligible(&self, user_id: i64, amount_minor: i64) -> GateDecision;
    async fn withdraw_eligible(&self, user_id: i64, amount_minor: i64) -> GateDecision;
}

#[async_trait]
pub trait AmlMonitor: Send + Sync {
    async fn monitor_deposit(&self, user_id: i64, amount_minor: i64) -> AmlAssessment;
    async fn monitor_trade(&self, user_id: i64, market_id: i64, cost_minor: i64) -> AmlAssessment;
    async fn monitor_withdrawal(&self, user_id: i64, amount_minor: i64) -> AmlAssessment;
}

#[async_trait]
pub trait RgGate: Send + Sync {
    async fn validate_action(&self, user_id: i64, action: &str) -> GateDecision;
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_intent(&self, user_id: i64, amount_minor: i64) -> CoreResult<String>;
    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool;
    async fn initiate_payout(
        &self,
        user_id: i64,
        amount_minor: i64,
        reference: &str,
    ) -> CoreResult<String>;
}

/// Bound an AML call to GATE_TIMEOUT, degrading to REVIEW on expiry.
pub async fn monitor_with_timeout<F>(call: F) -> AmlAssessment
where
    F: Future<Output = AmlAssessment>,
{
    match tokio::time::timeout(GATE_TIMEOUT, call).await {
        Ok(assessment) => assessment,
        Err(_) => {
            tracing::warn!("aml monitor call timed out, degrading to REVIEW");
            AmlAssessment::review_timeout()
        }
    }
}

/// Bound a decision-gate call to GATE_TIMEOUT. Eligibility gates have no
/// flagged middle ground, so expiry denies.
pub async fn decide_with_timeout<F>(call: F) -> GateDecision
where
    F: Future<Output = GateDecision>,
{
    match tokio::time::timeout(GATE_TIMEOUT, call).await {
        Ok(decision) => decision,
        Err(_) => {
            tracing::warn!("eligibility gate call timed out, denying");
            GateDecision::deny("eligibility check timed out")
        }
    }
}

// --- observer ---

#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub trade_id: i64,
    pub txn_id: Uuid,
    pub user_id: i64,
    pub market_id: i64,
    pub outcome: &'static str,
    pub side: &'static str,
    pub shares: Decimal,
    pub cost_minor: i64,
    pub fee_minor: i64,
}

#[derive(Debug, Clone)]
pub struct SettlementEvent {
    pub market_id: i64,
    pub user_id: i64,
    pub gross_minor: i64,
    pub fee_minor: i64,
    pub net_minor: i64,
}

#[derive(Debug, Clone)]
pub struct LedgerPostEvent {
    pub txn_id: Uuid,
    pub entry_count: usize,
}

/// High-severity alert: an accounting invariant failed and the named
/// market (if any) has been blocked.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub market_id: Option<i64>,
    pub message: String,
}

/// Narrow telemetry seam. Emission happens at commit boundaries only; the
/// core is otherwise silent. `on_alert` fires for solvency violations and
/// broken internal invariants, never for ordinary operation failures.
pub trait Observer: Send + Sync {
    fn on_trade(&self, _event: &TradeEvent) {}
    fn on_settlement(&self, _event: &SettlementEvent) {}
    fn on_ledger_post(&self, _event: &LedgerPostEvent) {}
    fn on_alert(&self, _event: &AlertEvent) {}
}

pub struct NoopObserver;

impl Observer for NoopObserver {}

/// The collaborator bundle handed to the exchange at construction.
#[derive(Clone)]
pub struct Gates {
    pub kyc: Arc<dyn KycGate>,
    pub aml: Arc<dyn AmlMonitor>,
    pub rg: Arc<dyn RgGate>,
    pub payments: Arc<dyn PaymentProvider>,
}

impl Gates {
    /// Allow-everything gates for tests and local development.
    pub fn permissive() -> Self {
        let permissive = Arc::new(Permissive);
        Self {
            kyc: permissive.clone(),
            aml: permissive.clone(),
            rg: permissive.clone(),
            payments: permissive,
        }
    }
}

/// Approves every request; the payment provider arm fabricates references
/// and accepts every webhook signature.
pub struct Permissive;

#[async_trait]
impl KycGate for Permissive {
    async fn deposit_eligible(&self, _user_id: i64, _amount_minor: i64) -> GateDecision {
        GateDecision::Allow
    }

    async fn withdraw_eligible(&self, _user_id: i64, _amount_minor: i64) -> GateDecision {
        GateDecision::Allow
    }
}

#[async_trait]
impl AmlMonitor for Permissive {
    async fn monitor_deposit(&self, _user_id: i64, _amount_minor: i64) -> AmlAssessment {
        AmlAssessment::approve()
    }

    async fn monitor_trade(
        &self,
        _user_id: i64,
        _market_id: i64,
        _cost_minor: i64,
    ) -> AmlAssessment {
        AmlAssessment::approve()
    }

    async fn monitor_withdrawal(&self, _user_id: i64, _amount_minor: i64) -> AmlAssessment {
        AmlAssessment::approve()
    }
}

#[async_trait]
impl RgGate for Permissive {
    async fn validate_action(&self, _user_id: i64, _action: &str) -> GateDecision {
        GateDecision::Allow
    }
}

#[async_trait]
impl PaymentProvider for Permissive {
    async fn create_intent(&self, user_id: i64, amount_minor: i64) -> CoreResult<String> {
        Ok(format!("intent-{user_id}-{amount_minor}"))
    }

    fn verify_webhook_signature(&self, _payload: &[u8], _signature: &str) -> bool {
        true
    }

    async fn initiate_payout(
        &self,
        _user_id: i64,
        _amount_minor: i64,
        reference: &str,
    ) -> CoreResult<String> {
        Ok(format!("payout-{reference}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_degrades_to_review() {
        let assessment = monitor_with_timeout(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            AmlAssessment::approve()
        });
        // Shrink the wait by racing a short timer in test time.
        tokio::time::pause();
        let handle = tokio::spawn(assessment);
        tokio::time::advance(Duration::from_secs(6)).await;
        let result = handle.await.unwrap();
        assert_eq!(result.verdict, AmlVerdict::Review);
        assert!(!result.reasons.is_empty());
    }

    #[tokio::test]
    async fn permissive_gates_allow() {
        let gates = Gates::permissive();
        assert!(gates.kyc.deposit_eligible(1, 100).await.is_allowed());
        assert!(gates.rg.validate_action(1, "trade").await.is_allowed());
        assert_eq!(
            gates.aml.monitor_trade(1, 1, 100).await.verdict,
            AmlVerdict::Approve
        );
        assert!(gates.payments.verify_webhook_signature(b"x", "sig"));
    }
}
