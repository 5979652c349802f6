//! Signed quote envelopes.
//!
//! A quote binds a price and share quantity to the market state it was
//! computed from. The envelope is stateless: HMAC-SHA-256 over the canonical
//! serialization of every field except the signature itself, keyed by a
//! process-wide secret loaded once at startup. Execution re-verifies the
//! signature, the TTL, and (in `trading`) recomputes the price to catch
//! drift.

use crate::error::{CoreError, CoreResult};
use crate::lmsr::{Outcome, QuoteComputation, TradeSide};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TTL_SECONDS: i64 = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteEnvelope {
    pub market_id: i64,
    pub outcome: Outcome,
    pub side: TradeSide,
    pub shares: Decimal,
    pub start_price: Decimal,
    pub end_price: Decimal,
    pub avg_price: Decimal,
    pub cost_minor: i64,
    pub max_cost_minor: i64,
    pub issued_at: DateTime<Utc>,
    pub ttl_seconds: i64,
    pub nonce: String,
    pub signature: String,
}

impl QuoteEnvelope {
    /// Canonical wire form: sorted key=value pairs joined by '&', signature
    /// excluded. Decimals are normalized so trailing zeros cannot produce a
    /// second valid serialization of the same quote.
    fn canonical_string(&self) -> String {
        let pairs = [
            ("avg_price", self.avg_price.normalize().to_string()),
            ("cost_minor", self.cost_minor.to_string()),
            ("end_price", self.end_price.normalize().to_string()),
            ("issued_at", self.issued_at.timestamp().to_string()),
            ("market_id", self.market_id.to_string()),
            ("max_cost_minor", self.max_cost_minor.to_string()),
            ("nonce", self.nonce.clone()),
            ("outcome", self.outcome.as_str().to_string()),
            ("shares", self.shares.normalize().to_string()),
            ("side", self.side.as_str().to_string()),
            ("start_price", self.start_price.normalize().to_string()),
            ("ttl_seconds", self.ttl_seconds.to_string()),
        ];
        pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at + Duration::seconds(self.ttl_seconds)
    }
}

/// Holds the HMAC key. Read-only after construction.
pub struct QuoteSigner {
    key: Vec<u8>,
}

impl QuoteSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    /// Load the signing secret from QUOTE_SIGNING_SECRET.
    pub fn from_env() -> CoreResult<Self> {
        let secret = std::env::var("QUOTE_SIGNING_SECRET")
            .map_err(|_| CoreError::Domain("QUOTE_SIGNING_SECRET is not set".to_string()))?;
        if secret.len() < 32 {
            return Err(CoreError::Domain(
                "QUOTE_SIGNING_SECRET must be at least 32 bytes".to_string(),
            ));
        }
        Ok(Self::new(secret))
    }

    fn digest(&self, envelope: &QuoteEnvelope) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(envelope.canonical_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Wrap an LMSR quote computation into a signed envelope.
    pub fn issue(
        &self,
        market_id: i64,
        computation: &QuoteComputation,
        ttl_seconds: i64,
        tolerance_minor: i64,
        now: DateTime<Utc>,
    ) -> QuoteEnvelope {
        let mut envelope = QuoteEnvelope {
            market_id,
            outcome: computation.outcome,
            side: computation.side,
            shares: computation.shares,
            start_price: computation.start_price,
            end_price: computation.end_price,
            avg_price: computation.avg_price,
            cost_minor: computation.cost_minor,
            max_cost_minor: computation.cost_minor + tolerance_minor,
            issued_at: now,
            ttl_seconds,
            nonce: Uuid::new_v4().to_string(),
            signature: String::new(),
        };
        envelope.signature = self.digest(&envelope);
        envelope
    }

    /// Check signature and freshness. Signature first: an expired forgery is
    /// still a forgery.
    pub fn verify(&self, envelope: &QuoteEnvelope, now: DateTime<Utc>) -> CoreResult<()> {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(envelope.canonical_string().as_bytes());
        let provided =
            hex::decode(&envelope.signature).map_err(|_| CoreError::QuoteSignatureInvalid)?;
        mac.verify_slice(&provided)
            .map_err(|_| CoreError::QuoteSignatureInvalid)?;

        if now > envelope.expires_at() {
            return Err(CoreError::QuoteExpired);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::lmsr::{self, LmsrState};
    use rust_decimal_macros::dec;

    fn signer() -> QuoteSigner {
        QuoteSigner::new("test-secret-key-of-sufficient-length")
    }

    fn sample_envelope(signer: &QuoteSigner, now: DateTime<Utc>) -> QuoteEnvelope {
        let config = Config::default();
        let state = LmsrState::new(Decimal::from(100));
        let computation = lmsr::buy_quote(&config, &state, Outcome::Yes, dec!(10)).unwrap();
        signer.issue(
            7,
            &computation,
            DEFAULT_TTL_SECONDS,
            config.slippage_tolerance_minor(computation.cost_minor),
            now,
        )
    }

    #[test]
    fn issue_then_verify_round_trips() {
        let signer = signer();
        let now = Utc::now();
        let envelope = sample_envelope(&signer, now);
        assert!(signer.verify(&envelope, now).is_ok());
        assert_eq!(envelope.cost_minor, 512);
        assert_eq!(envelope.max_cost_minor, 512 + 5);
    }

    #[test]
    fn tampered_fields_invalidate_the_signature() {
        let signer = signer();
        let now = Utc::now();

        let mut envelope = sample_envelope(&signer, now);
        envelope.cost_minor -= 100;
        assert!(matches!(
            signer.verify(&envelope, now),
            Err(CoreError::QuoteSignatureInvalid)
        ));

        let mut envelope = sample_envelope(&signer, now);
        envelope.shares = dec!(10000);
        assert!(matches!(
            signer.verify(&envelope, now),
            Err(CoreError::QuoteSignatureInvalid)
        ));

        let mut envelope = sample_envelope(&signer, now);
        envelope.outcome = Outcome::No;
        assert!(matches!(
            signer.verify(&envelope, now),
            Err(CoreError::QuoteSignatureInvalid)
        ));

        let mut envelope = sample_envelope(&signer, now);
        envelope.signature = "zz not hex".to_string();
        assert!(matches!(
            signer.verify(&envelope, now),
            Err(CoreError::QuoteSignatureInvalid)
        ));
    }

    #[test]
    fn different_key_rejects() {
        let now = Utc::now();
        let envelope = sample_envelope(&signer(), now);
        let other = QuoteSigner::new("another-secret-key-of-sufficient-len");
        assert!(matches!(
            other.verify(&envelope, now),
            Err(CoreError::QuoteSignatureInvalid)
        ));
    }

    #[test]
    fn quotes_expire_after_ttl() {
        let signer = signer();
        let now = Utc::now();
        let envelope = sample_envelope(&signer, now);

        let just_inside = now + Duration::seconds(DEFAULT_TTL_SECONDS);
        assert!(signer.verify(&envelope, just_inside).is_ok());

        let just_past = now + Duration::seconds(DEFAULT_TTL_SECONDS + 1);
        assert!(matches!(
            signer.verify(&envelope, just_past),
            Err(CoreError::QuoteExpired)
        ));
    }

    #[test]
    fn nonces_differ_between_issues() {
        let signer = signer();
        let now = Utc::now();
        let first = sample_envelope(&signer, now);
        let second = sample_envelope(&signer, now);
        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.signature, second.signature);
    }
}
