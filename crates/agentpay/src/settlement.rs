//! Settlement state machine.
//!
//! ```text
//! Received -> Validated -> Transferred -> Logged -> Committed
//!     \            \
//!      `------------`-----> Rejected(reason)
//! ```
//!
//! Everything up to `Validated` is read-only. `Transferred` and `Logged` are
//! never observable on their own: they happen inside one
//! [`Ledger::settle_and_log`] call, so a failure anywhere leaves no trace.

use std::sync::Arc;

use alloy::primitives::Address;
use alloy::sol_types::Eip712Domain;

use crate::eip712::payment_domain;
use crate::error::SettlementError;
use crate::ledger::Ledger;
use crate::registry::IdentityRegistry;
use crate::verifier::{Secp256k1Verifier, SignatureVerifier};
use crate::{ChainConfig, PaymentBundle, SettlementReceipt, MAX_SCORE};

/// Verifies a [`PaymentBundle`] and commits it through a [`Ledger`].
pub struct SettlementEngine<R, L, V = Secp256k1Verifier> {
    registry: Arc<R>,
    ledger: Arc<L>,
    verifier: V,
    config: ChainConfig,
    domain: Eip712Domain,
}

impl<R, L> SettlementEngine<R, L, Secp256k1Verifier>
where
    R: IdentityRegistry,
    L: Ledger,
{
    pub fn new(registry: Arc<R>, ledger: Arc<L>, config: ChainConfig) -> Self {
        Self::with_verifier(registry, ledger, Secp256k1Verifier, config)
    }
}

impl<R, L, V> SettlementEngine<R, L, V>
where
    R: IdentityRegistry,
    L: Ledger,
    V: SignatureVerifier,
{
    pub fn with_verifier(registry: Arc<R>, ledger: Arc<L>, verifier: V, config: ChainConfig) -> Self {
        let domain = payment_domain(&config);
        Self {
            registry,
            ledger,
            verifier,
            config,
            domain,
        }
    }

    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// Settle against the system clock.
    pub async fn settle(&self, bundle: &PaymentBundle) -> Result<SettlementReceipt, SettlementError> {
        self.settle_at(bundle, unix_now()?).await
    }

    /// Settle as if the current time were `now` (unix seconds).
    pub async fn settle_at(
        &self,
        bundle: &PaymentBundle,
        now: u64,
    ) -> Result<SettlementReceipt, SettlementError> {
        let auth = &bundle.authorization;
        tracing::debug!(
            agent_id = %bundle.agent_id,
            payer = %auth.payer,
            nonce = %format!("{:.8}", auth.nonce),
            "settlement received"
        );

        let worker = match self.validate(bundle, now).await {
            Ok(worker) => worker,
            Err(e) => {
                tracing::warn!(
                    agent_id = %bundle.agent_id,
                    payer = %auth.payer,
                    nonce = %format!("{:.8}", auth.nonce),
                    reason = e.reason(),
                    "settlement rejected"
                );
                return Err(e);
            }
        };

        let handle = match self.ledger.settle_and_log(bundle, worker).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(
                    agent_id = %bundle.agent_id,
                    payer = %auth.payer,
                    nonce = %format!("{:.8}", auth.nonce),
                    reason = e.reason(),
                    error = %e,
                    "settlement commit failed"
                );
                return Err(e);
            }
        };

        tracing::info!(
            agent_id = %bundle.agent_id,
            payer = %auth.payer,
            worker = %worker,
            amount = %auth.amount,
            score = bundle.score,
            nonce = %format!("{:.8}", auth.nonce),
            handle = %handle,
            "settlement committed"
        );

        Ok(SettlementReceipt {
            handle,
            agent_id: bundle.agent_id,
            payer: auth.payer,
            amount: auth.amount,
            timestamp: now,
        })
    }

    /// Run every check short of committing. Returns the worker address the
    /// payment is bound to.
    ///
    /// Checks run cheapest first, so an unconfigured agent is reported before
    /// any signature is recovered.
    pub async fn validate(
        &self,
        bundle: &PaymentBundle,
        now: u64,
    ) -> Result<Address, SettlementError> {
        let auth = &bundle.authorization;

        let worker = self
            .registry
            .get_worker(bundle.agent_id)
            .await
            .map_err(|e| SettlementError::LedgerUnavailable(e.to_string()))?
            .filter(|w| *w != Address::ZERO)
            .ok_or(SettlementError::AgentNotConfigured(bundle.agent_id))?;

        // Zero-width and inverted windows can never be satisfied.
        if auth.valid_after >= auth.valid_before
            || now < auth.valid_after
            || now > auth.valid_before
        {
            return Err(SettlementError::AuthorizationExpired);
        }

        if bundle.score > MAX_SCORE {
            return Err(SettlementError::InvalidScore(bundle.score));
        }

        if auth.amount.is_zero() && !self.config.allow_free_attestations {
            return Err(SettlementError::InvalidAmount);
        }

        if auth.payer == Address::ZERO {
            return Err(SettlementError::InvalidPaymentSignature);
        }
        let record = auth.typed_for(worker);
        let signer = self
            .verifier
            .verify_structured(&record, &self.domain, &auth.signature)
            .map_err(|e| {
                tracing::debug!(error = %e, "payment signature recovery failed");
                SettlementError::InvalidPaymentSignature
            })?;
        if signer != auth.payer {
            return Err(SettlementError::InvalidPaymentSignature);
        }

        let attestation = bundle.attestation();
        let attester = self
            .verifier
            .verify_digest(&attestation.digest(), &attestation.signature)
            .map_err(|e| {
                tracing::debug!(error = %e, "attestation signature recovery failed");
                SettlementError::InvalidAttestationSignature
            })?;
        if attester != worker {
            return Err(SettlementError::InvalidAttestationSignature);
        }

        // Fast path only; the ledger re-checks inside the commit.
        if self.ledger.is_nonce_consumed(auth.payer, auth.nonce).await? {
            return Err(SettlementError::NonceReplay);
        }

        tracing::debug!(
            agent_id = %bundle.agent_id,
            payer = %auth.payer,
            worker = %worker,
            "settlement validated"
        );
        Ok(worker)
    }
}

fn unix_now() -> Result<u64, SettlementError> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| SettlementError::InternalInvariantViolation(format!("system time error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{build_bundle, BundleRequest};
    use crate::InMemoryLedger;
    use alloy::primitives::U256;
    use alloy::signers::local::PrivateKeySigner;

    struct Fixture {
        ledger: Arc<InMemoryLedger>,
        engine: SettlementEngine<InMemoryLedger, InMemoryLedger>,
        agent_id: U256,
        payer: PrivateKeySigner,
        worker: PrivateKeySigner,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let owner = PrivateKeySigner::random();
        let worker = PrivateKeySigner::random();
        let payer = PrivateKeySigner::random();
        let agent_id = ledger.register_agent(owner.address(), "");
        ledger
            .set_worker(agent_id, owner.address(), worker.address())
            .unwrap();
        ledger.mint(payer.address(), U256::from(1_000u64));
        let engine = SettlementEngine::new(ledger.clone(), ledger.clone(), ChainConfig::default());
        Fixture {
            ledger,
            engine,
            agent_id,
            payer,
            worker,
        }
    }

    fn request(agent_id: U256, amount: u64) -> BundleRequest {
        BundleRequest::new(agent_id, U256::from(amount), 95, "weather").valid_between(100, 200)
    }

    #[tokio::test]
    async fn test_zero_amount_rejected_by_default() {
        let f = fixture();
        let bundle = build_bundle(
            &f.payer,
            &f.worker,
            f.engine.config(),
            &request(f.agent_id, 0),
        )
        .unwrap();
        assert_eq!(
            f.engine.settle_at(&bundle, 150).await,
            Err(SettlementError::InvalidAmount)
        );
    }

    #[tokio::test]
    async fn test_zero_amount_allowed_as_free_attestation() {
        let f = fixture();
        let config = ChainConfig {
            allow_free_attestations: true,
            ..ChainConfig::default()
        };
        let engine = SettlementEngine::new(f.ledger.clone(), f.ledger.clone(), config);
        let bundle =
            build_bundle(&f.payer, &f.worker, engine.config(), &request(f.agent_id, 0)).unwrap();

        let receipt = engine.settle_at(&bundle, 150).await.unwrap();
        assert_eq!(receipt.amount, U256::ZERO);
        assert_eq!(f.ledger.get_tx_count(f.agent_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_window_edges_inclusive() {
        let f = fixture();
        let first = build_bundle(
            &f.payer,
            &f.worker,
            f.engine.config(),
            &request(f.agent_id, 10),
        )
        .unwrap();
        assert!(f.engine.settle_at(&first, 100).await.is_ok());

        let second = build_bundle(
            &f.payer,
            &f.worker,
            f.engine.config(),
            &request(f.agent_id, 10),
        )
        .unwrap();
        assert!(f.engine.settle_at(&second, 200).await.is_ok());

        let third = build_bundle(
            &f.payer,
            &f.worker,
            f.engine.config(),
            &request(f.agent_id, 10),
        )
        .unwrap();
        assert_eq!(
            f.engine.settle_at(&third, 201).await,
            Err(SettlementError::AuthorizationExpired)
        );
        assert_eq!(
            f.engine.settle_at(&third, 99).await,
            Err(SettlementError::AuthorizationExpired)
        );
    }

    #[tokio::test]
    async fn test_validate_does_not_mutate() {
        let f = fixture();
        let bundle = build_bundle(
            &f.payer,
            &f.worker,
            f.engine.config(),
            &request(f.agent_id, 100),
        )
        .unwrap();

        let worker = f.engine.validate(&bundle, 150).await.unwrap();
        assert_eq!(worker, f.worker.address());
        assert_eq!(
            f.ledger.balance_of(f.payer.address()).await.unwrap(),
            U256::from(1_000u64)
        );
        assert_eq!(f.ledger.get_tx_count(f.agent_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_receipt_carries_now() {
        let f = fixture();
        let bundle = build_bundle(
            &f.payer,
            &f.worker,
            f.engine.config(),
            &request(f.agent_id, 100),
        )
        .unwrap();
        let receipt = f.engine.settle_at(&bundle, 150).await.unwrap();
        assert_eq!(receipt.timestamp, 150);
        assert_eq!(receipt.payer, f.payer.address());
        assert_eq!(receipt.agent_id, f.agent_id);
    }
}
