//! Ledger and registry backed by the agent protocol contract.
//!
//! `settleAndLog` performs the EIP-3009 transfer, the attestation check and
//! the feedback append inside one transaction, so atomicity comes from the
//! EVM. Sends and receipts are bounded by `tx_timeout`; a timed-out send may
//! still mine, which is harmless because the token consumes the nonce.
//!
//! Failures are only diagnosed from token state once the call is known to
//! have had no effect. A broadcast whose receipt never arrived is reported as
//! unavailable with its hash, never as a replay of its own nonce.

use std::time::Duration;

use alloy::network::Ethereum;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{PendingTransactionBuilder, Provider};

use crate::error::{RegistryError, SettlementError};
use crate::ledger::Ledger;
use crate::registry::{AgentIdentity, IdentityRegistry, Service};
use crate::{ChainConfig, IAgentProtocol, PaymentBundle, IERC3009};

/// Default bound on `send()` and on waiting for a receipt.
pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(60);

/// Why a transaction did not confirm.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TxFailure {
    /// Rejected at gas estimation or mined with status 0. State is untouched.
    Reverted(String),
    /// Broadcast, but the outcome is unknown. It may still mine.
    Unconfirmed(String),
}

impl TxFailure {
    /// A send error is a revert only when the node says so; anything else
    /// (transport errors included) leaves the broadcast in doubt.
    fn from_send_error(message: String) -> Self {
        if message.contains("revert") {
            TxFailure::Reverted(message)
        } else {
            TxFailure::Unconfirmed(message)
        }
    }

    fn into_message(self) -> String {
        match self {
            TxFailure::Reverted(m) | TxFailure::Unconfirmed(m) => m,
        }
    }
}

pub struct OnchainLedger<P> {
    provider: P,
    contract: Address,
    config: ChainConfig,
    tx_timeout: Duration,
}

impl<P: Provider> OnchainLedger<P> {
    /// `provider` must carry a wallet for the write methods; read-only
    /// providers work for registry lookups.
    pub fn new(provider: P, contract: Address, config: ChainConfig) -> Self {
        Self {
            provider,
            contract,
            config,
            tx_timeout: DEFAULT_TX_TIMEOUT,
        }
    }

    pub fn with_tx_timeout(mut self, timeout: Duration) -> Self {
        self.tx_timeout = timeout;
        self
    }

    pub fn tx_timeout(&self) -> Duration {
        self.tx_timeout
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    async fn confirm(
        &self,
        pending: PendingTransactionBuilder<Ethereum>,
        what: &str,
    ) -> Result<B256, TxFailure> {
        let tx = *pending.tx_hash();
        let receipt = tokio::time::timeout(self.tx_timeout, pending.get_receipt())
            .await
            .map_err(|_| {
                TxFailure::Unconfirmed(format!(
                    "{what} {tx} receipt timed out after {:?}",
                    self.tx_timeout
                ))
            })?
            .map_err(|e| TxFailure::Unconfirmed(format!("{what} {tx} receipt failed: {e}")))?;

        if !receipt.status() {
            return Err(TxFailure::Reverted(format!("{what} {tx} reverted")));
        }
        Ok(receipt.transaction_hash)
    }

    /// Register an agent on-chain. The id is read by simulating the call
    /// first; returns `(agent_id, tx_hash)`.
    pub async fn register_agent(
        &self,
        owner: Address,
        metadata_uri: &str,
    ) -> Result<(U256, B256), RegistryError> {
        let contract = IAgentProtocol::new(self.contract, &self.provider);
        let call = contract.registerAgent(owner, metadata_uri.to_string());
        let agent_id = call
            .call()
            .await
            .map_err(|e| RegistryError::Unavailable(format!("registerAgent simulation failed: {e}")))?;

        let pending = tokio::time::timeout(self.tx_timeout, call.send())
            .await
            .map_err(|_| RegistryError::Unavailable("registerAgent send timed out".to_string()))?
            .map_err(|e| RegistryError::Unavailable(format!("registerAgent send failed: {e}")))?;
        let tx = self
            .confirm(pending, "registerAgent")
            .await
            .map_err(|f| RegistryError::Unavailable(f.into_message()))?;

        tracing::info!(agent_id = %agent_id, owner = %owner, tx = %tx, "agent registered on-chain");
        Ok((agent_id, tx))
    }

    /// `setWorkerAddress`; the contract rejects callers other than the owner.
    pub async fn set_worker_address(
        &self,
        agent_id: U256,
        worker: Address,
    ) -> Result<B256, RegistryError> {
        if worker == Address::ZERO {
            return Err(RegistryError::InvalidWorker);
        }
        let contract = IAgentProtocol::new(self.contract, &self.provider);
        let pending = tokio::time::timeout(
            self.tx_timeout,
            contract.setWorkerAddress(agent_id, worker).send(),
        )
        .await
        .map_err(|_| RegistryError::Unavailable("setWorkerAddress send timed out".to_string()))?
        .map_err(|e| registry_revert(e.to_string()))?;
        self.confirm(pending, "setWorkerAddress")
            .await
            .map_err(|f| RegistryError::Unavailable(f.into_message()))
    }

    /// `addService`; owner only.
    pub async fn add_service(
        &self,
        agent_id: U256,
        name: &str,
        price: U256,
    ) -> Result<B256, RegistryError> {
        let contract = IAgentProtocol::new(self.contract, &self.provider);
        let pending = tokio::time::timeout(
            self.tx_timeout,
            contract.addService(agent_id, name.to_string(), price).send(),
        )
        .await
        .map_err(|_| RegistryError::Unavailable("addService send timed out".to_string()))?
        .map_err(|e| registry_revert(e.to_string()))?;
        self.confirm(pending, "addService")
            .await
            .map_err(|f| RegistryError::Unavailable(f.into_message()))
    }

    /// Snapshot of an agent's registry entry, assembled from the contract's
    /// getters. `None` when `ownerOf` reverts: the agent was never minted.
    pub async fn agent(&self, agent_id: U256) -> Result<Option<AgentIdentity>, RegistryError> {
        let contract = IAgentProtocol::new(self.contract, &self.provider);
        let owner = match contract.ownerOf(agent_id).call().await {
            Ok(owner) => owner,
            Err(e) if e.to_string().contains("revert") => return Ok(None),
            Err(e) => return Err(RegistryError::Unavailable(format!("ownerOf failed: {e}"))),
        };
        let metadata_uri = contract
            .tokenURI(agent_id)
            .call()
            .await
            .map_err(|e| RegistryError::Unavailable(format!("tokenURI failed: {e}")))?;

        Ok(Some(AgentIdentity {
            agent_id,
            owner,
            worker: self.get_worker(agent_id).await?,
            metadata_uri,
            services: self.get_services(agent_id).await?,
            tx_count: self.get_tx_count(agent_id).await?,
        }))
    }

    /// Work out why `settleAndLog` failed. Reverts carry a reason string for
    /// the contract's own checks; bare reverts are diagnosed by reading the
    /// token state. An unconfirmed call is not diagnosed at all: reading
    /// token state then would see the call's own effects.
    async fn diagnose(&self, bundle: &PaymentBundle, failure: TxFailure) -> SettlementError {
        let (message, reverted) = match failure {
            TxFailure::Reverted(message) => (message, true),
            TxFailure::Unconfirmed(message) => (message, false),
        };
        if let Some(e) = classify_revert(&message, bundle) {
            return e;
        }
        if !reverted {
            tracing::warn!(agent_id = %bundle.agent_id, error = %message, "settleAndLog outcome unknown");
            return SettlementError::LedgerUnavailable(message);
        }

        let auth = &bundle.authorization;
        let token = IERC3009::new(self.config.token, &self.provider);
        if let Ok(true) = token.authorizationState(auth.payer, auth.nonce).call().await {
            return SettlementError::NonceReplay;
        }
        if let Ok(balance) = token.balanceOf(auth.payer).call().await {
            if balance < auth.amount {
                return SettlementError::InsufficientBalance {
                    payer: auth.payer,
                    required: auth.amount,
                };
            }
        }
        SettlementError::LedgerUnavailable(message)
    }
}

/// Map a contract revert reason onto the settlement taxonomy.
fn classify_revert(message: &str, bundle: &PaymentBundle) -> Option<SettlementError> {
    if message.contains("Agent worker not set") {
        Some(SettlementError::AgentNotConfigured(bundle.agent_id))
    } else if message.contains("Invalid score") {
        Some(SettlementError::InvalidScore(bundle.score))
    } else if message.contains("authorization is used") {
        Some(SettlementError::NonceReplay)
    } else if message.contains("authorization is expired")
        || message.contains("authorization is not yet valid")
    {
        Some(SettlementError::AuthorizationExpired)
    } else if message.contains("invalid signature") {
        Some(SettlementError::InvalidPaymentSignature)
    } else {
        None
    }
}

fn registry_revert(message: String) -> RegistryError {
    if message.contains("Caller is not the agent owner") {
        // The contract does not tell us who the caller was.
        RegistryError::NotAgentOwner(Address::ZERO)
    } else {
        RegistryError::Unavailable(message)
    }
}

impl<P: Provider> Ledger for OnchainLedger<P> {
    async fn settle_and_log(
        &self,
        bundle: &PaymentBundle,
        worker: Address,
    ) -> Result<B256, SettlementError> {
        let auth = &bundle.authorization;
        let pay_data = IAgentProtocol::PayData {
            payer: auth.payer,
            amount: auth.amount,
            paymentNonce: auth.nonce,
            validAfter: U256::from(auth.valid_after),
            validBefore: U256::from(auth.valid_before),
            v: auth.signature.v,
            r: auth.signature.r,
            s: auth.signature.s,
        };

        let contract = IAgentProtocol::new(self.contract, &self.provider);
        let call = contract.settleAndLog(
            pay_data,
            bundle.agent_id,
            bundle.score,
            bundle.rep_signature.clone(),
            bundle.service_tag,
            bundle.file_uri.clone(),
        );

        let pending = match tokio::time::timeout(self.tx_timeout, call.send()).await {
            Err(_) => {
                return Err(SettlementError::LedgerUnavailable(format!(
                    "settleAndLog send timed out after {:?}",
                    self.tx_timeout
                )))
            }
            Ok(Err(e)) => {
                return Err(self
                    .diagnose(bundle, TxFailure::from_send_error(e.to_string()))
                    .await)
            }
            Ok(Ok(pending)) => pending,
        };

        match self.confirm(pending, "settleAndLog").await {
            Ok(tx) => {
                tracing::info!(
                    agent_id = %bundle.agent_id,
                    worker = %worker,
                    tx = %tx,
                    url = %self.config.tx_url(&tx),
                    "settleAndLog confirmed"
                );
                Ok(tx)
            }
            Err(failure) => Err(self.diagnose(bundle, failure).await),
        }
    }

    async fn is_nonce_consumed(&self, payer: Address, nonce: B256) -> Result<bool, SettlementError> {
        IERC3009::new(self.config.token, &self.provider)
            .authorizationState(payer, nonce)
            .call()
            .await
            .map_err(|e| SettlementError::LedgerUnavailable(format!("authorizationState failed: {e}")))
    }

    async fn balance_of(&self, account: Address) -> Result<U256, SettlementError> {
        IERC3009::new(self.config.token, &self.provider)
            .balanceOf(account)
            .call()
            .await
            .map_err(|e| SettlementError::LedgerUnavailable(format!("balanceOf failed: {e}")))
    }
}

impl<P: Provider> IdentityRegistry for OnchainLedger<P> {
    async fn get_worker(&self, agent_id: U256) -> Result<Option<Address>, RegistryError> {
        let worker = IAgentProtocol::new(self.contract, &self.provider)
            .agentWorkers(agent_id)
            .call()
            .await
            .map_err(|e| RegistryError::Unavailable(format!("agentWorkers failed: {e}")))?;
        Ok((worker != Address::ZERO).then_some(worker))
    }

    async fn get_services(&self, agent_id: U256) -> Result<Vec<Service>, RegistryError> {
        let services = IAgentProtocol::new(self.contract, &self.provider)
            .getServices(agent_id)
            .call()
            .await
            .map_err(|e| RegistryError::Unavailable(format!("getServices failed: {e}")))?;
        Ok(services
            .into_iter()
            .map(|s| Service {
                name: s.name,
                price: s.price,
                active: s.active,
            })
            .collect())
    }

    async fn get_tx_count(&self, agent_id: U256) -> Result<u64, RegistryError> {
        let count = IAgentProtocol::new(self.contract, &self.provider)
            .agentTxCount(agent_id)
            .call()
            .await
            .map_err(|e| RegistryError::Unavailable(format!("agentTxCount failed: {e}")))?;
        u64::try_from(count)
            .map_err(|_| RegistryError::Unavailable(format!("tx count {count} exceeds u64")))
    }
}
