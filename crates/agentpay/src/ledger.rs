//! Ledger capability and the in-memory implementation.
//!
//! A ledger owns balances, consumed nonces, the reputation log and agent
//! transaction counters. [`Ledger::settle_and_log`] is the only mutation the
//! settlement engine performs and must be all-or-nothing.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use alloy::primitives::{keccak256, Address, B256, U256};

use crate::error::{RegistryError, SettlementError};
use crate::registry::{AgentIdentity, AgentTable, FeedbackEntry, IdentityRegistry, Service};
use crate::PaymentBundle;

/// Atomic settlement backend.
pub trait Ledger: Send + Sync {
    /// Move `amount` from the payer to `worker`, consume `(payer, nonce)`,
    /// append the feedback entry and bump the agent's transaction count, as
    /// one indivisible step. Returns the settlement handle (a transaction
    /// hash for on-chain ledgers).
    ///
    /// Implementations must re-check the nonce as part of the commit; a nonce
    /// consumed between the engine's fast-path read and this call fails with
    /// [`SettlementError::NonceReplay`] and nothing is written.
    fn settle_and_log(
        &self,
        bundle: &PaymentBundle,
        worker: Address,
    ) -> impl Future<Output = Result<B256, SettlementError>> + Send;

    /// Whether `(payer, nonce)` has already been consumed.
    fn is_nonce_consumed(
        &self,
        payer: Address,
        nonce: B256,
    ) -> impl Future<Output = Result<bool, SettlementError>> + Send;

    /// Current token balance of `account`.
    fn balance_of(
        &self,
        account: Address,
    ) -> impl Future<Output = Result<U256, SettlementError>> + Send;
}

#[derive(Debug, Default)]
struct LedgerState {
    agents: AgentTable,
    balances: HashMap<Address, U256>,
    consumed: HashSet<(Address, B256)>,
    feedback: HashMap<U256, Vec<FeedbackEntry>>,
    sequence: u64,
}

/// Process-local ledger. Every commit runs inside one critical section over
/// all state. Lost on restart; see `SqliteLedger` for persistence.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("ledger mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Credit `account` out of thin air. Test and demo funding only.
    pub fn mint(&self, account: Address, amount: U256) {
        let mut state = self.lock();
        let balance = state.balances.entry(account).or_default();
        *balance = balance.saturating_add(amount);
    }

    /// Register a new agent owned by `owner`; returns its id.
    pub fn register_agent(&self, owner: Address, metadata_uri: &str) -> U256 {
        let agent_id = self.lock().agents.register(owner, metadata_uri);
        tracing::info!(agent_id = %agent_id, owner = %owner, "agent registered");
        agent_id
    }

    /// Delegate payments and attestations for `agent_id` to `worker`. Owner only.
    pub fn set_worker(
        &self,
        agent_id: U256,
        caller: Address,
        worker: Address,
    ) -> Result<(), RegistryError> {
        self.lock().agents.set_worker(agent_id, caller, worker)?;
        tracing::info!(agent_id = %agent_id, worker = %worker, "worker address set");
        Ok(())
    }

    /// Append a service to the agent's catalogue. Owner only. Returns its index.
    pub fn add_service(
        &self,
        agent_id: U256,
        caller: Address,
        name: &str,
        price: U256,
    ) -> Result<usize, RegistryError> {
        self.lock().agents.add_service(agent_id, caller, name, price)
    }

    /// Toggle a service on or off. Owner only.
    pub fn set_service_active(
        &self,
        agent_id: U256,
        caller: Address,
        index: usize,
        active: bool,
    ) -> Result<(), RegistryError> {
        self.lock()
            .agents
            .set_service_active(agent_id, caller, index, active)
    }

    /// Snapshot of an agent's registry entry.
    pub fn agent(&self, agent_id: U256) -> Option<AgentIdentity> {
        self.lock().agents.get(agent_id).cloned()
    }

    /// The agent's reputation log, oldest first.
    pub fn feedback(&self, agent_id: U256) -> Vec<FeedbackEntry> {
        self.lock()
            .feedback
            .get(&agent_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Ledger for InMemoryLedger {
    async fn settle_and_log(
        &self,
        bundle: &PaymentBundle,
        worker: Address,
    ) -> Result<B256, SettlementError> {
        let auth = &bundle.authorization;
        let mut state = self.lock();

        // The worker may have been rotated since the engine resolved it.
        let current = state.agents.get(bundle.agent_id).and_then(|a| a.worker);
        if current != Some(worker) {
            return Err(SettlementError::InvalidAttestationSignature);
        }

        if state.consumed.contains(&(auth.payer, auth.nonce)) {
            return Err(SettlementError::NonceReplay);
        }

        let payer_balance = state.balances.get(&auth.payer).copied().unwrap_or_default();
        let debited = payer_balance
            .checked_sub(auth.amount)
            .ok_or(SettlementError::InsufficientBalance {
                payer: auth.payer,
                required: auth.amount,
            })?;

        // Compute every new value before writing any of them.
        let credited = if worker == auth.payer {
            payer_balance
        } else {
            state
                .balances
                .get(&worker)
                .copied()
                .unwrap_or_default()
                .checked_add(auth.amount)
                .ok_or_else(|| {
                    SettlementError::InternalInvariantViolation("worker balance overflow".into())
                })?
        };
        let tx_count = state
            .agents
            .get(bundle.agent_id)
            .map(|a| a.tx_count)
            .unwrap_or_default()
            .checked_add(1)
            .ok_or_else(|| {
                SettlementError::InternalInvariantViolation("tx count overflow".into())
            })?;
        let sequence = state.sequence.checked_add(1).ok_or_else(|| {
            SettlementError::InternalInvariantViolation("sequence overflow".into())
        })?;

        if worker == auth.payer {
            state.balances.insert(auth.payer, credited);
        } else {
            state.balances.insert(auth.payer, debited);
            state.balances.insert(worker, credited);
        }
        state.consumed.insert((auth.payer, auth.nonce));
        state
            .feedback
            .entry(bundle.agent_id)
            .or_default()
            .push(FeedbackEntry {
                payer: auth.payer,
                score: bundle.score,
                service_tag: bundle.service_tag,
                file_uri: bundle.file_uri.clone(),
                payment_nonce: auth.nonce,
            });
        if let Some(agent) = state.agents.get_mut(bundle.agent_id) {
            agent.tx_count = tx_count;
        }
        state.sequence = sequence;

        let mut preimage = Vec::with_capacity(20 + 32 + 8);
        preimage.extend_from_slice(auth.payer.as_slice());
        preimage.extend_from_slice(auth.nonce.as_slice());
        preimage.extend_from_slice(&sequence.to_be_bytes());
        Ok(keccak256(preimage))
    }

    async fn is_nonce_consumed(&self, payer: Address, nonce: B256) -> Result<bool, SettlementError> {
        Ok(self.lock().consumed.contains(&(payer, nonce)))
    }

    async fn balance_of(&self, account: Address) -> Result<U256, SettlementError> {
        Ok(self.lock().balances.get(&account).copied().unwrap_or_default())
    }
}

impl IdentityRegistry for InMemoryLedger {
    async fn get_worker(&self, agent_id: U256) -> Result<Option<Address>, RegistryError> {
        Ok(self.lock().agents.get(agent_id).and_then(|a| a.worker))
    }

    async fn get_services(&self, agent_id: U256) -> Result<Vec<Service>, RegistryError> {
        Ok(self
            .lock()
            .agents
            .get(agent_id)
            .map(|a| a.services.clone())
            .unwrap_or_default())
    }

    async fn get_tx_count(&self, agent_id: U256) -> Result<u64, RegistryError> {
        Ok(self
            .lock()
            .agents
            .get(agent_id)
            .map(|a| a.tx_count)
            .unwrap_or_default())
    }
}
