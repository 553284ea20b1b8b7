//! Agent identity registry.
//!
//! Maps an agent id to its owner, the worker key that receives payments and
//! signs attestations, and the services it sells. Settlement only ever reads
//! from it ([`IdentityRegistry`]); owner-side mutations live on the concrete
//! ledgers, which hold the registry table next to balances so one commit can
//! touch both.

use std::collections::BTreeMap;
use std::future::Future;

use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::payment::dec_u256;

/// A priced offering. Append-only; deactivated, never removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(with = "dec_u256")]
    pub price: U256,
    pub active: bool,
}

/// Registered agent. Never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    #[serde(with = "dec_u256")]
    pub agent_id: U256,
    pub owner: Address,
    pub worker: Option<Address>,
    pub metadata_uri: String,
    pub services: Vec<Service>,
    /// Successful settlements. Only ever increases.
    pub tx_count: u64,
}

impl AgentIdentity {
    /// First active service named `name`.
    pub fn active_service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.active && s.name == name)
    }
}

/// One entry in an agent's reputation log, appended by a committed settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEntry {
    pub payer: Address,
    pub score: u8,
    pub service_tag: B256,
    pub file_uri: String,
    pub payment_nonce: B256,
}

/// Read side of the registry, as consumed by the settlement engine and gateway.
///
/// Unknown agents are not an error: they have no worker, no services and a
/// zero transaction count.
pub trait IdentityRegistry: Send + Sync {
    fn get_worker(
        &self,
        agent_id: U256,
    ) -> impl Future<Output = Result<Option<Address>, RegistryError>> + Send;

    fn get_services(
        &self,
        agent_id: U256,
    ) -> impl Future<Output = Result<Vec<Service>, RegistryError>> + Send;

    fn get_tx_count(&self, agent_id: U256)
        -> impl Future<Output = Result<u64, RegistryError>> + Send;
}

/// In-process agent table shared by the in-memory ledger.
///
/// Ids are issued monotonically starting at 0.
#[derive(Debug, Default)]
pub(crate) struct AgentTable {
    agents: BTreeMap<U256, AgentIdentity>,
    next_id: U256,
}

impl AgentTable {
    pub(crate) fn register(&mut self, owner: Address, metadata_uri: &str) -> U256 {
        let agent_id = self.next_id;
        self.next_id += U256::from(1u64);
        self.agents.insert(
            agent_id,
            AgentIdentity {
                agent_id,
                owner,
                worker: None,
                metadata_uri: metadata_uri.to_string(),
                services: Vec::new(),
                tx_count: 0,
            },
        );
        agent_id
    }

    pub(crate) fn get(&self, agent_id: U256) -> Option<&AgentIdentity> {
        self.agents.get(&agent_id)
    }

    pub(crate) fn get_mut(&mut self, agent_id: U256) -> Option<&mut AgentIdentity> {
        self.agents.get_mut(&agent_id)
    }

    fn owned_by(
        &mut self,
        agent_id: U256,
        caller: Address,
    ) -> Result<&mut AgentIdentity, RegistryError> {
        let agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or(RegistryError::AgentNotFound(agent_id))?;
        if agent.owner != caller {
            return Err(RegistryError::NotAgentOwner(caller));
        }
        Ok(agent)
    }

    pub(crate) fn set_worker(
        &mut self,
        agent_id: U256,
        caller: Address,
        worker: Address,
    ) -> Result<(), RegistryError> {
        if worker == Address::ZERO {
            return Err(RegistryError::InvalidWorker);
        }
        self.owned_by(agent_id, caller)?.worker = Some(worker);
        Ok(())
    }

    pub(crate) fn add_service(
        &mut self,
        agent_id: U256,
        caller: Address,
        name: &str,
        price: U256,
    ) -> Result<usize, RegistryError> {
        let agent = self.owned_by(agent_id, caller)?;
        agent.services.push(Service {
            name: name.to_string(),
            price,
            active: true,
        });
        Ok(agent.services.len() - 1)
    }

    pub(crate) fn set_service_active(
        &mut self,
        agent_id: U256,
        caller: Address,
        index: usize,
        active: bool,
    ) -> Result<(), RegistryError> {
        let agent = self.owned_by(agent_id, caller)?;
        let service = agent
            .services
            .get_mut(index)
            .ok_or(RegistryError::ServiceNotFound(index))?;
        service.active = active;
        Ok(())
    }
}
