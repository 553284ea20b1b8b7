use std::sync::Arc;

use agentpay::onchain::OnchainLedger;
use agentpay::registry::Service;
use agentpay::sqlite_ledger::SqliteLedger;
use agentpay::{
    IdentityRegistry, InMemoryLedger, Ledger, PaymentBundle, RegistryError, SettlementEngine,
    SettlementError,
};
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{
    fillers::{
        BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
    },
    Identity, Provider, ProviderBuilder, RootProvider,
};
use alloy::signers::local::PrivateKeySigner;

use crate::config::{ConfigError, GatewayConfig, LedgerBackend};
use crate::middleware::PaymentGate;

/// Concrete provider type from `ProviderBuilder::new().wallet(...).connect_http(...)`.
pub type WalletProvider = FillProvider<
    JoinFill<
        JoinFill<
            Identity,
            JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
        >,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider,
>;

/// The ledger a gateway settles against, chosen at startup.
pub enum Backend {
    Memory(Arc<InMemoryLedger>),
    Sqlite(SqliteLedger),
    Onchain(OnchainLedger<WalletProvider>),
}

impl Backend {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, ConfigError> {
        match config.ledger_backend {
            LedgerBackend::Memory => Ok(Backend::Memory(Arc::new(InMemoryLedger::new()))),
            LedgerBackend::Sqlite => SqliteLedger::open(&config.ledger_db_path)
                .map(Backend::Sqlite)
                .map_err(|e| ConfigError::Ledger(format!("{}: {e}", config.ledger_db_path))),
            LedgerBackend::Onchain => {
                let key = config
                    .facilitator_private_key
                    .as_deref()
                    .ok_or(ConfigError::MissingRequired("FACILITATOR_PRIVATE_KEY"))?;
                let contract = config
                    .agent_protocol_address
                    .ok_or(ConfigError::MissingRequired("AGENT_PROTOCOL_ADDRESS"))?;
                let signer: PrivateKeySigner =
                    key.parse().map_err(|_| ConfigError::InvalidPrivateKey)?;
                let rpc_url = config
                    .chain
                    .rpc_url
                    .parse()
                    .map_err(|_| ConfigError::InvalidUrl(config.chain.rpc_url.clone()))?;

                tracing::info!(facilitator = %signer.address(), contract = %contract, "on-chain ledger");
                let provider = ProviderBuilder::new()
                    .wallet(EthereumWallet::from(signer))
                    .connect_http(rpc_url);
                Ok(Backend::Onchain(
                    OnchainLedger::new(provider, contract, config.chain.clone())
                        .with_tx_timeout(config.settle_timeout),
                ))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Memory(_) => "memory",
            Backend::Sqlite(_) => "sqlite",
            Backend::Onchain(_) => "onchain",
        }
    }

    /// Cheap liveness check against the underlying store.
    pub async fn health(&self) -> Result<(), String> {
        match self {
            Backend::Memory(_) => Ok(()),
            Backend::Sqlite(l) => l
                .balance_of(Address::ZERO)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Backend::Onchain(l) => l
                .provider()
                .get_block_number()
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
        }
    }
}

impl Ledger for Backend {
    async fn settle_and_log(
        &self,
        bundle: &PaymentBundle,
        worker: Address,
    ) -> Result<B256, SettlementError> {
        match self {
            Backend::Memory(l) => l.settle_and_log(bundle, worker).await,
            Backend::Sqlite(l) => l.settle_and_log(bundle, worker).await,
            Backend::Onchain(l) => l.settle_and_log(bundle, worker).await,
        }
    }

    async fn is_nonce_consumed(&self, payer: Address, nonce: B256) -> Result<bool, SettlementError> {
        match self {
            Backend::Memory(l) => l.is_nonce_consumed(payer, nonce).await,
            Backend::Sqlite(l) => l.is_nonce_consumed(payer, nonce).await,
            Backend::Onchain(l) => l.is_nonce_consumed(payer, nonce).await,
        }
    }

    async fn balance_of(&self, account: Address) -> Result<U256, SettlementError> {
        match self {
            Backend::Memory(l) => l.balance_of(account).await,
            Backend::Sqlite(l) => l.balance_of(account).await,
            Backend::Onchain(l) => l.balance_of(account).await,
        }
    }
}

impl IdentityRegistry for Backend {
    async fn get_worker(&self, agent_id: U256) -> Result<Option<Address>, RegistryError> {
        match self {
            Backend::Memory(l) => l.get_worker(agent_id).await,
            Backend::Sqlite(l) => l.get_worker(agent_id).await,
            Backend::Onchain(l) => l.get_worker(agent_id).await,
        }
    }

    async fn get_services(&self, agent_id: U256) -> Result<Vec<Service>, RegistryError> {
        match self {
            Backend::Memory(l) => l.get_services(agent_id).await,
            Backend::Sqlite(l) => l.get_services(agent_id).await,
            Backend::Onchain(l) => l.get_services(agent_id).await,
        }
    }

    async fn get_tx_count(&self, agent_id: U256) -> Result<u64, RegistryError> {
        match self {
            Backend::Memory(l) => l.get_tx_count(agent_id).await,
            Backend::Sqlite(l) => l.get_tx_count(agent_id).await,
            Backend::Onchain(l) => l.get_tx_count(agent_id).await,
        }
    }
}

/// Shared application state for the gateway server.
pub struct AppState {
    pub engine: SettlementEngine<Backend, Backend>,
    pub gate: PaymentGate,
    /// Bearer token for /metrics. `None` disables the endpoint.
    pub metrics_token: Option<Vec<u8>>,
}

impl AppState {
    pub fn new(backend: Backend, config: &GatewayConfig) -> Self {
        let backend = Arc::new(backend);
        Self {
            engine: SettlementEngine::new(backend.clone(), backend, config.chain.clone()),
            gate: PaymentGate::from_config(config),
            metrics_token: config.metrics_token.clone().map(String::into_bytes),
        }
    }
}
