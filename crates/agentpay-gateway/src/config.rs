use std::env;
use std::time::Duration;

use agentpay::ChainConfig;
use alloy::primitives::{Address, U256};
use url::Url;

const DEFAULT_PORT: u16 = 4021;
const DEFAULT_SERVICE_NAME: &str = "premium-weather";
const DEFAULT_SERVICE_PRICE: &str = "100000";
const DEFAULT_DB_PATH: &str = "./agentpay-ledger.db";
const DEFAULT_RATE_LIMIT_RPM: u64 = 60;
const DEFAULT_SETTLE_TIMEOUT_SECS: u64 = 30;

/// Where settlements are committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBackend {
    /// Process-local; state is lost on restart. Development only.
    Memory,
    /// SQLite file at `ledger_db_path`.
    Sqlite,
    /// The agent protocol contract at `agent_protocol_address`.
    Onchain,
}

impl std::str::FromStr for LedgerBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "onchain" => Ok(Self::Onchain),
            other => Err(ConfigError::InvalidValue("LEDGER_BACKEND", other.to_string())),
        }
    }
}

#[derive(Clone)]
pub struct GatewayConfig {
    /// Agent whose resource this gateway sells
    pub agent_id: U256,
    /// Service looked up in the registry for the current price
    pub service_name: String,
    /// Price used when the registry has no active service by that name
    pub service_price: U256,
    pub port: u16,
    pub ledger_backend: LedgerBackend,
    pub ledger_db_path: String,
    /// Key that submits `settleAndLog` (on-chain backend only)
    pub facilitator_private_key: Option<String>,
    pub agent_protocol_address: Option<Address>,
    /// Upper bound on one settlement attempt
    pub settle_timeout: Duration,
    pub rate_limit_rpm: u64,
    /// CORS allowed origins (empty = localhost only)
    pub allowed_origins: Vec<String>,
    /// Bearer token required for /metrics (None = /metrics disabled)
    pub metrics_token: Option<String>,
    /// Token, chain and RPC endpoint
    pub chain: ChainConfig,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("agent_id", &self.agent_id)
            .field("service_name", &self.service_name)
            .field("service_price", &self.service_price)
            .field("port", &self.port)
            .field("ledger_backend", &self.ledger_backend)
            .field("ledger_db_path", &self.ledger_db_path)
            .field(
                "facilitator_private_key",
                &self.facilitator_private_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("agent_protocol_address", &self.agent_protocol_address)
            .field("settle_timeout", &self.settle_timeout)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field("allowed_origins", &self.allowed_origins)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("chain", &self.chain)
            .finish()
    }
}

impl GatewayConfig {
    /// Load `.env` (if present) and read configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        // Required: agent id
        let agent_id_str = var("AGENT_ID").ok_or(ConfigError::MissingRequired("AGENT_ID"))?;
        let agent_id = U256::from_str_radix(agent_id_str.trim(), 10)
            .map_err(|_| ConfigError::InvalidValue("AGENT_ID", agent_id_str.clone()))?;

        let service_name = var("SERVICE_NAME").unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());

        let mut chain = ChainConfig::default();
        if let Some(rpc) = var("RPC_URL") {
            chain.rpc_url = rpc;
        }
        Url::parse(&chain.rpc_url).map_err(|_| ConfigError::InvalidUrl(chain.rpc_url.clone()))?;

        let service_price = parse_price(
            &var("SERVICE_PRICE").unwrap_or_else(|| DEFAULT_SERVICE_PRICE.to_string()),
            chain.token_decimals,
        )?;

        let port = match var("PORT") {
            Some(p) => p
                .parse()
                .map_err(|_| ConfigError::InvalidValue("PORT", p.clone()))?,
            None => DEFAULT_PORT,
        };

        let ledger_backend = match var("LEDGER_BACKEND") {
            Some(b) => b.parse()?,
            None => LedgerBackend::Sqlite,
        };

        let ledger_db_path = var("LEDGER_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let facilitator_private_key = var("FACILITATOR_PRIVATE_KEY");

        let agent_protocol_address = match var("AGENT_PROTOCOL_ADDRESS") {
            Some(a) => Some(
                a.trim()
                    .parse::<Address>()
                    .map_err(|_| ConfigError::InvalidAddress(a.clone()))?,
            ),
            None => None,
        };

        let settle_timeout = Duration::from_secs(
            var("SETTLE_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_SETTLE_TIMEOUT_SECS),
        );

        let rate_limit_rpm = var("RATE_LIMIT_RPM")
            .and_then(|s| s.parse().ok())
            .filter(|rpm| *rpm > 0)
            .unwrap_or(DEFAULT_RATE_LIMIT_RPM);

        let allowed_origins: Vec<String> = var("ALLOWED_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        if allowed_origins.iter().any(|o| o == "*") {
            return Err(ConfigError::InvalidValue(
                "ALLOWED_ORIGINS",
                "wildcard origin '*' is not allowed for payment endpoints".to_string(),
            ));
        }

        let metrics_token = var("METRICS_TOKEN");

        if ledger_backend == LedgerBackend::Onchain {
            if facilitator_private_key.is_none() {
                return Err(ConfigError::MissingRequired("FACILITATOR_PRIVATE_KEY"));
            }
            if agent_protocol_address.is_none() {
                return Err(ConfigError::MissingRequired("AGENT_PROTOCOL_ADDRESS"));
            }
        }

        if ledger_backend == LedgerBackend::Memory {
            tracing::warn!(
                "LEDGER_BACKEND=memory: balances and consumed nonces are lost on restart, \
                 which re-enables replay of settled payments. Development only."
            );
        }

        if metrics_token.is_none() {
            tracing::warn!("METRICS_TOKEN not set: /metrics will refuse all requests");
        }

        Ok(Self {
            agent_id,
            service_name,
            service_price,
            port,
            ledger_backend,
            ledger_db_path,
            facilitator_private_key,
            agent_protocol_address,
            settle_timeout,
            rate_limit_rpm,
            allowed_origins,
            metrics_token,
            chain,
        })
    }
}

/// Parse a price into token base units.
///
/// `"100000"` is taken as base units; `"$0.10"` is a dollar amount scaled by
/// `decimals`.
pub fn parse_price(price: &str, decimals: u32) -> Result<U256, ConfigError> {
    let price = price.trim();
    let invalid = || ConfigError::InvalidPrice(price.to_string());

    let Some(dollars) = price.strip_prefix('$') else {
        return U256::from_str_radix(price, 10).map_err(|_| invalid());
    };

    let (whole, frac) = dollars.split_once('.').unwrap_or((dollars, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    if frac.len() > decimals as usize {
        return Err(invalid());
    }

    let padded = format!("{whole}{frac:0<width$}", width = decimals as usize);
    let digits = padded.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 10).map_err(|_| invalid())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("invalid private key")]
    InvalidPrivateKey,

    #[error("failed to open ledger: {0}")]
    Ledger(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_price() {
        assert_eq!(parse_price("100000", 6).unwrap(), U256::from(100_000u64));
        assert_eq!(parse_price("$0.01", 6).unwrap(), U256::from(10_000u64));
        assert_eq!(parse_price("$1", 6).unwrap(), U256::from(1_000_000u64));
        assert_eq!(parse_price("$1.5", 6).unwrap(), U256::from(1_500_000u64));
        assert_eq!(parse_price("$0.000001", 6).unwrap(), U256::from(1u64));
        assert_eq!(parse_price("$0", 6).unwrap(), U256::ZERO);
    }

    #[test]
    fn test_parse_price_rejects_garbage() {
        assert!(parse_price("$0.0000001", 6).is_err());
        assert!(parse_price("$", 6).is_err());
        assert!(parse_price("$1e3", 6).is_err());
        assert!(parse_price("-5", 6).is_err());
        assert!(parse_price("ten", 6).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_lookup(lookup(&[("AGENT_ID", "1")])).unwrap();
        assert_eq!(config.agent_id, U256::from(1u64));
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
        assert_eq!(config.service_price, U256::from(100_000u64));
        assert_eq!(config.ledger_backend, LedgerBackend::Sqlite);
        assert_eq!(config.settle_timeout, Duration::from_secs(30));
        assert!(config.allowed_origins.is_empty());
        assert_eq!(config.chain.chain_id, agentpay::FUJI_CHAIN_ID);
    }

    #[test]
    fn test_agent_id_required() {
        assert!(matches!(
            GatewayConfig::from_lookup(lookup(&[])),
            Err(ConfigError::MissingRequired("AGENT_ID"))
        ));
    }

    #[test]
    fn test_onchain_requires_key_and_contract() {
        let err = GatewayConfig::from_lookup(lookup(&[
            ("AGENT_ID", "1"),
            ("LEDGER_BACKEND", "onchain"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingRequired("FACILITATOR_PRIVATE_KEY")
        ));

        let err = GatewayConfig::from_lookup(lookup(&[
            ("AGENT_ID", "1"),
            ("LEDGER_BACKEND", "onchain"),
            ("FACILITATOR_PRIVATE_KEY", "0xabc"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingRequired("AGENT_PROTOCOL_ADDRESS")
        ));
    }

    #[test]
    fn test_wildcard_origin_rejected() {
        let err = GatewayConfig::from_lookup(lookup(&[
            ("AGENT_ID", "1"),
            ("ALLOWED_ORIGINS", "https://a.example, *"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue("ALLOWED_ORIGINS", _)));
    }

    #[test]
    fn test_bad_rpc_url_rejected() {
        let err = GatewayConfig::from_lookup(lookup(&[("AGENT_ID", "1"), ("RPC_URL", "not a url")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl(_)));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("AGENT_ID", "1"),
            ("FACILITATOR_PRIVATE_KEY", "0xdeadbeefsecret"),
            ("METRICS_TOKEN", "supersecrettoken"),
        ]))
        .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("deadbeefsecret"));
        assert!(!debug.contains("supersecrettoken"));
        assert!(debug.contains("[REDACTED]"));
    }
}
