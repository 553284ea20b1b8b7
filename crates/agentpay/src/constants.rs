use alloy::primitives::Address;

/// Avalanche Fuji chain ID.
pub const FUJI_CHAIN_ID: u64 = 43113;

/// CAIP-2 network identifier for Avalanche Fuji.
pub const FUJI_NETWORK: &str = "eip155:43113";

/// USDC on Avalanche Fuji (`0x5425890298aed601595a70ab815c96711a31bc65`).
pub const DEFAULT_TOKEN: Address = Address::new([
    0x54, 0x25, 0x89, 0x02, 0x98, 0xae, 0xd6, 0x01, 0x59, 0x5a, 0x70, 0xab, 0x81, 0x5c, 0x96, 0x71,
    0x1a, 0x31, 0xbc, 0x65,
]);

/// USDC has 6 decimal places.
pub const TOKEN_DECIMALS: u32 = 6;

/// Default RPC endpoint for Avalanche Fuji.
pub const RPC_URL: &str = "https://api.avax-test.network/ext/bc/C/rpc";

/// Block explorer base URL.
pub const EXPLORER_BASE: &str = "https://testnet.snowtrace.io";

/// Protocol identifier advertised in 402 challenges.
pub const PROTOCOL_NAME: &str = "AgentPay-v1";

/// Facilitator name advertised in 402 challenges.
pub const FACILITATOR_NAME: &str = "AgentPay";

/// Request header carrying the payment envelope.
pub const PAYMENT_HEADER: &str = "X-PAYMENT";

/// Response header carrying the settlement receipt.
pub const RECEIPT_HEADER: &str = "PAYMENT-RESPONSE";

/// Highest reputation score an attestation may carry.
pub const MAX_SCORE: u8 = 100;

/// Runtime chain configuration. Everything the signature domain and the
/// challenge body need lives here so tests can point at a local ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub network: String,
    pub token: Address,
    pub token_decimals: u32,
    pub currency: String,
    pub rpc_url: String,
    pub explorer_base: String,
    pub eip712_domain_name: String,
    pub eip712_domain_version: String,
    /// Accept zero-value authorizations as free attestations.
    pub allow_free_attestations: bool,
}

impl Default for ChainConfig {
    /// Defaults to Avalanche Fuji USDC.
    fn default() -> Self {
        Self {
            chain_id: FUJI_CHAIN_ID,
            network: FUJI_NETWORK.to_string(),
            token: DEFAULT_TOKEN,
            token_decimals: TOKEN_DECIMALS,
            currency: "USDC".to_string(),
            rpc_url: RPC_URL.to_string(),
            explorer_base: EXPLORER_BASE.to_string(),
            eip712_domain_name: "USD Coin".to_string(),
            eip712_domain_version: "2".to_string(),
            allow_free_attestations: false,
        }
    }
}

impl ChainConfig {
    /// Explorer link for a settlement transaction.
    pub fn tx_url(&self, tx: &alloy::primitives::B256) -> String {
        format!("{}/tx/{tx}", self.explorer_base.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_token_matches_fuji_usdc() {
        let expected: Address = "0x5425890298aed601595a70ab815c96711a31bc65"
            .parse()
            .unwrap();
        assert_eq!(DEFAULT_TOKEN, expected);
    }

    #[test]
    fn tx_url_trims_trailing_slash() {
        let config = ChainConfig {
            explorer_base: "https://explorer.test/".to_string(),
            ..ChainConfig::default()
        };
        let url = config.tx_url(&alloy::primitives::B256::ZERO);
        assert!(url.starts_with("https://explorer.test/tx/0x"));
    }
}
