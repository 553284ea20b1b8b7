use alloy::primitives::{Address, U256};
use thiserror::Error;

/// Envelope could not be turned into a [`PaymentBundle`](crate::PaymentBundle).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed payment envelope: {0}")]
    Malformed(String),
}

/// Signer recovery failures. These say nothing about *who* signed; callers
/// compare the recovered address themselves.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("signature must be 65 bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid signature: {0}")]
    Malformed(String),

    #[error("high-s signature rejected (EIP-2 malleability)")]
    HighS,

    #[error("recovery failed: {0}")]
    Recovery(String),
}

/// Outcome of a rejected settlement attempt.
///
/// Every variant except [`SettlementError::InternalInvariantViolation`] leaves
/// ledger state untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettlementError {
    #[error("agent {0} has no worker address configured")]
    AgentNotConfigured(U256),

    #[error("authorization is outside its validity window")]
    AuthorizationExpired,

    #[error("invalid score {0}: must be between 0 and 100")]
    InvalidScore(u8),

    #[error("payment amount must be non-zero")]
    InvalidAmount,

    #[error("payment signature does not match payer")]
    InvalidPaymentSignature,

    #[error("attestation signature does not match agent worker")]
    InvalidAttestationSignature,

    #[error("payment nonce already used")]
    NonceReplay,

    #[error("payer {payer} cannot cover {required}")]
    InsufficientBalance { payer: Address, required: U256 },

    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("internal invariant violated: {0}")]
    InternalInvariantViolation(String),
}

impl SettlementError {
    /// Only infrastructure faults may be retried; validation failures are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SettlementError::LedgerUnavailable(_))
    }

    /// Stable machine-readable reason, used for metrics labels and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            SettlementError::AgentNotConfigured(_) => "agent_not_configured",
            SettlementError::AuthorizationExpired => "authorization_expired",
            SettlementError::InvalidScore(_) => "invalid_score",
            SettlementError::InvalidAmount => "invalid_amount",
            SettlementError::InvalidPaymentSignature => "invalid_payment_signature",
            SettlementError::InvalidAttestationSignature => "invalid_attestation_signature",
            SettlementError::NonceReplay => "nonce_replay",
            SettlementError::InsufficientBalance { .. } => "insufficient_balance",
            SettlementError::LedgerUnavailable(_) => "ledger_unavailable",
            SettlementError::InternalInvariantViolation(_) => "internal_invariant_violation",
        }
    }
}

/// Owner-side registry mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("agent {0} not found")]
    AgentNotFound(U256),

    #[error("caller {0} is not the agent owner")]
    NotAgentOwner(Address),

    #[error("service index {0} out of range")]
    ServiceNotFound(usize),

    #[error("invalid worker address")]
    InvalidWorker,

    #[error("registry unavailable: {0}")]
    Unavailable(String),
}
