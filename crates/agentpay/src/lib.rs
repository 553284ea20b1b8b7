//! Atomic pay-per-request settlement with signed reputation attestations.
//!
//! A payer signs an EIP-3009 `TransferWithAuthorization` for the agent's
//! worker address; the worker signs a quality score bound to the same nonce.
//! The [`SettlementEngine`] verifies both signatures and hands them to a
//! [`Ledger`] which moves funds, consumes the nonce, appends the feedback and
//! bumps the agent's transaction counter in one indivisible step.
//!
//! # Parties
//!
//! - **Payer**: signs the transfer authorization ([`client::sign_authorization`])
//! - **Worker**: the agent's delegated key, signs the attestation ([`client::sign_attestation`])
//! - **Facilitator**: runs the [`SettlementEngine`] and submits the atomic ledger call
//!
//! # Quick example
//!
//! ```no_run
//! use std::sync::Arc;
//! use alloy::primitives::U256;
//! use alloy::signers::local::PrivateKeySigner;
//! use agentpay::{client, ChainConfig, InMemoryLedger, SettlementEngine};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let ledger = Arc::new(InMemoryLedger::new());
//! let owner = PrivateKeySigner::random();
//! let worker = PrivateKeySigner::random();
//! let payer = PrivateKeySigner::random();
//!
//! let agent_id = ledger.register_agent(owner.address(), "ipfs://agent");
//! ledger.set_worker(agent_id, owner.address(), worker.address()).unwrap();
//! ledger.mint(payer.address(), U256::from(1_000u64));
//!
//! let config = ChainConfig::default();
//! let bundle = client::build_bundle(
//!     &payer,
//!     &worker,
//!     &config,
//!     &client::BundleRequest::new(agent_id, U256::from(100u64), 95, "weather"),
//! )
//! .unwrap();
//!
//! let engine = SettlementEngine::new(ledger.clone(), ledger, config);
//! let receipt = engine.settle(&bundle).await.unwrap();
//! # }
//! ```

// Core types
pub mod constants;
pub mod error;
pub mod payment;

// Signing and verification
pub mod attestation;
pub mod eip712;
pub mod verifier;

// Transport
pub mod envelope;

// State
pub mod ledger;
pub mod registry;
#[cfg(feature = "full")]
pub mod onchain;
#[cfg(feature = "full")]
pub mod sqlite_ledger;

// Settlement and signing helpers
pub mod client;
pub mod settlement;

use alloy::sol;

// EIP-3009 typed record. The struct name is part of the EIP-712 type hash and
// must stay `TransferWithAuthorization` to match the token contract.
sol! {
    #[derive(Debug, PartialEq, Eq)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

// Agent protocol contract: identity registry plus the atomic settleAndLog entrypoint.
sol! {
    #[sol(rpc)]
    interface IAgentProtocol {
        struct PayData {
            address payer;
            uint256 amount;
            bytes32 paymentNonce;
            uint256 validAfter;
            uint256 validBefore;
            uint8 v;
            bytes32 r;
            bytes32 s;
        }

        struct Service {
            string name;
            uint256 price;
            bool active;
        }

        function settleAndLog(PayData payData, uint256 agentId, uint8 score, bytes repSignature, bytes32 tag2, string fileuri) external;
        function registerAgent(address creator, string metadataURI) external returns (uint256);
        function setWorkerAddress(uint256 agentId, address worker) external;
        function addService(uint256 agentId, string name, uint256 price) external;
        function agentWorkers(uint256 agentId) external view returns (address);
        function agentTxCount(uint256 agentId) external view returns (uint256);
        function getServices(uint256 agentId) external view returns (Service[] memory);
        function ownerOf(uint256 tokenId) external view returns (address);
        function tokenURI(uint256 tokenId) external view returns (string memory);
    }
}

// EIP-3009 token surface the ledger reads from.
sol! {
    #[sol(rpc)]
    interface IERC3009 {
        function balanceOf(address owner) external view returns (uint256);
        function authorizationState(address authorizer, bytes32 nonce) external view returns (bool);
    }
}

// Re-exports
pub use constants::ChainConfig;
pub use constants::*;
pub use error::{DecodeError, RegistryError, SettlementError, VerifyError};
pub use payment::*;

pub use envelope::{decode_envelope, encode_envelope, encode_header, service_tag};
pub use ledger::{InMemoryLedger, Ledger};
pub use registry::{AgentIdentity, FeedbackEntry, IdentityRegistry, Service};
pub use settlement::SettlementEngine;
pub use verifier::{Secp256k1Verifier, SignatureVerifier};
