//! Client-side signing helpers.
//!
//! A buyer signs the transfer authorization; the seller's worker signs the
//! attestation. In tests and demos one process often holds both keys, so
//! [`build_bundle`] takes both signers.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;

use crate::attestation::attestation_digest;
use crate::eip712::{payment_domain, random_nonce, signing_hash};
use crate::envelope::service_tag;
use crate::{ChainConfig, PaymentAuthorization, PaymentBundle, PaymentSignature};

/// Default authorization lifetime, matching what wallets typically offer.
pub const DEFAULT_VALIDITY_SECS: u64 = 3600;

/// Sign an EIP-3009 transfer of `amount` from the signer to `payee` (the
/// agent's worker address).
pub fn sign_authorization(
    payer: &PrivateKeySigner,
    payee: Address,
    amount: U256,
    valid_after: u64,
    valid_before: u64,
    nonce: B256,
    config: &ChainConfig,
) -> Result<PaymentAuthorization, alloy::signers::Error> {
    let mut authorization = PaymentAuthorization {
        payer: payer.address(),
        amount,
        nonce,
        valid_after,
        valid_before,
        signature: PaymentSignature {
            v: 27,
            r: B256::ZERO,
            s: B256::ZERO,
        },
    };
    let hash = signing_hash(&authorization.typed_for(payee), &payment_domain(config));
    let signature = payer.sign_hash_sync(&hash)?;
    authorization.signature = PaymentSignature::from_signature(&signature);
    Ok(authorization)
}

/// Sign a reputation attestation as an EIP-191 personal message over the
/// packed `(agent_id, score, nonce)` digest. Returns 65 bytes `r ‖ s ‖ v`.
pub fn sign_attestation(
    worker: &PrivateKeySigner,
    agent_id: U256,
    score: u8,
    nonce: B256,
) -> Result<Bytes, alloy::signers::Error> {
    let digest = attestation_digest(agent_id, score, nonce);
    let signature = worker.sign_message_sync(digest.as_slice())?;
    Ok(Bytes::from(signature.as_bytes().to_vec()))
}

/// Parameters for [`build_bundle`].
#[derive(Debug, Clone)]
pub struct BundleRequest {
    pub agent_id: U256,
    pub amount: U256,
    pub score: u8,
    pub category: String,
    pub file_uri: String,
    /// Fresh random nonce when `None`.
    pub nonce: Option<B256>,
    /// Explicit `(valid_after, valid_before)`. When `None` the window opens
    /// at 0 and closes [`DEFAULT_VALIDITY_SECS`] from now.
    pub window: Option<(u64, u64)>,
}

impl BundleRequest {
    pub fn new(agent_id: U256, amount: U256, score: u8, category: impl Into<String>) -> Self {
        Self {
            agent_id,
            amount,
            score,
            category: category.into(),
            file_uri: String::new(),
            nonce: None,
            window: None,
        }
    }

    pub fn file_uri(mut self, uri: impl Into<String>) -> Self {
        self.file_uri = uri.into();
        self
    }

    pub fn nonce(mut self, nonce: B256) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn valid_between(mut self, valid_after: u64, valid_before: u64) -> Self {
        self.window = Some((valid_after, valid_before));
        self
    }
}

/// Sign both halves and assemble the bundle a client sends in `X-PAYMENT`.
pub fn build_bundle(
    payer: &PrivateKeySigner,
    worker: &PrivateKeySigner,
    config: &ChainConfig,
    request: &BundleRequest,
) -> Result<PaymentBundle, alloy::signers::Error> {
    let nonce = request.nonce.unwrap_or_else(random_nonce);
    let (valid_after, valid_before) = match request.window {
        Some(window) => window,
        None => {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            (0, now.saturating_add(DEFAULT_VALIDITY_SECS))
        }
    };

    let authorization = sign_authorization(
        payer,
        worker.address(),
        request.amount,
        valid_after,
        valid_before,
        nonce,
        config,
    )?;
    let rep_signature = sign_attestation(worker, request.agent_id, request.score, nonce)?;

    Ok(PaymentBundle {
        authorization,
        agent_id: request.agent_id,
        score: request.score,
        rep_signature,
        service_tag: service_tag(&request.category),
        file_uri: request.file_uri.clone(),
    })
}
