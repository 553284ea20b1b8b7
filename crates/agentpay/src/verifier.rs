//! Signer recovery capability.
//!
//! The settlement engine never touches curve arithmetic directly; it asks a
//! [`SignatureVerifier`] who signed, then compares the answer with the party
//! it expects. Swapping the scheme means swapping this implementation.

use alloy::primitives::{Address, B256};
use alloy::sol_types::Eip712Domain;

use crate::attestation::personal_message_hash;
use crate::eip712::{parse_signature, recover_prehash, signing_hash};
use crate::{PaymentSignature, TransferWithAuthorization, VerifyError};

/// Recovers signer identities. Stateless and safe to share across requests.
pub trait SignatureVerifier: Send + Sync {
    /// Recover the signer of an EIP-712 transfer authorization.
    fn verify_structured(
        &self,
        record: &TransferWithAuthorization,
        domain: &Eip712Domain,
        signature: &PaymentSignature,
    ) -> Result<Address, VerifyError>;

    /// Recover the signer of a 32-byte digest signed as an EIP-191 personal message.
    fn verify_digest(&self, digest: &B256, signature: &[u8]) -> Result<Address, VerifyError>;
}

/// secp256k1 ECDSA recovery (Ethereum-compatible).
#[derive(Debug, Clone, Copy, Default)]
pub struct Secp256k1Verifier;

impl SignatureVerifier for Secp256k1Verifier {
    fn verify_structured(
        &self,
        record: &TransferWithAuthorization,
        domain: &Eip712Domain,
        signature: &PaymentSignature,
    ) -> Result<Address, VerifyError> {
        let sig = signature.to_signature()?;
        recover_prehash(&sig, &signing_hash(record, domain))
    }

    fn verify_digest(&self, digest: &B256, signature: &[u8]) -> Result<Address, VerifyError> {
        let sig = parse_signature(signature)?;
        recover_prehash(&sig, &personal_message_hash(digest))
    }
}
