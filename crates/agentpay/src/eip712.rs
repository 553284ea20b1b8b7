//! EIP-712 typed-data hashing and signer recovery for EIP-3009 transfer
//! authorizations, plus nonce generation.
//!
//! - Domain construction bound to one token contract and chain ([`payment_domain`])
//! - Signing hashes ([`signing_hash`])
//! - Low-level recovery with EIP-2 malleability protection ([`recover_prehash`])
//! - Random 32-byte nonces ([`random_nonce`])

use alloy::primitives::{keccak256, Address, Signature, B256, U256};
use alloy::sol_types::{Eip712Domain, SolStruct};

use crate::{ChainConfig, TransferWithAuthorization, VerifyError};

/// EIP-712 domain of the settlement token: `{name, version, chainId,
/// verifyingContract}`. Binding the token address and chain id here is what
/// stops an authorization from being replayed against another asset or chain.
pub fn payment_domain(config: &ChainConfig) -> Eip712Domain {
    Eip712Domain {
        name: Some(std::borrow::Cow::Owned(config.eip712_domain_name.clone())),
        version: Some(std::borrow::Cow::Owned(
            config.eip712_domain_version.clone(),
        )),
        chain_id: Some(U256::from(config.chain_id)),
        verifying_contract: Some(config.token),
        salt: None,
    }
}

/// EIP-712 signing hash of a transfer authorization under `domain`.
pub fn signing_hash(record: &TransferWithAuthorization, domain: &Eip712Domain) -> B256 {
    record.eip712_signing_hash(domain)
}

/// secp256k1 curve order N / 2. Signatures with s above this are malleable (EIP-2).
const SECP256K1_N_DIV_2: U256 = U256::from_limbs([
    0xDFE92F46681B20A0,
    0x5D576E7357A4501D,
    0xFFFFFFFFFFFFFFFF,
    0x7FFFFFFFFFFFFFFF,
]);

/// Reject high-s signatures.
pub fn ensure_low_s(sig: &Signature) -> Result<(), VerifyError> {
    if sig.s() > SECP256K1_N_DIV_2 {
        return Err(VerifyError::HighS);
    }
    Ok(())
}

/// Parse a 65-byte `r ‖ s ‖ v` signature. `v` may be 0/1 or 27/28.
pub fn parse_signature(signature_bytes: &[u8]) -> Result<Signature, VerifyError> {
    if signature_bytes.len() != 65 {
        return Err(VerifyError::InvalidLength(signature_bytes.len()));
    }
    Signature::from_raw(signature_bytes).map_err(|e| VerifyError::Malformed(e.to_string()))
}

/// Recover the signer of a 32-byte prehash, enforcing low-s.
pub fn recover_prehash(sig: &Signature, prehash: &B256) -> Result<Address, VerifyError> {
    ensure_low_s(sig)?;
    sig.recover_address_from_prehash(prehash)
        .map_err(|e| VerifyError::Recovery(e.to_string()))
}

/// Generate a random 32-byte nonce (keccak256 of 32 bytes from the OS CSPRNG).
pub fn random_nonce() -> B256 {
    let mut bytes = [0u8; 32];
    rand::fill(&mut bytes);
    keccak256(bytes)
}

/// Encode a signature as 0x-prefixed hex (65 bytes, `v` = 27 or 28).
pub fn encode_signature_hex(sig: &Signature) -> String {
    format!("0x{}", alloy::hex::encode(sig.as_bytes()))
}
