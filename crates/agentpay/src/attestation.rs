//! Reputation attestation digest.
//!
//! The worker signs `keccak256(abi.encodePacked(uint256 agentId, uint8 score,
//! bytes32 nonce))` as an EIP-191 personal message. The packed preimage is
//! exactly [`PACKED_LEN`] bytes:
//!
//! | bytes    | field     | encoding                 |
//! |----------|-----------|--------------------------|
//! | `0..32`  | `agentId` | 32-byte big-endian       |
//! | `32`     | `score`   | 1 byte                   |
//! | `33..65` | `nonce`   | raw 32 bytes             |
//!
//! Signer and verifier both go through [`attestation_digest`], so the layout
//! cannot drift between the two sides.

use alloy::primitives::{eip191_hash_message, keccak256, B256, U256};

/// Length of the packed `(agentId, score, nonce)` preimage.
pub const PACKED_LEN: usize = 32 + 1 + 32;

/// Solidity `abi.encodePacked(uint256, uint8, bytes32)`.
pub fn packed_attestation(agent_id: U256, score: u8, nonce: B256) -> [u8; PACKED_LEN] {
    let mut packed = [0u8; PACKED_LEN];
    packed[..32].copy_from_slice(&agent_id.to_be_bytes::<32>());
    packed[32] = score;
    packed[33..].copy_from_slice(nonce.as_slice());
    packed
}

/// The 32-byte digest a worker signs for `(agent_id, score, nonce)`.
pub fn attestation_digest(agent_id: U256, score: u8, nonce: B256) -> B256 {
    keccak256(packed_attestation(agent_id, score, nonce))
}

/// EIP-191 prehash of an attestation digest
/// (`"\x19Ethereum Signed Message:\n32" ‖ digest`).
pub fn personal_message_hash(digest: &B256) -> B256 {
    eip191_hash_message(digest.as_slice())
}
