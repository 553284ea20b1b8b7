use alloy::primitives::{Address, Bytes, Signature, B256, U256};
use serde::{Deserialize, Serialize};

use crate::attestation::attestation_digest;
use crate::error::VerifyError;
use crate::TransferWithAuthorization;

/// Split ECDSA signature as carried by the payment envelope (`v`, `r`, `s`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentSignature {
    pub v: u8,
    pub r: B256,
    pub s: B256,
}

impl PaymentSignature {
    /// Split a recoverable signature using Electrum notation (`v` = 27 or 28).
    pub fn from_signature(sig: &Signature) -> Self {
        Self {
            v: 27 + u8::from(sig.v()),
            r: B256::from(sig.r().to_be_bytes::<32>()),
            s: B256::from(sig.s().to_be_bytes::<32>()),
        }
    }

    /// Rebuild the recoverable signature. Accepts `v` in {0, 1, 27, 28}.
    pub fn to_signature(&self) -> Result<Signature, VerifyError> {
        let parity = match self.v {
            0 | 27 => false,
            1 | 28 => true,
            other => {
                return Err(VerifyError::Malformed(format!(
                    "invalid recovery id v={other}"
                )))
            }
        };
        Ok(Signature::new(
            U256::from_be_bytes(self.r.0),
            U256::from_be_bytes(self.s.0),
            parity,
        ))
    }
}

/// A payer's single-use permission to move `amount` to the agent's worker.
///
/// The payee is not part of the wire format; it is bound at verification time
/// to the worker address registered for the agent (see [`Self::typed_for`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentAuthorization {
    pub payer: Address,
    pub amount: U256,
    pub nonce: B256,
    pub valid_after: u64,
    pub valid_before: u64,
    pub signature: PaymentSignature,
}

impl PaymentAuthorization {
    /// The EIP-712 record this authorization claims to be a signature over,
    /// with `to` fixed to `payee`.
    pub fn typed_for(&self, payee: Address) -> TransferWithAuthorization {
        TransferWithAuthorization {
            from: self.payer,
            to: payee,
            value: self.amount,
            validAfter: U256::from(self.valid_after),
            validBefore: U256::from(self.valid_before),
            nonce: self.nonce,
        }
    }
}

/// Seller-side quality score bound to one payment nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReputationAttestation {
    pub agent_id: U256,
    pub score: u8,
    pub nonce: B256,
    pub signature: Bytes,
}

impl ReputationAttestation {
    /// Packed-keccak digest the worker signs.
    pub fn digest(&self) -> B256 {
        attestation_digest(self.agent_id, self.score, self.nonce)
    }
}

/// Everything a client sends in one payment header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentBundle {
    pub authorization: PaymentAuthorization,
    pub agent_id: U256,
    pub score: u8,
    pub rep_signature: Bytes,
    /// `keccak256(service category)`, see [`crate::service_tag`].
    pub service_tag: B256,
    /// Optional pointer to the delivered artifact. May be empty.
    pub file_uri: String,
}

impl PaymentBundle {
    /// The attestation half of the bundle. Its nonce is always the payment nonce.
    pub fn attestation(&self) -> ReputationAttestation {
        ReputationAttestation {
            agent_id: self.agent_id,
            score: self.score,
            nonce: self.authorization.nonce,
            signature: self.rep_signature.clone(),
        }
    }
}

/// Acknowledgment of a committed settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    /// Transaction hash (on-chain ledger) or ledger-issued handle.
    pub handle: B256,
    #[serde(with = "dec_u256")]
    pub agent_id: U256,
    pub payer: Address,
    #[serde(with = "dec_u256")]
    pub amount: U256,
    /// Unix seconds at which the settlement was validated.
    pub timestamp: u64,
}

/// Serde adapter for `U256` as a decimal string. Deserialization also accepts
/// a JSON number and `0x`-prefixed hex strings.
pub mod dec_u256 {
    use alloy::primitives::U256;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(U256::from(n)),
            Raw::Text(s) => {
                let s = s.trim();
                let parsed = match s.strip_prefix("0x") {
                    Some(hex) => U256::from_str_radix(hex, 16),
                    None => U256::from_str_radix(s, 10),
                };
                parsed.map_err(|e| D::Error::custom(format!("invalid uint256 '{s}': {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_signature_parity_roundtrip() {
        let sig = Signature::new(U256::from(42u64), U256::from(99u64), true);
        let split = PaymentSignature::from_signature(&sig);
        assert_eq!(split.v, 28);

        let rebuilt = split.to_signature().unwrap();
        assert_eq!(rebuilt.r(), U256::from(42u64));
        assert_eq!(rebuilt.s(), U256::from(99u64));
        assert!(rebuilt.v());
    }

    #[test]
    fn test_payment_signature_accepts_raw_parity() {
        let split = PaymentSignature {
            v: 0,
            r: B256::repeat_byte(1),
            s: B256::repeat_byte(2),
        };
        assert!(!split.to_signature().unwrap().v());
    }

    #[test]
    fn test_payment_signature_rejects_bad_v() {
        let split = PaymentSignature {
            v: 29,
            r: B256::ZERO,
            s: B256::ZERO,
        };
        assert!(matches!(split.to_signature(), Err(VerifyError::Malformed(_))));
    }

    #[test]
    fn test_typed_record_binds_payee() {
        let auth = PaymentAuthorization {
            payer: Address::repeat_byte(0x11),
            amount: U256::from(100u64),
            nonce: B256::repeat_byte(0x33),
            valid_after: 0,
            valid_before: 3600,
            signature: PaymentSignature {
                v: 27,
                r: B256::ZERO,
                s: B256::ZERO,
            },
        };
        let payee = Address::repeat_byte(0x22);
        let typed = auth.typed_for(payee);
        assert_eq!(typed.from, auth.payer);
        assert_eq!(typed.to, payee);
        assert_eq!(typed.validBefore, U256::from(3600u64));
        assert_eq!(typed.nonce, auth.nonce);
    }

    #[test]
    fn test_receipt_serializes_amounts_as_decimal() {
        let receipt = SettlementReceipt {
            handle: B256::ZERO,
            agent_id: U256::from(7u64),
            payer: Address::ZERO,
            amount: U256::from(100_000u64),
            timestamp: 1_700_000_000,
        };
        let json = serde_json::to_value(&receipt).unwrap();
        assert_eq!(json["agentId"], "7");
        assert_eq!(json["amount"], "100000");
        assert_eq!(json["timestamp"], 1_700_000_000u64);

        let back: SettlementReceipt = serde_json::from_value(json).unwrap();
        assert_eq!(back, receipt);
    }
}
