//! Payment envelope codec.
//!
//! The envelope is a flat JSON object:
//!
//! ```json
//! {
//!   "payer": "0x…", "amount": "100000", "paymentNonce": "0x…",
//!   "validAfter": 0, "validBefore": 1700003600,
//!   "v": 27, "r": "0x…", "s": "0x…",
//!   "agentId": "1", "score": 95, "repSignature": "0x…",
//!   "tag2": "0x…", "fileuri": ""
//! }
//! ```
//!
//! It travels in the `X-PAYMENT` header either as raw JSON or base64-encoded
//! JSON. [`decode_envelope`] accepts both; [`encode_header`] emits base64.

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::payment::dec_u256;
use crate::{PaymentAuthorization, PaymentBundle, PaymentSignature};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    payer: Address,
    #[serde(with = "dec_u256")]
    amount: U256,
    payment_nonce: B256,
    valid_after: u64,
    valid_before: u64,
    v: u8,
    r: B256,
    s: B256,
    #[serde(with = "dec_u256")]
    agent_id: U256,
    score: u8,
    rep_signature: Bytes,
    tag2: B256,
    #[serde(rename = "fileuri", default)]
    file_uri: String,
}

impl From<&PaymentBundle> for WireEnvelope {
    fn from(bundle: &PaymentBundle) -> Self {
        let auth = &bundle.authorization;
        Self {
            payer: auth.payer,
            amount: auth.amount,
            payment_nonce: auth.nonce,
            valid_after: auth.valid_after,
            valid_before: auth.valid_before,
            v: auth.signature.v,
            r: auth.signature.r,
            s: auth.signature.s,
            agent_id: bundle.agent_id,
            score: bundle.score,
            rep_signature: bundle.rep_signature.clone(),
            tag2: bundle.service_tag,
            file_uri: bundle.file_uri.clone(),
        }
    }
}

impl From<WireEnvelope> for PaymentBundle {
    fn from(wire: WireEnvelope) -> Self {
        PaymentBundle {
            authorization: PaymentAuthorization {
                payer: wire.payer,
                amount: wire.amount,
                nonce: wire.payment_nonce,
                valid_after: wire.valid_after,
                valid_before: wire.valid_before,
                signature: PaymentSignature {
                    v: wire.v,
                    r: wire.r,
                    s: wire.s,
                },
            },
            agent_id: wire.agent_id,
            score: wire.score,
            rep_signature: wire.rep_signature,
            service_tag: wire.tag2,
            file_uri: wire.file_uri,
        }
    }
}

/// Serialize a bundle as compact envelope JSON.
pub fn encode_envelope(bundle: &PaymentBundle) -> String {
    // Every field is a plain scalar or string; serialization cannot fail.
    serde_json::to_string(&WireEnvelope::from(bundle)).unwrap_or_default()
}

/// Serialize a bundle as base64 envelope JSON, ready for the payment header.
pub fn encode_header(bundle: &PaymentBundle) -> String {
    base64::engine::general_purpose::STANDARD.encode(encode_envelope(bundle))
}

/// Parse an envelope from raw JSON or base64-encoded JSON.
///
/// Any missing or ill-typed field, malformed hex, or a score outside `u8`
/// yields [`DecodeError::Malformed`]. Range checks on the score (0..=100) are
/// the settlement engine's job.
pub fn decode_envelope(raw: &str) -> Result<PaymentBundle, DecodeError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DecodeError::Malformed("empty envelope".to_string()));
    }

    let json = if raw.starts_with('{') {
        raw.as_bytes().to_vec()
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(|e| DecodeError::Malformed(format!("invalid base64: {e}")))?
    };

    let wire: WireEnvelope = serde_json::from_slice(&json)
        .map_err(|e| DecodeError::Malformed(format!("invalid envelope json: {e}")))?;
    Ok(wire.into())
}

/// `keccak256` of a service category name, carried as `tag2`.
pub fn service_tag(category: &str) -> B256 {
    keccak256(category.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_bundle() -> PaymentBundle {
        PaymentBundle {
            authorization: PaymentAuthorization {
                payer: Address::repeat_byte(0x11),
                amount: U256::from(100_000u64),
                nonce: B256::repeat_byte(0x33),
                valid_after: 0,
                valid_before: 1_700_003_600,
                signature: PaymentSignature {
                    v: 28,
                    r: B256::repeat_byte(0x44),
                    s: B256::repeat_byte(0x55),
                },
            },
            agent_id: U256::from(1u64),
            score: 95,
            rep_signature: Bytes::from(vec![0xaa; 65]),
            service_tag: service_tag("weather"),
            file_uri: "ipfs://result".to_string(),
        }
    }

    fn sample_json() -> serde_json::Value {
        serde_json::from_str(&encode_envelope(&sample_bundle())).unwrap()
    }

    #[test]
    fn test_envelope_field_names() {
        let json = sample_json();
        for key in [
            "payer",
            "amount",
            "paymentNonce",
            "validAfter",
            "validBefore",
            "v",
            "r",
            "s",
            "agentId",
            "score",
            "repSignature",
            "tag2",
            "fileuri",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(json["amount"], "100000");
        assert_eq!(json["agentId"], "1");
        assert_eq!(json["score"], 95);
    }

    #[test]
    fn test_decode_accepts_raw_json_and_base64() {
        let bundle = sample_bundle();
        assert_eq!(decode_envelope(&encode_envelope(&bundle)).unwrap(), bundle);
        assert_eq!(decode_envelope(&encode_header(&bundle)).unwrap(), bundle);
    }

    #[test]
    fn test_boundary_values_survive_both_encodings() {
        let mut empty_uri = sample_bundle();
        empty_uri.file_uri = String::new();

        let mut widest = sample_bundle();
        widest.authorization.amount = U256::MAX;
        widest.authorization.valid_after = u64::MAX;
        widest.authorization.valid_before = u64::MAX;
        widest.agent_id = U256::from(u64::MAX) + U256::from(1u64);
        widest.rep_signature = Bytes::new();

        let mut unicode_uri = sample_bundle();
        unicode_uri.file_uri = "ipfs://résultat/天気.json".to_string();

        // Amounts and agent ids above 2^53 stay decimal strings on the wire.
        let json: serde_json::Value = serde_json::from_str(&encode_envelope(&widest)).unwrap();
        assert_eq!(json["amount"], U256::MAX.to_string());
        assert_eq!(json["agentId"], "18446744073709551616");

        for bundle in [empty_uri, widest, unicode_uri] {
            assert_eq!(decode_envelope(&encode_envelope(&bundle)).unwrap(), bundle);
            assert_eq!(decode_envelope(&encode_header(&bundle)).unwrap(), bundle);
        }
    }

    #[test]
    fn test_decode_accepts_numeric_amount_and_hex_agent_id() {
        let mut json = sample_json();
        json["amount"] = json!(250);
        json["agentId"] = json!("0x0a");
        let bundle = decode_envelope(&json.to_string()).unwrap();
        assert_eq!(bundle.authorization.amount, U256::from(250u64));
        assert_eq!(bundle.agent_id, U256::from(10u64));
    }

    #[test]
    fn test_missing_fileuri_defaults_to_empty() {
        let mut json = sample_json();
        json.as_object_mut().unwrap().remove("fileuri");
        let bundle = decode_envelope(&json.to_string()).unwrap();
        assert!(bundle.file_uri.is_empty());
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let mut json = sample_json();
        json.as_object_mut().unwrap().remove("paymentNonce");
        assert!(matches!(
            decode_envelope(&json.to_string()),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_bad_hex_is_malformed() {
        let mut json = sample_json();
        json["r"] = json!("0xnothex");
        assert!(matches!(
            decode_envelope(&json.to_string()),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_score_out_of_byte_range_is_malformed() {
        let mut json = sample_json();
        json["score"] = json!(300);
        assert!(matches!(
            decode_envelope(&json.to_string()),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_score_101_decodes() {
        // Fits in a byte; rejected later by the engine, not the codec.
        let mut json = sample_json();
        json["score"] = json!(101);
        assert_eq!(decode_envelope(&json.to_string()).unwrap().score, 101);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let mut json = sample_json();
        json["extension"] = json!({"note": "future field"});
        assert_eq!(decode_envelope(&json.to_string()).unwrap(), sample_bundle());
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(decode_envelope("").is_err());
        assert!(decode_envelope("!!!not base64!!!").is_err());
        assert!(decode_envelope("{not json").is_err());
    }

    #[test]
    fn test_service_tag_is_keccak_of_category() {
        assert_eq!(service_tag("weather"), keccak256(b"weather"));
        assert_ne!(service_tag("weather"), service_tag("Weather"));
    }
}
