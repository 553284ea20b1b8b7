use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use agentpay::{DecodeError, SettlementError};
use alloy::primitives::U256;

/// Why a paid request was refused after a payment header was presented.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("payment is for agent {got}, this resource belongs to agent {expected}")]
    AgentMismatch { expected: U256, got: U256 },

    #[error("payment of {offered} is below the required {required}")]
    Underpayment { required: U256, offered: U256 },

    #[error(transparent)]
    Settlement(#[from] SettlementError),

    #[error("settlement did not complete within {0:?}")]
    Timeout(Duration),
}

impl PaymentError {
    /// Stable machine-readable reason, shared with the metrics labels.
    pub fn reason(&self) -> &'static str {
        match self {
            PaymentError::Decode(_) => "malformed_envelope",
            PaymentError::AgentMismatch { .. } => "agent_mismatch",
            PaymentError::Underpayment { .. } => "underpayment",
            PaymentError::Settlement(e) => e.reason(),
            PaymentError::Timeout(_) => "timeout",
        }
    }
}

impl ResponseError for PaymentError {
    fn status_code(&self) -> StatusCode {
        match self {
            PaymentError::Settlement(SettlementError::InternalInvariantViolation(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::FORBIDDEN,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            PaymentError::Settlement(SettlementError::InternalInvariantViolation(msg)) => {
                tracing::error!("settlement invariant violated: {}", msg);
                HttpResponse::InternalServerError().json(serde_json::json!({
                    "error": "internal_error",
                    "message": "An internal error occurred"
                }))
            }
            _ => HttpResponse::build(self.status_code()).json(serde_json::json!({
                "error": "Payment Verification Failed",
                "reason": self.reason(),
                "message": self.to_string()
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::MessageBody;

    fn body_json(resp: HttpResponse) -> serde_json::Value {
        let bytes = resp.into_body().try_into_bytes().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_validation_failures_are_403() {
        let err = PaymentError::Settlement(SettlementError::NonceReplay);
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);

        let body = body_json(err.error_response());
        assert_eq!(body["error"], "Payment Verification Failed");
        assert_eq!(body["reason"], "nonce_replay");
        assert_eq!(body["message"], "payment nonce already used");
    }

    #[test]
    fn test_timeout_is_403() {
        let err = PaymentError::Timeout(Duration::from_secs(5));
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(err.reason(), "timeout");
    }

    #[test]
    fn test_invariant_violation_is_500_and_opaque() {
        let err = PaymentError::Settlement(SettlementError::InternalInvariantViolation(
            "balance overflow".into(),
        ));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(err.error_response());
        assert_eq!(body["error"], "internal_error");
        assert!(!body.to_string().contains("overflow"));
    }

    #[test]
    fn test_underpayment_message_names_amounts() {
        let err = PaymentError::Underpayment {
            required: U256::from(100u64),
            offered: U256::from(5u64),
        };
        let msg = err.to_string();
        assert!(msg.contains("100"));
        assert!(msg.contains('5'));
    }
}
