use std::time::{Duration, Instant};

use actix_web::{HttpRequest, HttpResponse, ResponseError};
use agentpay::{
    decode_envelope, ChainConfig, IdentityRegistry, Ledger, SettlementEngine, SettlementReceipt,
    SignatureVerifier, FACILITATOR_NAME, PAYMENT_HEADER, PROTOCOL_NAME,
};
use alloy::primitives::U256;
use base64::Engine;

use crate::config::GatewayConfig;
use crate::error::PaymentError;
use crate::metrics::{CHALLENGES_ISSUED, REQUESTS, SETTLEMENTS, SETTLE_LATENCY};

/// What a gated route sells and how long a settlement may take.
#[derive(Debug, Clone)]
pub struct PaymentGate {
    pub agent_id: U256,
    pub service_name: String,
    /// Used when the registry lists no active service under `service_name`.
    pub fallback_price: U256,
    pub settle_timeout: Duration,
}

impl PaymentGate {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            agent_id: config.agent_id,
            service_name: config.service_name.clone(),
            fallback_price: config.service_price,
            settle_timeout: config.settle_timeout,
        }
    }
}

/// Current price of the gated service: the registry's active listing if
/// there is one, else the configured fallback.
pub async fn required_price<R: IdentityRegistry>(registry: &R, gate: &PaymentGate) -> U256 {
    match registry.get_services(gate.agent_id).await {
        Ok(services) => services
            .iter()
            .find(|s| s.active && s.name == gate.service_name)
            .map(|s| s.price)
            .unwrap_or(gate.fallback_price),
        Err(e) => {
            tracing::warn!(
                agent_id = %gate.agent_id,
                error = %e,
                "service lookup failed, using fallback price"
            );
            gate.fallback_price
        }
    }
}

/// Build the 402 Payment Required body.
pub fn challenge_body(gate: &PaymentGate, chain: &ChainConfig, price: U256) -> serde_json::Value {
    // Agent ids that fit in a JSON number are sent as one.
    let recipient = match u64::try_from(gate.agent_id) {
        Ok(id) => serde_json::json!(id),
        Err(_) => serde_json::json!(gate.agent_id.to_string()),
    };
    serde_json::json!({
        "error": "Payment Required",
        "details": {
            "protocol": PROTOCOL_NAME,
            "facilitator": FACILITATOR_NAME,
            "currency": chain.currency,
            "chainId": chain.chain_id,
            "network": chain.network,
            "token": chain.token,
            "cost": price.to_string(),
            "recipientAgentId": recipient,
            "serviceName": gate.service_name,
        }
    })
}

/// Base64 JSON receipt for the `PAYMENT-RESPONSE` header.
pub fn receipt_header(receipt: &SettlementReceipt) -> String {
    let json = serde_json::to_vec(receipt).unwrap_or_default();
    base64::engine::general_purpose::STANDARD.encode(json)
}

/// High-level payment gate: checks the header, prices the request, settles.
///
/// Returns the receipt when the payment committed, or the response to send
/// back as-is (402 challenge, 403 rejection, 500 invariant violation).
pub async fn require_payment<R, L, V>(
    req: &HttpRequest,
    engine: &SettlementEngine<R, L, V>,
    gate: &PaymentGate,
) -> Result<SettlementReceipt, HttpResponse>
where
    R: IdentityRegistry,
    L: Ledger,
    V: SignatureVerifier,
{
    // Use the matched route pattern (not raw path) to bound label cardinality
    let endpoint = req.match_pattern().unwrap_or_else(|| "unknown".to_string());
    let price = required_price(engine.registry().as_ref(), gate).await;

    let Some(header) = req.headers().get(PAYMENT_HEADER) else {
        CHALLENGES_ISSUED.inc();
        REQUESTS.with_label_values(&[endpoint.as_str(), "402"]).inc();
        return Err(HttpResponse::PaymentRequired().json(challenge_body(
            gate,
            engine.config(),
            price,
        )));
    };

    match settle_header(header.to_str().ok(), engine, gate, price).await {
        Ok(receipt) => {
            REQUESTS.with_label_values(&[endpoint.as_str(), "200"]).inc();
            Ok(receipt)
        }
        Err(e) => {
            let response = e.error_response();
            REQUESTS
                .with_label_values(&[endpoint.as_str(), response.status().as_str()])
                .inc();
            Err(response)
        }
    }
}

async fn settle_header<R, L, V>(
    header: Option<&str>,
    engine: &SettlementEngine<R, L, V>,
    gate: &PaymentGate,
    price: U256,
) -> Result<SettlementReceipt, PaymentError>
where
    R: IdentityRegistry,
    L: Ledger,
    V: SignatureVerifier,
{
    let header = header.ok_or_else(|| {
        agentpay::DecodeError::Malformed("payment header is not visible ASCII".into())
    })?;
    let bundle = decode_envelope(header).inspect_err(|e| {
        tracing::warn!(error = %e, "invalid payment header");
    })?;

    if bundle.agent_id != gate.agent_id {
        return Err(PaymentError::AgentMismatch {
            expected: gate.agent_id,
            got: bundle.agent_id,
        });
    }
    if bundle.authorization.amount < price {
        return Err(PaymentError::Underpayment {
            required: price,
            offered: bundle.authorization.amount,
        });
    }

    tracing::info!(
        payer = %bundle.authorization.payer,
        nonce = %format!("{:.8}", bundle.authorization.nonce),
        "payment attempt"
    );

    let started = Instant::now();
    let outcome = match tokio::time::timeout(gate.settle_timeout, engine.settle(&bundle)).await {
        Ok(result) => result.map_err(PaymentError::from),
        Err(_) => {
            tracing::error!(
                payer = %bundle.authorization.payer,
                nonce = %format!("{:.8}", bundle.authorization.nonce),
                timeout = ?gate.settle_timeout,
                "settlement timed out"
            );
            Err(PaymentError::Timeout(gate.settle_timeout))
        }
    };

    let label = match &outcome {
        Ok(_) => "success",
        Err(e) => e.reason(),
    };
    SETTLEMENTS.with_label_values(&[label]).inc();
    SETTLE_LATENCY
        .with_label_values(&[label])
        .observe(started.elapsed().as_secs_f64());

    outcome
}
