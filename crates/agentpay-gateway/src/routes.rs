use actix_web::{get, web, HttpRequest, HttpResponse};
use agentpay::RECEIPT_HEADER;
use subtle::ConstantTimeEq;

use crate::middleware::{challenge_body, receipt_header, require_payment, required_price};
use crate::state::AppState;

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let backend = state.engine.ledger();
    match backend.health().await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({
            "status": "ok",
            "service": "agentpay-gateway",
            "ledger": backend.name(),
        })),
        Err(e) => {
            tracing::error!(error = %e, ledger = backend.name(), "health check: ledger unreachable");
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "status": "degraded",
                "service": "agentpay-gateway",
                "ledger": backend.name(),
            }))
        }
    }
}

#[get("/metrics")]
pub async fn metrics_endpoint(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let Some(expected) = state.metrics_token.as_deref() else {
        return HttpResponse::Forbidden().json(serde_json::json!({
            "error": "forbidden",
            "message": "Set METRICS_TOKEN to access /metrics"
        }));
    };

    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| bool::from(token.as_bytes().ct_eq(expected)))
        .unwrap_or(false);

    if !authorized {
        return HttpResponse::Unauthorized().json(serde_json::json!({
            "error": "unauthorized",
            "message": "Valid Bearer token required for /metrics"
        }));
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(crate::metrics::metrics_output())
}

/// The 402 body a client would receive, served with 200 for discovery.
#[get("/challenge")]
pub async fn challenge(state: web::Data<AppState>) -> HttpResponse {
    let price = required_price(state.engine.registry().as_ref(), &state.gate).await;
    HttpResponse::Ok().json(challenge_body(&state.gate, state.engine.config(), price))
}

/// Paid demo resource.
#[get("/resource")]
pub async fn resource(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let receipt = match require_payment(&req, &state.engine, &state.gate).await {
        Ok(receipt) => receipt,
        Err(response) => return response,
    };

    HttpResponse::Ok()
        .insert_header((RECEIPT_HEADER, receipt_header(&receipt)))
        .json(serde_json::json!({
            "status": "success",
            "data": {
                "service": state.gate.service_name,
                "forecast": "Sunny, 24°C",
                "location": "Fuji testnet",
            },
            "receipt": receipt,
        }))
}
