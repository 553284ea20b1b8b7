//! HTTP paywall for AgentPay.
//!
//! Requests without an `X-PAYMENT` header get a 402 challenge naming the
//! agent, service and price. Requests with one are decoded, checked against
//! the gated agent and current price, and settled through a
//! [`agentpay::SettlementEngine`] before the resource is served. The handler
//! receives the [`agentpay::SettlementReceipt`] explicitly and echoes it in
//! the `PAYMENT-RESPONSE` header.

pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::{GatewayConfig, LedgerBackend};
pub use error::PaymentError;
pub use middleware::{require_payment, PaymentGate};
pub use state::{AppState, Backend};
