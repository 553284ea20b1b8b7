//! Source-level security invariants for the AgentPay workspace.
//!
//! Everything lives in `tests/security_invariants.rs`; this crate has no API.
