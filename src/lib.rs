//! # x402-rpc - payment-gated RPC transport
//!
//! Gates individual JSON-RPC calls carried over HTTP POST behind x402
//! micropayments. A tower/axum layer intercepts each request before the
//! RPC endpoint dispatches it, demands and verifies a payment proof for
//! priced methods, correlates the verified proof to the RPC call id,
//! settles exactly once when the matching response is produced, and stamps
//! settlement evidence into both the response payload and the
//! `X-PAYMENT-RESPONSE` header.
//!
//! Verification and settlement are delegated to an external facilitator
//! service; this crate implements the correlation and sequencing protocol
//! around it.

pub mod correlation;
pub mod error;
pub mod facilitator;
pub mod pricing;
pub mod requirements;
pub mod rpc;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use correlation::{CorrelationStore, PendingPayment, PendingToken, SettlementOutcome};
pub use error::{Result, X402RpcError};
pub use facilitator::{Facilitator, FacilitatorClient};
pub use pricing::{Price, PricedOperation, PricingTable};
pub use requirements::RequirementBuilder;
pub use transport::{GateDecision, PaymentGate};
pub use types::*;

#[cfg(feature = "axum")]
pub use transport::{payment_gate_middleware, PaymentGateLayer};

/// Current version of the x402-rpc library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
