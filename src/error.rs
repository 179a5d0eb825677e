//! Error types for the x402-rpc library

use thiserror::Error;

/// Result type alias for x402-rpc operations
pub type Result<T> = std::result::Result<T, X402RpcError>;

/// Main error type for x402-rpc operations
#[derive(Error, Debug)]
pub enum X402RpcError {
    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Base64 encoding/decoding error
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Proof header missing or ambiguous (multi-valued)
    #[error("Payment proof required")]
    ProofAbsent,

    /// Proof header present but not decodable
    #[error("Invalid proof encoding: {message}")]
    ProofMalformed { message: String },

    /// Proof does not match any advertised requirement
    #[error("No matching payment requirement for scheme '{scheme}' on network '{network}'")]
    RequirementMismatch { scheme: String, network: String },

    /// Facilitator rejected the proof, or verification could not be performed
    #[error("Payment verification failed: {reason}")]
    VerificationFailed { reason: String },

    /// Settlement failed after the RPC result was already produced
    #[error("Payment settlement failed: {reason}")]
    SettlementFailed { reason: String },

    /// Facilitator communication error
    #[error("Facilitator error: {message}")]
    FacilitatorError { message: String },

    /// A pending-payment token was never registered or was already claimed
    #[error("Unclaimed payment: {message}")]
    UnclaimedPayment { message: String },

    /// A response arrived for a call id with no matching call record
    #[error("Inconsistent claim: no call record for call id {call_id}")]
    InconsistentClaim { call_id: String },

    /// Configuration error (malformed price, bad asset, bad facilitator URL)
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl X402RpcError {
    /// True for failures the caller can correct by paying properly
    ///
    /// These surface as HTTP 402 bodies carrying the advertised
    /// requirements; everything else is a server-side fault.
    pub fn is_payment_rejection(&self) -> bool {
        matches!(
            self,
            Self::ProofAbsent
                | Self::ProofMalformed { .. }
                | Self::RequirementMismatch { .. }
                | Self::VerificationFailed { .. }
        )
    }

    /// Create a proof-malformed error
    pub fn proof_malformed(message: impl Into<String>) -> Self {
        Self::ProofMalformed {
            message: message.into(),
        }
    }

    /// Create a verification-failed error
    pub fn verification_failed(reason: impl Into<String>) -> Self {
        Self::VerificationFailed {
            reason: reason.into(),
        }
    }

    /// Create a settlement-failed error
    pub fn settlement_failed(reason: impl Into<String>) -> Self {
        Self::SettlementFailed {
            reason: reason.into(),
        }
    }

    /// Create a facilitator error
    pub fn facilitator_error(message: impl Into<String>) -> Self {
        Self::FacilitatorError {
            message: message.into(),
        }
    }

    /// Create an unclaimed-payment error
    pub fn unclaimed_payment(message: impl Into<String>) -> Self {
        Self::UnclaimedPayment {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
