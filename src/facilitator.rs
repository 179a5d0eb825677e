//! Facilitator boundary: payment verification and settlement

use crate::types::*;
use crate::{Result, X402RpcError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

/// Default facilitator URL
pub const DEFAULT_FACILITATOR_URL: &str = "https://x402.org/facilitator";

/// The external verification/settlement service
///
/// The gate never performs payment cryptography itself; both operations
/// are delegated across this boundary. Implemented by [`FacilitatorClient`]
/// for real deployments and by scripted doubles in tests.
#[async_trait]
pub trait Facilitator: Send + Sync {
    /// Verify a payment proof against a requirement without executing it
    async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse>;

    /// Settle a verified payment, executing the transfer
    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse>;
}

/// HTTP client for a remote x402 facilitator service
#[derive(Clone)]
pub struct FacilitatorClient {
    /// Base URL of the facilitator service
    url: String,
    /// HTTP client
    client: Client,
    /// Configuration for authentication headers
    auth_config: Option<AuthHeadersFnArc>,
}

impl std::fmt::Debug for FacilitatorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacilitatorClient")
            .field("url", &self.url)
            .field("auth_config", &"<function>")
            .finish()
    }
}

impl FacilitatorClient {
    /// Create a new facilitator client
    pub fn new(config: FacilitatorConfig) -> Result<Self> {
        config.validate()?;

        let mut client_builder = Client::builder();

        if let Some(timeout) = config.timeout {
            client_builder = client_builder.timeout(timeout);
        }

        let client = client_builder
            .build()
            .map_err(|e| X402RpcError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: config.url,
            client,
            auth_config: config.create_auth_headers,
        })
    }

    /// Get the base URL of this facilitator
    pub fn url(&self) -> &str {
        &self.url
    }

    fn auth_headers_for(&self, operation: &str) -> Result<Vec<(String, String)>> {
        let mut collected = Vec::new();
        if let Some(auth_config) = &self.auth_config {
            let headers = auth_config()?;
            if let Some(op_headers) = headers.get(operation) {
                for (key, value) in op_headers {
                    collected.push((key.clone(), value.clone()));
                }
            }
        }
        Ok(collected)
    }

    /// Get supported payment schemes and networks
    pub async fn supported(&self) -> Result<SupportedKinds> {
        let response = self
            .client
            .get(format!("{}/supported", self.url))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(X402RpcError::facilitator_error(format!(
                "Failed to get supported kinds with status: {}",
                response.status()
            )));
        }

        let supported: SupportedKinds = response.json().await?;
        Ok(supported)
    }
}

#[async_trait]
impl Facilitator for FacilitatorClient {
    async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse> {
        let request_body = json!({
            "x402Version": X402_VERSION,
            "paymentPayload": payload,
            "paymentRequirements": requirements,
        });

        let mut request = self
            .client
            .post(format!("{}/verify", self.url))
            .json(&request_body);

        for (key, value) in self.auth_headers_for("verify")? {
            request = request.header(key, value);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(X402RpcError::facilitator_error(format!(
                "Verification failed with status: {}",
                response.status()
            )));
        }

        let verify_response: VerifyResponse = response.json().await?;
        Ok(verify_response)
    }

    async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse> {
        let request_body = json!({
            "x402Version": X402_VERSION,
            "paymentPayload": payload,
            "paymentRequirements": requirements,
        });

        let mut request = self
            .client
            .post(format!("{}/settle", self.url))
            .json(&request_body);

        for (key, value) in self.auth_headers_for("settle")? {
            request = request.header(key, value);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(X402RpcError::facilitator_error(format!(
                "Settlement failed with status: {}",
                response.status()
            )));
        }

        let settle_response: SettleResponse = response.json().await?;
        Ok(settle_response)
    }
}
