//! Payment requirement builder: what a caller must pay for one operation

use crate::pricing::PricedOperation;
use crate::types::{networks, schemes, PaymentRequirements};
use crate::{Result, X402RpcError};

/// Builds [`PaymentRequirements`] for priced RPC operations
///
/// Pure function of configuration: requirements are recomputed per call
/// and never cached, so pricing changes are picked up immediately.
#[derive(Debug, Clone)]
pub struct RequirementBuilder {
    scheme: String,
    network: String,
    asset: String,
    pay_to: String,
    max_timeout_seconds: u32,
    resource_base: Option<String>,
}

impl RequirementBuilder {
    /// Create a builder for USDC on the given network, paying to `pay_to`
    ///
    /// Fails with a configuration error if the network has no known USDC
    /// deployment.
    pub fn new(network: impl Into<String>, pay_to: impl Into<String>) -> Result<Self> {
        let network = network.into();
        let asset = networks::get_usdc_address(&network)
            .ok_or_else(|| X402RpcError::config(format!("Unsupported network: {}", network)))?
            .to_string();

        Ok(Self {
            scheme: schemes::EXACT.to_string(),
            network,
            asset,
            pay_to: pay_to.into(),
            max_timeout_seconds: 60,
            resource_base: None,
        })
    }

    /// Set the advertised payment timeout in seconds
    pub fn with_max_timeout_seconds(mut self, seconds: u32) -> Self {
        self.max_timeout_seconds = seconds;
        self
    }

    /// Set a base URL used to construct resource identifiers
    pub fn with_resource_base(mut self, base: impl Into<String>) -> Self {
        self.resource_base = Some(base.into());
        self
    }

    /// Build the requirements a caller may satisfy for one operation
    ///
    /// Returns one entry per acceptable scheme/network combination; the
    /// caller satisfies *any* of them. This builder accepts exactly one
    /// scheme on one network, so the list has one element, but the
    /// contract is a list.
    pub fn build(&self, operation: &PricedOperation) -> Result<Vec<PaymentRequirements>> {
        let amount = operation
            .price
            .atomic_amount(networks::USDC_DECIMALS)?;

        let resource = match &self.resource_base {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), operation.name),
            None => format!("rpc://{}", operation.name),
        };

        let mut requirements = PaymentRequirements::new(
            &self.scheme,
            &self.network,
            amount,
            &self.asset,
            &self.pay_to,
            resource,
            format!("Payment for RPC call '{}'", operation.name),
        );
        requirements.max_timeout_seconds = self.max_timeout_seconds;
        requirements.set_usdc_info(&self.network)?;

        Ok(vec![requirements])
    }
}
