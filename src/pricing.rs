//! Pricing table: static mapping from RPC operation name to price

use crate::{Result, X402RpcError};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;

/// A dollar-denominated price for one RPC call
///
/// Parsed once at startup; malformed price strings are configuration
/// errors, not caller-facing 402s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Price(Decimal);

impl Price {
    /// Parse a price string such as `"$0.001"` or `"0.001"`
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let digits = trimmed.strip_prefix('$').unwrap_or(trimmed);

        let amount = Decimal::from_str(digits)
            .map_err(|_| X402RpcError::config(format!("Malformed price string: '{}'", input)))?;

        if amount.is_sign_negative() {
            return Err(X402RpcError::config(format!(
                "Price cannot be negative: '{}'",
                input
            )));
        }

        Ok(Self(amount))
    }

    /// The price as a decimal dollar amount
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Convert to an atomic token amount string for an asset with the
    /// given number of decimal places
    ///
    /// Fails if the price does not divide evenly into atomic units.
    pub fn atomic_amount(&self, decimals: u32) -> Result<String> {
        let scaled = (self.0 * Decimal::from(10u64.pow(decimals))).normalize();

        if scaled.fract() != Decimal::ZERO {
            return Err(X402RpcError::config(format!(
                "Price {} is below the atomic unit of an asset with {} decimals",
                self.0, decimals
            )));
        }

        Ok(scaled.to_string())
    }
}

/// An RPC operation with its configured price
#[derive(Debug, Clone)]
pub struct PricedOperation {
    /// RPC method name
    pub name: String,
    /// Price charged per call
    pub price: Price,
}

/// Immutable lookup table from RPC method name to price
///
/// Built from configuration at startup; operations absent from the table
/// are forwarded unpriced.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    operations: HashMap<String, PricedOperation>,
}

impl PricingTable {
    /// Create an empty pricing table
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from `(method, price-string)` pairs
    ///
    /// Prices are parsed eagerly so malformed configuration fails at
    /// startup rather than on the first priced call.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut operations = HashMap::new();
        for (name, price) in pairs {
            let name = name.into();
            let price = Price::parse(price.as_ref())?;
            operations.insert(name.clone(), PricedOperation { name, price });
        }
        Ok(Self { operations })
    }

    /// Add a priced operation
    pub fn with_operation(mut self, name: impl Into<String>, price: &str) -> Result<Self> {
        let name = name.into();
        let price = Price::parse(price)?;
        self.operations.insert(name.clone(), PricedOperation { name, price });
        Ok(self)
    }

    /// Look up the price for an operation, if it is priced
    pub fn get(&self, name: &str) -> Option<&PricedOperation> {
        self.operations.get(name)
    }

    /// Whether any operations are priced at all
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
