//! RPC layer boundary: JSON-RPC 2.0 framing as observed by the gate
//!
//! The gate wraps the RPC endpoint, it never replaces it. Everything here
//! reads or annotates the bytes that already flow past: the inbound call
//! (method name and call id) and the outbound response (success or error,
//! and where settlement evidence gets stamped).

use crate::types::SettlementInfo;
use crate::Result;
use serde_json::Value;

/// JSON-RPC call identifier correlating one request to its one response
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RpcCallId {
    /// Integer id
    Number(i64),
    /// String id
    Text(String),
}

impl RpcCallId {
    /// Extract a call id from a JSON-RPC `id` member
    ///
    /// Null and fractional ids are not correlatable and yield `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Number),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }
}

impl std::fmt::Display for RpcCallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

/// An inbound JSON-RPC call as parsed from a POST body
#[derive(Debug, Clone)]
pub struct InboundCall {
    /// Call id; `None` for notifications, which have no response to
    /// correlate and therefore can never be settled
    pub id: Option<RpcCallId>,
    /// RPC method name, the unit of pricing
    pub method: String,
}

impl InboundCall {
    /// Parse a request body as a single JSON-RPC call
    ///
    /// Returns `None` for anything that is not a call: non-JSON bodies,
    /// batches, and objects without a string `method`. Those are forwarded
    /// untouched.
    pub fn from_body(body: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(body).ok()?;
        let object = value.as_object()?;
        let method = object.get("method")?.as_str()?.to_string();
        let id = object.get("id").and_then(RpcCallId::from_value);
        Some(Self { id, method })
    }
}

/// An outbound JSON-RPC response as parsed from the endpoint's reply
#[derive(Debug, Clone)]
pub struct RpcResponse {
    /// Call id this response answers, when correlatable
    pub id: Option<RpcCallId>,
    payload: Value,
}

impl RpcResponse {
    /// Parse a response body as a single JSON-RPC response
    ///
    /// Returns `None` for bodies that are not response objects (batches,
    /// non-JSON); the gate forwards those unmodified and unsettled.
    pub fn from_body(body: &[u8]) -> Option<Self> {
        let payload: Value = serde_json::from_slice(body).ok()?;
        if !payload.is_object() {
            return None;
        }
        let id = payload.get("id").and_then(RpcCallId::from_value);
        Some(Self { id, payload })
    }

    /// Whether this is a JSON-RPC error response
    ///
    /// Error responses are never charged.
    pub fn is_error(&self) -> bool {
        self.payload
            .get("error")
            .map(|e| !e.is_null())
            .unwrap_or(false)
    }

    /// Stamp settlement evidence into the result payload
    ///
    /// The `settlement` field is inserted into an object-shaped `result`.
    /// Scalar and array results are left untouched; the evidence header
    /// still carries the settle response in that case. Returns whether the
    /// payload was modified.
    pub fn stamp_settlement(&mut self, info: &SettlementInfo) -> Result<bool> {
        let settlement = serde_json::to_value(info)?;
        match self.payload.get_mut("result").and_then(Value::as_object_mut) {
            Some(result) => {
                result.insert("settlement".to_string(), settlement);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Serialize the (possibly stamped) response back to bytes
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.payload)?)
    }

    /// Borrow the underlying payload
    pub fn payload(&self) -> &Value {
        &self.payload
    }
}
