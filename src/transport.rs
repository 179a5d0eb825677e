//! Payment-gated transport: the per-call gate in front of an RPC endpoint
//!
//! One HTTP request moves through a fixed sequence: parse the body to find
//! the called method, decide whether it is priced, demand and verify a
//! proof, register the verified payment against the call id, dispatch the
//! untouched request to the RPC endpoint, and on the way back settle the
//! payment and stamp the evidence into the response before its headers are
//! emitted. Payment-protocol failures are HTTP 402s that short-circuit
//! before the RPC layer ever sees the request; settlement failures never
//! block or corrupt an already-computed result.

use crate::correlation::{CorrelationStore, PendingPayment, SettlementOutcome};
use crate::facilitator::Facilitator;
use crate::pricing::PricingTable;
use crate::requirements::RequirementBuilder;
use crate::rpc::{InboundCall, RpcCallId, RpcResponse};
use crate::types::{
    headers, PaymentPayload, PaymentRequiredResponse, PaymentRequirements, SettlementInfo,
};
use crate::{Result, X402RpcError};
use http::{HeaderMap, HeaderValue};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of gating one inbound HTTP request
#[derive(Debug)]
pub enum GateDecision {
    /// Not a call to a priced operation; forward untouched, the
    /// facilitator is never consulted
    Passthrough,
    /// Proof verified; `call_id` is present when the payment is tracked
    /// through to settlement
    Verified { call_id: Option<RpcCallId> },
    /// Payment required or rejected; respond 402 with this body
    Reject(Box<PaymentRequiredResponse>),
}

/// Result of settling against one outbound response
pub struct FinalizedResponse {
    /// Response body to deliver, possibly stamped with settlement evidence
    pub body: Vec<u8>,
    /// Base64 settlement evidence for the `X-PAYMENT-RESPONSE` header
    pub evidence: Option<String>,
}

struct GateInner {
    pricing: PricingTable,
    requirements: RequirementBuilder,
    facilitator: Arc<dyn Facilitator>,
    store: CorrelationStore,
}

/// The payment gate shared across requests
///
/// Cheap to clone; all state lives behind an `Arc`. The correlation store
/// is the only shared mutable state and keys every in-flight call
/// independently, so concurrent requests never interfere.
#[derive(Clone)]
pub struct PaymentGate {
    inner: Arc<GateInner>,
}

impl PaymentGate {
    /// Create a gate from a pricing table, a requirement builder and a
    /// facilitator
    pub fn new(
        pricing: PricingTable,
        requirements: RequirementBuilder,
        facilitator: Arc<dyn Facilitator>,
    ) -> Self {
        Self {
            inner: Arc::new(GateInner {
                pricing,
                requirements,
                facilitator,
                store: CorrelationStore::new(),
            }),
        }
    }

    /// Access the correlation store
    pub fn store(&self) -> &CorrelationStore {
        &self.inner.store
    }

    /// Gate one inbound request: decide passthrough, verified dispatch, or
    /// 402 rejection
    ///
    /// Only configuration faults (malformed prices) surface as errors;
    /// every caller-correctable failure is a [`GateDecision::Reject`].
    pub async fn evaluate_request(
        &self,
        request_headers: &HeaderMap,
        body: &[u8],
    ) -> Result<GateDecision> {
        let call = match InboundCall::from_body(body) {
            Some(call) => call,
            None => {
                debug!("request body is not a single RPC call, forwarding");
                return Ok(GateDecision::Passthrough);
            }
        };

        let operation = match self.inner.pricing.get(&call.method) {
            Some(operation) => operation.clone(),
            None => {
                debug!(method = %call.method, "unpriced method, forwarding");
                return Ok(GateDecision::Passthrough);
            }
        };

        // Config errors propagate; they are server faults, not 402s.
        let accepts = self.inner.requirements.build(&operation)?;

        let (proof, requirement) = match self.authorize(request_headers, &accepts).await {
            Ok(authorized) => authorized,
            Err(e) if e.is_payment_rejection() => {
                debug!(method = %call.method, reason = %e, "payment rejected");
                return Ok(GateDecision::Reject(Box::new(PaymentRequiredResponse::new(
                    e.to_string(),
                    accepts,
                ))));
            }
            Err(e) => return Err(e),
        };

        let token = self.inner.store.begin_pending(PendingPayment {
            proof,
            operation,
            requirement,
        });

        let call_id = match call.id {
            Some(call_id) => match self.inner.store.claim(token, call_id.clone()) {
                Ok(()) => {
                    info!(method = %call.method, call_id = %call_id, "payment verified and claimed");
                    Some(call_id)
                }
                Err(e) => {
                    // Defensive: the call proceeds without payment
                    // tracking and will never be settled.
                    warn!(method = %call.method, call_id = %call_id, error = %e,
                        "claim failed, call proceeds untracked");
                    self.inner.store.abandon(token);
                    None
                }
            },
            None => {
                warn!(method = %call.method,
                    "priced call carries no id; verified but untracked, will not settle");
                self.inner.store.abandon(token);
                None
            }
        };

        Ok(GateDecision::Verified { call_id })
    }

    /// Check the proof header against the advertised requirements
    ///
    /// Failures that the caller can correct come back as payment
    /// rejections; a facilitator fault during verification counts as one
    /// too, since the caller's money never moved.
    async fn authorize(
        &self,
        request_headers: &HeaderMap,
        accepts: &[PaymentRequirements],
    ) -> Result<(PaymentPayload, PaymentRequirements)> {
        let proof_header = single_proof_header(request_headers).ok_or(X402RpcError::ProofAbsent)?;
        let proof = decode_proof(proof_header)?;

        let requirement = accepts
            .iter()
            .find(|r| r.matches(&proof.scheme, &proof.network))
            .cloned()
            .ok_or_else(|| X402RpcError::RequirementMismatch {
                scheme: proof.scheme.clone(),
                network: proof.network.clone(),
            })?;

        let verdict = self
            .inner
            .facilitator
            .verify(&proof, &requirement)
            .await
            .map_err(|e| X402RpcError::verification_failed(e.to_string()))?;

        if !verdict.is_valid {
            return Err(X402RpcError::verification_failed(
                verdict
                    .invalid_reason
                    .unwrap_or_else(|| "proof rejected by facilitator".to_string()),
            ));
        }

        Ok((proof, requirement))
    }

    /// Settle against the outbound response for a tracked call
    ///
    /// Failed calls are never charged: a JSON-RPC error response skips
    /// settlement entirely. A settlement failure is recorded and logged but
    /// the caller still receives their result unmodified.
    pub async fn finalize_response(
        &self,
        call_id: &RpcCallId,
        response_body: &[u8],
    ) -> FinalizedResponse {
        let unmodified = |body: &[u8]| FinalizedResponse {
            body: body.to_vec(),
            evidence: None,
        };

        let mut response = match RpcResponse::from_body(response_body) {
            Some(response) => response,
            None => {
                warn!(call_id = %call_id, "unrecognizable response body, not settling");
                self.inner.store.record_settlement(
                    call_id,
                    SettlementOutcome::failed("response not recognizable"),
                );
                return unmodified(response_body);
            }
        };

        if let Some(response_id) = &response.id {
            if response_id != call_id {
                warn!(call_id = %call_id, response_id = %response_id,
                    "response id does not match tracked call id");
                self.inner
                    .store
                    .record_settlement(call_id, SettlementOutcome::failed("response id mismatch"));
                return unmodified(response_body);
            }
        }

        if response.is_error() {
            debug!(call_id = %call_id, "error response, skipping settlement");
            self.inner
                .store
                .record_settlement(call_id, SettlementOutcome::failed("response is an error"));
            return unmodified(response_body);
        }

        let record = match self.inner.store.lookup(call_id) {
            Some(record) => record,
            None => {
                // Defensive: the response is delivered, just unpaid.
                let e = X402RpcError::InconsistentClaim {
                    call_id: call_id.to_string(),
                };
                warn!(error = %e, "delivering response unsettled");
                return unmodified(response_body);
            }
        };

        let settle_response = match self
            .inner
            .facilitator
            .settle(&record.pending.proof, &record.pending.requirement)
            .await
        {
            Ok(settle_response) if settle_response.success => settle_response,
            Ok(settle_response) => {
                let e = X402RpcError::settlement_failed(
                    settle_response
                        .error_reason
                        .unwrap_or_else(|| "settlement rejected".to_string()),
                );
                warn!(call_id = %call_id, error = %e, "not charging for delivered result");
                self.inner
                    .store
                    .record_settlement(call_id, SettlementOutcome::failed(e.to_string()));
                return unmodified(response_body);
            }
            Err(e) => {
                let e = X402RpcError::settlement_failed(e.to_string());
                warn!(call_id = %call_id, error = %e, "not charging for delivered result");
                self.inner
                    .store
                    .record_settlement(call_id, SettlementOutcome::failed(e.to_string()));
                return unmodified(response_body);
            }
        };

        info!(call_id = %call_id, transaction = %settle_response.transaction, "payment settled");
        self.inner.store.record_settlement(
            call_id,
            SettlementOutcome::settled(settle_response.transaction.clone()),
        );

        let info = SettlementInfo::from(&settle_response);
        let stamped = response.stamp_settlement(&info).unwrap_or(false);
        if !stamped {
            debug!(call_id = %call_id, "result not object-shaped, evidence travels in header only");
        }

        let body = match response.into_bytes() {
            Ok(body) => body,
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "failed to re-serialize stamped response");
                return unmodified(response_body);
            }
        };

        FinalizedResponse {
            body,
            evidence: settle_response.to_base64().ok(),
        }
    }
}

/// Extract the proof header if it is present exactly once
///
/// A multi-valued proof header is ambiguous and treated as absent.
fn single_proof_header(request_headers: &HeaderMap) -> Option<&HeaderValue> {
    let mut values = request_headers.get_all(headers::X_PAYMENT).iter();
    let first = values.next()?;
    if values.next().is_some() {
        warn!("multiple proof headers present, treating as absent");
        return None;
    }
    Some(first)
}

fn decode_proof(value: &HeaderValue) -> Result<PaymentPayload> {
    let encoded = value
        .to_str()
        .map_err(|_| X402RpcError::proof_malformed("proof header is not ASCII"))?;
    PaymentPayload::from_base64(encoded)
        .map_err(|e| X402RpcError::proof_malformed(e.to_string()))
}

#[cfg(feature = "axum")]
mod axum_integration {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        extract::{Request, State},
        http::StatusCode,
        middleware::Next,
        response::{IntoResponse, Response},
        Json,
    };
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Upper bound on buffered request/response bodies
    const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

    /// Scopes correlation-store state to one tracked call
    ///
    /// On drop, any claim the call never settled is released and its
    /// ledger entry is cleared, so the store only ever holds state for
    /// calls that are actually in flight.
    struct ClaimGuard {
        gate: PaymentGate,
        call_id: RpcCallId,
    }

    impl Drop for ClaimGuard {
        fn drop(&mut self) {
            let store = &self.gate.inner.store;
            if store.release(&self.call_id).is_some() {
                warn!(call_id = %self.call_id, "call abandoned before settlement, claim released");
            }
            store.forget_settlement(&self.call_id);
        }
    }

    impl PaymentGate {
        /// Tower layer applying this gate to a service
        pub fn layer(&self) -> PaymentGateLayer {
            PaymentGateLayer { gate: self.clone() }
        }

        /// Run one request through the gate, dispatching via `dispatch`
        async fn run<E, F, Fut>(&self, request: Request, dispatch: F) -> std::result::Result<Response, E>
        where
            F: FnOnce(Request) -> Fut,
            Fut: Future<Output = std::result::Result<Response, E>>,
        {
            if request.method() != http::Method::POST {
                return dispatch(request).await;
            }

            let (parts, body) = request.into_parts();
            let body_bytes = match to_bytes(body, MAX_BODY_BYTES).await {
                Ok(bytes) => bytes,
                Err(_) => {
                    return Ok((StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
                        .into_response())
                }
            };

            let decision = match self.evaluate_request(&parts.headers, &body_bytes).await {
                Ok(decision) => decision,
                Err(e) => {
                    // Configuration faults are server errors, never 402s.
                    warn!(error = %e, "payment gate configuration fault");
                    return Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response());
                }
            };

            let call_id = match decision {
                GateDecision::Reject(rejection) => {
                    return Ok(
                        (StatusCode::PAYMENT_REQUIRED, Json(*rejection)).into_response()
                    );
                }
                GateDecision::Passthrough => None,
                GateDecision::Verified { call_id } => call_id,
            };

            // Forward the original request byte-identical. The guard
            // releases the claim if the call never reaches settlement
            // (dispatch failure, dropped connection) and clears the
            // ledger entry once the call is over.
            let request = Request::from_parts(parts, Body::from(body_bytes));
            let guard = call_id.map(|call_id| ClaimGuard {
                gate: self.clone(),
                call_id,
            });

            let response = dispatch(request).await?;

            let guard = match guard {
                Some(guard) => guard,
                None => return Ok(response),
            };
            let call_id = &guard.call_id;

            let (mut parts, body) = response.into_parts();

            // An oversized result is delivered as-is; the caller keeps
            // their answer and keeps their money.
            let declared_len = parts
                .headers
                .get(http::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<usize>().ok());
            if declared_len.map_or(false, |len| len > MAX_BODY_BYTES) {
                warn!(call_id = %call_id, "response too large to settle against, delivering unsettled");
                self.inner.store.record_settlement(
                    call_id,
                    SettlementOutcome::failed("response too large to settle against"),
                );
                return Ok(Response::from_parts(parts, body));
            }

            let response_bytes = match to_bytes(body, MAX_BODY_BYTES).await {
                Ok(bytes) => bytes,
                Err(_) => {
                    // Undeclared length and the stream outgrew the buffer;
                    // the bytes are gone, but the caller is not charged.
                    warn!(call_id = %call_id, "response stream exceeded the buffer limit");
                    self.inner.store.record_settlement(
                        call_id,
                        SettlementOutcome::failed("response too large to settle against"),
                    );
                    return Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response());
                }
            };

            let finalized = self.finalize_response(call_id, &response_bytes).await;

            // The body may have grown; the old length is stale either way.
            parts.headers.remove(http::header::CONTENT_LENGTH);
            if let Some(evidence) = finalized
                .evidence
                .as_deref()
                .and_then(|e| HeaderValue::from_str(e).ok())
            {
                parts.headers.insert(headers::X_PAYMENT_RESPONSE, evidence);
            }

            Ok(Response::from_parts(parts, Body::from(finalized.body)))
        }
    }

    /// Axum middleware function for [`axum::middleware::from_fn_with_state`]
    pub async fn payment_gate_middleware(
        State(gate): State<PaymentGate>,
        request: Request,
        next: Next,
    ) -> Response {
        let result: std::result::Result<Response, std::convert::Infallible> = gate
            .run(request, |request| async move { Ok(next.run(request).await) })
            .await;
        match result {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }

    /// Tower layer wrapping a service in the payment gate
    #[derive(Clone)]
    pub struct PaymentGateLayer {
        gate: PaymentGate,
    }

    impl<S> tower::Layer<S> for PaymentGateLayer {
        type Service = PaymentGateService<S>;

        fn layer(&self, inner: S) -> Self::Service {
            PaymentGateService {
                inner,
                gate: self.gate.clone(),
            }
        }
    }

    /// Tower service produced by [`PaymentGateLayer`]
    #[derive(Clone)]
    pub struct PaymentGateService<S> {
        inner: S,
        gate: PaymentGate,
    }

    impl<S> tower::Service<Request> for PaymentGateService<S>
    where
        S: tower::Service<Request, Response = Response> + Clone + Send + 'static,
        S::Future: Send,
        S::Error: Send,
    {
        type Response = Response;
        type Error = S::Error;
        type Future =
            Pin<Box<dyn Future<Output = std::result::Result<Response, S::Error>> + Send>>;

        fn poll_ready(
            &mut self,
            cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            self.inner.poll_ready(cx)
        }

        fn call(&mut self, request: Request) -> Self::Future {
            let gate = self.gate.clone();
            // The clone takes over; the original stays ready.
            let clone = self.inner.clone();
            let mut inner = std::mem::replace(&mut self.inner, clone);

            Box::pin(async move { gate.run(request, |request| inner.call(request)).await })
        }
    }
}

#[cfg(feature = "axum")]
pub use axum_integration::{payment_gate_middleware, PaymentGateLayer, PaymentGateService};
