//! Correlation store: verified payments tracked across one call's lifetime
//!
//! A verified proof is registered the instant verification succeeds, bound
//! to the RPC call id once that id is observable, and consumed when the
//! matching response is settled. Every in-flight call owns an independent
//! entry keyed by a minted token, so concurrent requests never share state.

use crate::pricing::PricedOperation;
use crate::rpc::RpcCallId;
use crate::types::{PaymentPayload, PaymentRequirements};
use crate::{Result, X402RpcError};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// A verified-but-uncommitted payment
///
/// The caller has proven funds for this specific call, but the call has not
/// yet produced a result.
#[derive(Debug, Clone)]
pub struct PendingPayment {
    /// The caller's verified proof
    pub proof: PaymentPayload,
    /// The priced operation being called
    pub operation: PricedOperation,
    /// The requirement the proof was verified against
    pub requirement: PaymentRequirements,
}

/// Token handed out by [`CorrelationStore::begin_pending`]
///
/// Minted per call; the index into the pending arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingToken(Uuid);

/// A pending payment bound to its RPC call id
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// RPC-level identifier correlating request to response
    pub call_id: RpcCallId,
    /// The payment awaiting settlement
    pub pending: PendingPayment,
}

/// The recorded outcome of a settlement attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementOutcome {
    /// Transaction reference when settlement succeeded
    pub transaction: Option<String>,
    /// Error description when settlement was skipped or failed
    pub error: Option<String>,
}

impl SettlementOutcome {
    /// A successful settlement with its transaction reference
    pub fn settled(transaction: impl Into<String>) -> Self {
        Self {
            transaction: Some(transaction.into()),
            error: None,
        }
    }

    /// A failed or skipped settlement
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            transaction: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Default)]
struct StoreInner {
    pending: HashMap<Uuid, PendingPayment>,
    claimed: HashMap<RpcCallId, CallRecord>,
    settled: HashMap<RpcCallId, SettlementOutcome>,
}

/// In-memory map from in-flight call to verified-payment state, plus the
/// settlement ledger that makes settlement at-most-once per call id
#[derive(Default)]
pub struct CorrelationStore {
    inner: Mutex<StoreInner>,
}

impl CorrelationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a verified-but-uncommitted payment
    ///
    /// Safe to call concurrently for unrelated calls; each gets an
    /// independent token.
    pub fn begin_pending(&self, pending: PendingPayment) -> PendingToken {
        let token = PendingToken(Uuid::new_v4());
        self.inner
            .lock()
            .expect("correlation store poisoned")
            .pending
            .insert(token.0, pending);
        token
    }

    /// Bind a pending payment to its RPC call id, consuming the token
    ///
    /// At most one call record may exist per call id; claiming an unknown
    /// or already-consumed token fails, as does claiming onto an occupied
    /// call id.
    pub fn claim(&self, token: PendingToken, call_id: RpcCallId) -> Result<()> {
        let mut inner = self.inner.lock().expect("correlation store poisoned");

        if inner.claimed.contains_key(&call_id) {
            return Err(X402RpcError::unclaimed_payment(format!(
                "call id {} already has a claimed payment",
                call_id
            )));
        }

        let pending = inner.pending.remove(&token.0).ok_or_else(|| {
            X402RpcError::unclaimed_payment("token was never registered or was already claimed")
        })?;

        inner
            .claimed
            .insert(call_id.clone(), CallRecord { call_id, pending });
        Ok(())
    }

    /// Look up the call record for an in-flight call id
    pub fn lookup(&self, call_id: &RpcCallId) -> Option<CallRecord> {
        self.inner
            .lock()
            .expect("correlation store poisoned")
            .claimed
            .get(call_id)
            .cloned()
    }

    /// Record the settlement outcome for a call id
    ///
    /// First write wins: a second call for the same id is a no-op that
    /// returns the first outcome. Recording releases the call record; the
    /// ledger entry is what prevents a second settlement attempt.
    pub fn record_settlement(
        &self,
        call_id: &RpcCallId,
        outcome: SettlementOutcome,
    ) -> SettlementOutcome {
        let mut inner = self.inner.lock().expect("correlation store poisoned");

        if let Some(existing) = inner.settled.get(call_id) {
            return existing.clone();
        }

        inner.claimed.remove(call_id);
        inner.settled.insert(call_id.clone(), outcome.clone());
        outcome
    }

    /// The recorded settlement outcome for a call id, if any
    pub fn settlement(&self, call_id: &RpcCallId) -> Option<SettlementOutcome> {
        self.inner
            .lock()
            .expect("correlation store poisoned")
            .settled
            .get(call_id)
            .cloned()
    }

    /// Remove the call record for a call id without recording an outcome
    ///
    /// Used when the call is abandoned mid-flight (dispatch failure,
    /// dropped connection) and no settlement will ever be attempted.
    pub fn release(&self, call_id: &RpcCallId) -> Option<CallRecord> {
        self.inner
            .lock()
            .expect("correlation store poisoned")
            .claimed
            .remove(call_id)
    }

    /// Drop the ledger entry for a completed call
    ///
    /// The ledger guards against a second settlement attempt while the
    /// call is in flight; once the response has been delivered the entry
    /// has done its job.
    pub fn forget_settlement(&self, call_id: &RpcCallId) {
        self.inner
            .lock()
            .expect("correlation store poisoned")
            .settled
            .remove(call_id);
    }

    /// Number of verified payments currently tracked, pending or claimed
    pub fn in_flight(&self) -> usize {
        let inner = self.inner.lock().expect("correlation store poisoned");
        inner.pending.len() + inner.claimed.len()
    }

    /// Number of settlement outcomes currently retained in the ledger
    pub fn ledger_len(&self) -> usize {
        self.inner
            .lock()
            .expect("correlation store poisoned")
            .settled
            .len()
    }

    /// Drop a pending payment that will never be claimed
    ///
    /// Used when the call carries no correlatable id; verified but never
    /// settled is the safe failure direction for the caller.
    pub fn abandon(&self, token: PendingToken) {
        self.inner
            .lock()
            .expect("correlation store poisoned")
            .pending
            .remove(&token.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::PricingTable;
    use crate::types::{ExactEvmPayload, ExactEvmPayloadAuthorization};

    fn pending(value: &str, nonce: &str) -> PendingPayment {
        let authorization = ExactEvmPayloadAuthorization::new(
            "0xpayer", "0xpayee", value, "0", "9999999999", nonce,
        );
        let proof = PaymentPayload::new(
            "exact",
            "base-sepolia",
            ExactEvmPayload {
                signature: "0xsig".to_string(),
                authorization,
            },
        );
        let table = PricingTable::from_pairs([("list", "$0.001")]).unwrap();
        let operation = table.get("list").unwrap().clone();
        let requirement = PaymentRequirements::new(
            "exact",
            "base-sepolia",
            value,
            "0xasset",
            "0xpayee",
            "rpc://list",
            "Payment for RPC call 'list'",
        );
        PendingPayment {
            proof,
            operation,
            requirement,
        }
    }

    #[test]
    fn test_begin_claim_lookup() {
        let store = CorrelationStore::new();
        let token = store.begin_pending(pending("1000", "0x01"));

        let call_id = RpcCallId::Number(1);
        store.claim(token, call_id.clone()).unwrap();

        let record = store.lookup(&call_id).unwrap();
        assert_eq!(record.pending.proof.payload.authorization.value, "1000");
    }

    #[test]
    fn test_claim_unknown_token_fails() {
        let store = CorrelationStore::new();
        let token = store.begin_pending(pending("1000", "0x01"));
        store.abandon(token);

        let err = store.claim(token, RpcCallId::Number(1)).unwrap_err();
        assert!(matches!(err, X402RpcError::UnclaimedPayment { .. }));
    }

    #[test]
    fn test_claim_twice_fails() {
        let store = CorrelationStore::new();
        let token = store.begin_pending(pending("1000", "0x01"));

        store.claim(token, RpcCallId::Number(1)).unwrap();
        let err = store.claim(token, RpcCallId::Number(2)).unwrap_err();
        assert!(matches!(err, X402RpcError::UnclaimedPayment { .. }));
    }

    #[test]
    fn test_call_id_claimed_at_most_once() {
        let store = CorrelationStore::new();
        let first = store.begin_pending(pending("1000", "0x01"));
        let second = store.begin_pending(pending("2000", "0x02"));

        let call_id = RpcCallId::Number(1);
        store.claim(first, call_id.clone()).unwrap();
        let err = store.claim(second, call_id.clone()).unwrap_err();
        assert!(matches!(err, X402RpcError::UnclaimedPayment { .. }));

        // the original binding is untouched
        let record = store.lookup(&call_id).unwrap();
        assert_eq!(record.pending.proof.payload.authorization.value, "1000");
    }

    #[test]
    fn test_concurrent_entries_are_independent() {
        let store = CorrelationStore::new();
        let a = store.begin_pending(pending("1000", "0x01"));
        let b = store.begin_pending(pending("2000", "0x02"));

        store.claim(a, RpcCallId::Number(1)).unwrap();
        store.claim(b, RpcCallId::Number(2)).unwrap();

        let record_a = store.lookup(&RpcCallId::Number(1)).unwrap();
        let record_b = store.lookup(&RpcCallId::Number(2)).unwrap();
        assert_eq!(record_a.pending.proof.payload.authorization.value, "1000");
        assert_eq!(record_b.pending.proof.payload.authorization.value, "2000");
    }

    #[test]
    fn test_record_settlement_is_idempotent() {
        let store = CorrelationStore::new();
        let token = store.begin_pending(pending("1000", "0x01"));
        let call_id = RpcCallId::Number(1);
        store.claim(token, call_id.clone()).unwrap();

        let first = store.record_settlement(&call_id, SettlementOutcome::settled("0xtx1"));
        assert_eq!(first.transaction, Some("0xtx1".to_string()));

        let second = store.record_settlement(&call_id, SettlementOutcome::settled("0xtx2"));
        assert_eq!(second.transaction, Some("0xtx1".to_string()));

        assert_eq!(store.settlement(&call_id), Some(first));
    }

    #[test]
    fn test_settlement_releases_call_record() {
        let store = CorrelationStore::new();
        let token = store.begin_pending(pending("1000", "0x01"));
        let call_id = RpcCallId::Number(1);
        store.claim(token, call_id.clone()).unwrap();

        store.record_settlement(&call_id, SettlementOutcome::failed("response is an error"));
        assert!(store.lookup(&call_id).is_none());
    }

    #[test]
    fn test_release_drops_the_claim_without_an_outcome() {
        let store = CorrelationStore::new();
        let token = store.begin_pending(pending("1000", "0x01"));
        let call_id = RpcCallId::Number(1);
        store.claim(token, call_id.clone()).unwrap();

        let record = store.release(&call_id).unwrap();
        assert_eq!(record.call_id, call_id);
        assert!(store.lookup(&call_id).is_none());
        assert!(store.settlement(&call_id).is_none());
        assert_eq!(store.in_flight(), 0);
    }

    #[test]
    fn test_forget_settlement_empties_the_ledger() {
        let store = CorrelationStore::new();
        let token = store.begin_pending(pending("1000", "0x01"));
        let call_id = RpcCallId::Number(1);
        store.claim(token, call_id.clone()).unwrap();
        store.record_settlement(&call_id, SettlementOutcome::settled("0xtx1"));

        assert_eq!(store.ledger_len(), 1);
        store.forget_settlement(&call_id);
        assert_eq!(store.ledger_len(), 0);
        assert!(store.settlement(&call_id).is_none());
    }

    #[test]
    fn test_abandon_releases_the_pending_entry() {
        let store = CorrelationStore::new();
        let token = store.begin_pending(pending("1000", "0x01"));
        assert_eq!(store.in_flight(), 1);

        store.abandon(token);
        assert_eq!(store.in_flight(), 0);
    }
}
