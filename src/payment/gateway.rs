//! Payment Gateway Client Seam
//!
//! The gateway owns its own wire protocol and retry policy; this crate only
//! sees the trait. Authorize is idempotent on the idempotency key: repeated
//! submissions of one logical charge return the original outcome.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::core_types::Amount;

use super::error::PaymentError;

/// Outcome of an authorize/capture call that reached the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayOutcome {
    /// Charge captured; `reference` identifies it for refund/status calls
    Approved { reference: String },
    /// Gateway answered and refused the charge (dependency is healthy)
    Declined { reason: String },
}

/// External view of a charge, for rollback verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeStatus {
    /// Money moved and has not been returned
    Settled,
    /// Charge was compensated
    Refunded,
    /// Gateway has no record of the reference
    NotFound,
}

/// Payment gateway client
///
/// Errors are transport-level: the call's outcome is unknown and the caller
/// must treat the charge as possibly landed.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Gateway name for logging and breaker identification
    fn name(&self) -> &'static str;

    /// Authorize and capture a charge, idempotent on `idempotency_key`.
    async fn authorize(
        &self,
        amount: Amount,
        currency: &str,
        idempotency_key: &str,
    ) -> Result<GatewayOutcome, PaymentError>;

    /// Refund a captured charge. Accepts a gateway reference or, for charges
    /// whose reference was never observed (timeout), the idempotency key.
    async fn refund(&self, reference: &str) -> Result<(), PaymentError>;

    /// Re-query external charge state, for rollback verification.
    async fn charge_status(&self, reference: &str) -> Result<ChargeStatus, PaymentError>;
}

#[derive(Debug, Clone)]
struct ChargeRecord {
    reference: String,
    status: ChargeStatus,
}

/// In-process gateway simulator
///
/// Default behavior approves every charge. The failure knobs drive tests and
/// fault-injection demos; they model one call each and then reset, except
/// `latency` which applies to every authorize.
pub struct SimulatedGateway {
    name: &'static str,
    /// idempotency_key -> charge
    charges: DashMap<String, ChargeRecord>,
    decline_next: DashMap<&'static str, String>,
    fail_next: DashMap<&'static str, bool>,
    latency: DashMap<&'static str, Duration>,
    counters: DashMap<&'static str, u64>,
}

impl SimulatedGateway {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            charges: DashMap::new(),
            decline_next: DashMap::new(),
            fail_next: DashMap::new(),
            latency: DashMap::new(),
            counters: DashMap::new(),
        }
    }

    /// Decline the next authorize with `reason`
    pub fn decline_next(&self, reason: &str) {
        self.decline_next.insert("authorize", reason.to_string());
    }

    /// Fail the next authorize at the transport level (outcome unknown, but
    /// the charge lands - the worst case for the caller)
    pub fn fail_next_authorize(&self) {
        self.fail_next.insert("authorize", true);
    }

    /// Fail every refund at the transport level until cleared
    pub fn set_fail_refund(&self, fail: bool) {
        if fail {
            self.fail_next.insert("refund", true);
        } else {
            self.fail_next.remove("refund");
        }
    }

    /// Delay every authorize by `latency` (drives deadline tests)
    pub fn set_latency(&self, latency: Duration) {
        self.latency.insert("authorize", latency);
    }

    pub fn authorize_count(&self) -> u64 {
        self.counters.get("authorize").map(|c| *c).unwrap_or(0)
    }

    pub fn refund_count(&self) -> u64 {
        self.counters.get("refund").map(|c| *c).unwrap_or(0)
    }

    fn bump(&self, counter: &'static str) {
        *self.counters.entry(counter).or_insert(0) += 1;
    }

    fn find_by_reference(&self, reference: &str) -> Option<(String, ChargeRecord)> {
        // Reference may be a gateway reference or an idempotency key
        if let Some(entry) = self.charges.get(reference) {
            return Some((reference.to_string(), entry.clone()));
        }
        self.charges
            .iter()
            .find(|entry| entry.reference == reference)
            .map(|entry| (entry.key().clone(), entry.clone()))
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn authorize(
        &self,
        amount: Amount,
        currency: &str,
        idempotency_key: &str,
    ) -> Result<GatewayOutcome, PaymentError> {
        self.bump("authorize");

        if let Some(latency) = self.latency.get("authorize").map(|l| *l) {
            tokio::time::sleep(latency).await;
        }

        // Idempotent replay of an already-settled charge
        if let Some(existing) = self.charges.get(idempotency_key)
            && existing.status == ChargeStatus::Settled
        {
            debug!(key = idempotency_key, "authorize replay");
            return Ok(GatewayOutcome::Approved {
                reference: existing.reference.clone(),
            });
        }

        if let Some((_, reason)) = self.decline_next.remove("authorize") {
            return Ok(GatewayOutcome::Declined { reason });
        }

        let reference = format!("ch_{}", ulid::Ulid::new());
        self.charges.insert(
            idempotency_key.to_string(),
            ChargeRecord {
                reference: reference.clone(),
                status: ChargeStatus::Settled,
            },
        );

        // Transport failure after the charge landed: outcome unknown to the
        // caller, money moved
        if self.fail_next.remove("authorize").is_some() {
            return Err(PaymentError::GatewayTimeout);
        }

        debug!(
            key = idempotency_key,
            amount = amount,
            currency = currency,
            reference = %reference,
            "charge captured"
        );
        Ok(GatewayOutcome::Approved { reference })
    }

    async fn refund(&self, reference: &str) -> Result<(), PaymentError> {
        self.bump("refund");

        if self.fail_next.get("refund").is_some() {
            return Err(PaymentError::GatewayTimeout);
        }

        match self.find_by_reference(reference) {
            Some((key, _)) => {
                if let Some(mut entry) = self.charges.get_mut(&key) {
                    entry.status = ChargeStatus::Refunded;
                }
                debug!(reference = reference, "charge refunded");
                Ok(())
            }
            // Refunding a charge the gateway never recorded is a no-op
            None => Ok(()),
        }
    }

    async fn charge_status(&self, reference: &str) -> Result<ChargeStatus, PaymentError> {
        Ok(self
            .find_by_reference(reference)
            .map(|(_, record)| record.status)
            .unwrap_or(ChargeStatus::NotFound))
    }
}
