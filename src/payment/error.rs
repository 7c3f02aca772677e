//! Payment Error Types
//!
//! One taxonomy for the whole payment subsystem. Validation and state errors
//! surface immediately and are non-retryable; concurrency and availability
//! errors carry a retry-after hint; upstream errors drive the rollback path.

use std::time::Duration;

use thiserror::Error;

use super::state_machine::OrderState;
use super::types::{RollbackId, TransactionId};

/// Payment error taxonomy
///
/// Error codes are stable strings used in API responses and log fields.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PaymentError {
    // === Concurrency ===
    #[error("payment lock held for key {key}")]
    Busy { key: String, retry_after: Duration },

    // === Availability ===
    #[error("circuit open for dependency {dependency}")]
    FailFast {
        dependency: String,
        retry_after: Duration,
    },

    // === Validation ===
    #[error("validation failed on {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    // === State ===
    #[error("invalid order transition {from} -> {to}")]
    InvalidTransition { from: OrderState, to: OrderState },

    #[error("transaction {transaction_id} already finalized")]
    AlreadyFinalized { transaction_id: TransactionId },

    // === Consistency ===
    #[error("write conflict on {key}")]
    TransactionConflict { key: String },

    #[error("rollback {rollback_id} left a dangling side effect")]
    RollbackVerificationFailed { rollback_id: RollbackId },

    // === Upstream ===
    #[error("gateway rejected charge: {reason}")]
    GatewayRejected { reason: String },

    #[error("gateway call exceeded its deadline")]
    GatewayTimeout,

    // === System ===
    #[error("request cancelled before transaction begin")]
    Cancelled,

    #[error("transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    #[error("rollback point not found: {0}")]
    RollbackNotFound(RollbackId),

    #[error("backing store error: {0}")]
    Store(String),
}

impl PaymentError {
    /// Stable error code for API responses and log fields
    pub fn code(&self) -> &'static str {
        match self {
            PaymentError::Busy { .. } => "BUSY",
            PaymentError::FailFast { .. } => "FAIL_FAST",
            PaymentError::Validation { .. } => "VALIDATION_FAILED",
            PaymentError::InvalidTransition { .. } => "INVALID_TRANSITION",
            PaymentError::AlreadyFinalized { .. } => "ALREADY_FINALIZED",
            PaymentError::TransactionConflict { .. } => "TRANSACTION_CONFLICT",
            PaymentError::RollbackVerificationFailed { .. } => "ROLLBACK_VERIFICATION_FAILED",
            PaymentError::GatewayRejected { .. } => "GATEWAY_REJECTED",
            PaymentError::GatewayTimeout => "GATEWAY_TIMEOUT",
            PaymentError::Cancelled => "CANCELLED",
            PaymentError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            PaymentError::RollbackNotFound(_) => "ROLLBACK_NOT_FOUND",
            PaymentError::Store(_) => "STORE_ERROR",
        }
    }

    /// Retry hint for errors the caller may retry after backing off.
    ///
    /// `None` means the error is not retryable as-is.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PaymentError::Busy { retry_after, .. } => Some(*retry_after),
            PaymentError::FailFast { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whether this error drives the compensating-rollback path
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            PaymentError::GatewayRejected { .. } | PaymentError::GatewayTimeout
        )
    }
}

/// Terminal failure surfaced by the orchestrator.
///
/// Every surfaced failure carries the idempotency key and, when the protocol
/// got that far, the transaction and rollback identifiers, so an operator can
/// reconcile by hand.
#[derive(Error, Debug, Clone)]
#[error("payment {idempotency_key} failed: {error}")]
pub struct PaymentFailure {
    pub error: PaymentError,
    pub idempotency_key: String,
    pub transaction_id: Option<TransactionId>,
    pub rollback_id: Option<RollbackId>,
}

impl PaymentFailure {
    /// Failure before any transaction was opened
    pub fn early(error: PaymentError, idempotency_key: &str) -> Self {
        Self {
            error,
            idempotency_key: idempotency_key.to_string(),
            transaction_id: None,
            rollback_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let busy = PaymentError::Busy {
            key: "abc".to_string(),
            retry_after: Duration::from_millis(500),
        };
        assert_eq!(busy.code(), "BUSY");
        assert_eq!(busy.retry_after(), Some(Duration::from_millis(500)));

        let validation = PaymentError::Validation {
            field: "amount",
            reason: "must be greater than zero".to_string(),
        };
        assert_eq!(validation.code(), "VALIDATION_FAILED");
        assert_eq!(validation.retry_after(), None);
    }

    #[test]
    fn test_upstream_classification() {
        assert!(PaymentError::GatewayTimeout.is_upstream());
        assert!(
            PaymentError::GatewayRejected {
                reason: "card declined".to_string()
            }
            .is_upstream()
        );
        assert!(!PaymentError::Cancelled.is_upstream());
    }

    #[test]
    fn test_failure_context() {
        let failure = PaymentFailure::early(
            PaymentError::Busy {
                key: "abc".to_string(),
                retry_after: Duration::from_millis(100),
            },
            "abc",
        );
        assert_eq!(failure.idempotency_key, "abc");
        assert!(failure.transaction_id.is_none());
        assert!(failure.rollback_id.is_none());
    }
}
