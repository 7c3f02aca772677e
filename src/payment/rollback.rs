//! Rollback Manager
//!
//! Compensating-action execution for side effects a storage transaction
//! cannot undo. A charge already processed by the gateway is not reversible
//! by aborting the local transaction; the only correctness mechanism is an
//! explicit compensation (a refund) and verification that it landed.
//!
//! # Safety Invariants
//!
//! 1. Compensations execute in strict reverse order of the forward actions
//!    they undo
//! 2. One compensation's failure never halts the remaining ones
//! 3. A rollback point executes at most once; re-execution reports the
//!    earlier outcome
//! 4. Verification failures are escalated, never swallowed

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::core_types::{TimestampMs, now_ms};

use super::error::PaymentError;
use super::gateway::{ChargeStatus, PaymentGateway};
use super::types::{RetryPolicy, RollbackId, TransactionId};

/// One compensating action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Refund a gateway charge. `reference` is the gateway reference, or the
    /// idempotency key when the reference was never observed (timeout).
    RefundCharge { reference: String },
}

impl Compensation {
    /// Short label for logs and summaries
    pub fn describe(&self) -> String {
        match self {
            Compensation::RefundCharge { reference } => format!("refund_charge:{reference}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CompensationOutcome {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone)]
struct CompensationRecord {
    action: Compensation,
    registered_at: TimestampMs,
    outcome: Option<CompensationOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RollbackState {
    Pending,
    Executed,
}

#[derive(Debug, Clone)]
struct RollbackPoint {
    transaction_id: TransactionId,
    compensations: Vec<CompensationRecord>,
    created_at: TimestampMs,
    state: RollbackState,
}

/// Per-compensation result of one rollback execution
#[derive(Debug, Clone)]
pub struct CompensationReport {
    pub action: String,
    pub succeeded: bool,
    pub error: Option<String>,
}

/// Summary returned by `execute_rollback`
#[derive(Debug, Clone)]
pub struct RollbackSummary {
    pub rollback_id: RollbackId,
    /// True when this call found the point already executed and ran nothing
    pub already_rolled_back: bool,
    pub reports: Vec<CompensationReport>,
}

impl RollbackSummary {
    pub fn all_succeeded(&self) -> bool {
        self.reports.iter().all(|report| report.succeeded)
    }
}

/// Rollback manager
pub struct RollbackManager {
    gateway: Arc<dyn PaymentGateway>,
    retry: RetryPolicy,
    points: DashMap<RollbackId, RollbackPoint>,
}

impl RollbackManager {
    pub fn new(gateway: Arc<dyn PaymentGateway>, retry: RetryPolicy) -> Self {
        Self {
            gateway,
            retry,
            points: DashMap::new(),
        }
    }

    /// Snapshot already-executed side effects with their compensations.
    ///
    /// Compensations are registered in forward execution order; rollback
    /// runs them in reverse.
    pub fn create_rollback_point(
        &self,
        transaction_id: TransactionId,
        compensations: Vec<Compensation>,
    ) -> RollbackId {
        let id = RollbackId::new();
        let now = now_ms();
        self.points.insert(
            id,
            RollbackPoint {
                transaction_id,
                compensations: compensations
                    .into_iter()
                    .map(|action| CompensationRecord {
                        action,
                        registered_at: now,
                        outcome: None,
                    })
                    .collect(),
                created_at: now,
                state: RollbackState::Pending,
            },
        );
        info!(rollback_id = %id, transaction_id = %transaction_id, "rollback point created");
        id
    }

    /// Run all compensations for `id` in reverse chronological order.
    ///
    /// Best-effort full rollback: a failing compensation is logged and
    /// recorded, the rest still run. Calling again after execution performs
    /// nothing and reports `already_rolled_back`.
    pub async fn execute_rollback(&self, id: RollbackId) -> Result<RollbackSummary, PaymentError> {
        // Claim execution under the entry guard
        let claimed = {
            let mut point = self
                .points
                .get_mut(&id)
                .ok_or(PaymentError::RollbackNotFound(id))?;
            match point.state {
                RollbackState::Executed => None,
                RollbackState::Pending => {
                    point.state = RollbackState::Executed;
                    Some(point.compensations.clone())
                }
            }
        };

        let Some(compensations) = claimed else {
            let point = self
                .points
                .get(&id)
                .ok_or(PaymentError::RollbackNotFound(id))?;
            return Ok(RollbackSummary {
                rollback_id: id,
                already_rolled_back: true,
                reports: reports_of(&point.compensations),
            });
        };

        let mut executed = Vec::with_capacity(compensations.len());
        for (index, record) in compensations.iter().enumerate().rev() {
            let outcome = self.run_compensation(&record.action).await;
            match &outcome {
                CompensationOutcome::Succeeded => {
                    info!(
                        rollback_id = %id,
                        action = %record.action.describe(),
                        "compensation applied"
                    );
                }
                CompensationOutcome::Failed(reason) => {
                    // Keep going: remaining compensations still run
                    warn!(
                        rollback_id = %id,
                        action = %record.action.describe(),
                        error = %reason,
                        "compensation failed"
                    );
                }
            }
            executed.push((index, outcome));
        }

        let mut point = self
            .points
            .get_mut(&id)
            .ok_or(PaymentError::RollbackNotFound(id))?;
        for (index, outcome) in executed {
            point.compensations[index].outcome = Some(outcome);
        }

        Ok(RollbackSummary {
            rollback_id: id,
            already_rolled_back: false,
            reports: reports_of(&point.compensations),
        })
    }

    /// Re-query external state to confirm no dangling side effect remains.
    ///
    /// `RollbackVerificationFailed` signals money moved with inconsistent
    /// records; it is escalated to the operator alert path here and must not
    /// be swallowed by callers either.
    pub async fn verify_rollback(&self, id: RollbackId) -> Result<(), PaymentError> {
        let (transaction_id, actions) = {
            let point = self
                .points
                .get(&id)
                .ok_or(PaymentError::RollbackNotFound(id))?;
            (
                point.transaction_id,
                point
                    .compensations
                    .iter()
                    .map(|record| record.action.clone())
                    .collect::<Vec<_>>(),
            )
        };

        for action in actions {
            let Compensation::RefundCharge { reference } = &action;
            let status = self.gateway.charge_status(reference).await?;
            if status == ChargeStatus::Settled {
                error!(
                    target: "venuepay::ops_alert",
                    rollback_id = %id,
                    transaction_id = %transaction_id,
                    reference = %reference,
                    "rollback verification failed: charge still settled"
                );
                return Err(PaymentError::RollbackVerificationFailed { rollback_id: id });
            }
        }
        Ok(())
    }

    /// Retry every failed compensation across all executed points.
    ///
    /// Returns how many compensations newly succeeded. Called by the
    /// recovery worker.
    pub async fn retry_failed(&self) -> usize {
        let mut pending: Vec<(RollbackId, usize, Compensation)> = Vec::new();
        for point in self.points.iter() {
            if point.state != RollbackState::Executed {
                continue;
            }
            for (index, record) in point.compensations.iter().enumerate() {
                if matches!(record.outcome, Some(CompensationOutcome::Failed(_))) {
                    pending.push((*point.key(), index, record.action.clone()));
                }
            }
        }

        let mut recovered = 0;
        for (id, index, action) in pending {
            let outcome = self.run_compensation(&action).await;
            if outcome == CompensationOutcome::Succeeded {
                recovered += 1;
                info!(rollback_id = %id, action = %action.describe(), "compensation recovered");
            }
            if let Some(mut point) = self.points.get_mut(&id) {
                point.compensations[index].outcome = Some(outcome);
            }
        }
        recovered
    }

    /// Rollback points whose compensations have not all succeeded
    pub fn unresolved_count(&self) -> usize {
        self.points
            .iter()
            .filter(|point| {
                point.compensations.iter().any(|record| {
                    !matches!(record.outcome, Some(CompensationOutcome::Succeeded))
                })
            })
            .count()
    }

    async fn run_compensation(&self, action: &Compensation) -> CompensationOutcome {
        let Compensation::RefundCharge { reference } = action;

        let mut last_error = String::new();
        for attempt in 0..self.retry.max_attempts {
            if let Some(delay) = self.retry.delay_before(attempt)
                && !delay.is_zero()
            {
                tokio::time::sleep(delay).await;
            }
            match self.gateway.refund(reference).await {
                Ok(()) => return CompensationOutcome::Succeeded,
                Err(e) => last_error = e.to_string(),
            }
        }
        CompensationOutcome::Failed(last_error)
    }
}

fn reports_of(records: &[CompensationRecord]) -> Vec<CompensationReport> {
    // Reverse order: the order compensations execute in
    records
        .iter()
        .rev()
        .map(|record| CompensationReport {
            action: record.action.describe(),
            succeeded: matches!(record.outcome, Some(CompensationOutcome::Succeeded)),
            error: match &record.outcome {
                Some(CompensationOutcome::Failed(reason)) => Some(reason.clone()),
                _ => None,
            },
        })
        .collect()
}
