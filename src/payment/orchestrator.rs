//! Payment Orchestrator
//!
//! Composes locking, breaker-guarded gateway calls, bounded transactions,
//! compensating rollback, and the order state machine into one
//! request-scoped protocol.
//!
//! # Protocol
//!
//! ```text
//! 1. acquire lock on idempotency key   (Busy -> caller retries)
//! 2. evaluate routing flag             (correctness-equivalent paths)
//! 3. breaker admission                 (open -> fail fast)
//! 4. begin transaction                 (deadline-bounded)
//! 5. gateway authorize                 (per-call deadline, feeds breaker)
//! 6. success: stage intent + order, commit
//! 7. failure: rollback point, compensate, abort
//! 8. release lock                      (every exit path)
//! 9. record metrics, return result
//! ```
//!
//! Cancellation is honored only before the transaction begins; once the
//! gateway call is issued, the success or rollback path always runs to
//! completion so a charge is never abandoned mid-resolution.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::core_types::now_ms;

use super::breaker::{Admission, CircuitBreakerRegistry};
use super::error::{PaymentError, PaymentFailure};
use super::features::{FeatureManager, FlagContext};
use super::gateway::{GatewayOutcome, PaymentGateway};
use super::health::HealthReport;
use super::lock::LockManager;
use super::metrics::PaymentMetrics;
use super::rollback::{Compensation, RollbackManager};
use super::state_machine::{OrderState, OrderStateMachine, Verification};
use super::store::{PaymentStore, StagedWrite};
use super::transaction::TransactionManager;
use super::types::{
    CancelFlag, IntentState, PaymentIntent, PaymentRequest, PaymentResult, PaymentStatus,
    TransactionId,
};

/// Breaker dependency name for the payment gateway
pub const GATEWAY_DEPENDENCY: &str = "gateway";

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Lock TTL; must exceed the worst-case protocol duration
    pub lock_ttl: Duration,
    /// Per-call deadline for gateway authorize
    pub gateway_deadline: Duration,
    /// Flag gating the alternate gateway route
    pub routing_flag: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(10),
            gateway_deadline: Duration::from_secs(3),
            routing_flag: "gateway-routing-v2".to_string(),
        }
    }
}

enum MetricOutcome {
    Success,
    Failure(&'static str),
}

struct LockedOutcome {
    result: PaymentResult,
    metric: MetricOutcome,
}

/// Payment orchestrator
pub struct PaymentOrchestrator {
    store: Arc<PaymentStore>,
    locks: Arc<LockManager>,
    transactions: Arc<TransactionManager>,
    rollbacks: Arc<RollbackManager>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<PaymentMetrics>,
    features: Arc<FeatureManager>,
    gateway: Arc<dyn PaymentGateway>,
    alternate_gateway: Option<Arc<dyn PaymentGateway>>,
    orders: OrderStateMachine,
    config: OrchestratorConfig,
}

impl PaymentOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<PaymentStore>,
        locks: Arc<LockManager>,
        transactions: Arc<TransactionManager>,
        rollbacks: Arc<RollbackManager>,
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Arc<PaymentMetrics>,
        features: Arc<FeatureManager>,
        gateway: Arc<dyn PaymentGateway>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            locks,
            transactions,
            rollbacks,
            breakers,
            metrics,
            features,
            gateway,
            alternate_gateway: None,
            orders: OrderStateMachine::new(),
            config,
        }
    }

    /// Configure the alternate gateway route selected by the routing flag
    pub fn with_alternate_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.alternate_gateway = Some(gateway);
        self
    }

    /// Process one payment request to a terminal outcome.
    pub async fn process(&self, req: PaymentRequest) -> Result<PaymentResult, PaymentFailure> {
        self.process_with_cancel(req, &CancelFlag::new()).await
    }

    /// Process one payment request, honoring `cancel` only before the
    /// transaction begins.
    pub async fn process_with_cancel(
        &self,
        req: PaymentRequest,
        cancel: &CancelFlag,
    ) -> Result<PaymentResult, PaymentFailure> {
        let started = Instant::now();

        if let Err(e) = validate(&req) {
            self.metrics.record_failure(e.code(), started.elapsed());
            return Err(PaymentFailure::early(e, &req.idempotency_key));
        }

        // Step 1: non-blocking lock on the idempotency key
        let lock_key = format!("pay:{}", req.idempotency_key);
        let token = match self.locks.acquire(&lock_key, self.config.lock_ttl).await {
            Ok(token) => token,
            Err(e) => {
                self.metrics.record_failure(e.code(), started.elapsed());
                return Err(PaymentFailure::early(e, &req.idempotency_key));
            }
        };

        let outcome = self.run_locked(&req, cancel).await;

        // Step 8: guaranteed release on every exit path
        if let Err(e) = self.locks.release(&lock_key, token).await {
            warn!(key = %lock_key, error = %e, "lock release failed");
        }

        // Step 9: metrics, then the terminal result
        match outcome {
            Ok(locked) => {
                match locked.metric {
                    MetricOutcome::Success => self.metrics.record_success(started.elapsed()),
                    MetricOutcome::Failure(code) => {
                        self.metrics.record_failure(code, started.elapsed())
                    }
                }
                Ok(locked.result)
            }
            Err(failure) => {
                self.metrics
                    .record_failure(failure.error.code(), started.elapsed());
                Err(failure)
            }
        }
    }

    /// Health surface: breaker states plus lock contention
    pub fn health_report(&self) -> HealthReport {
        HealthReport::gather(&self.breakers, &self.locks)
    }

    async fn run_locked(
        &self,
        req: &PaymentRequest,
        cancel: &CancelFlag,
    ) -> Result<LockedOutcome, PaymentFailure> {
        // Idempotent replay: one successful intent per key, ever
        let prior = self.store.get_intent(&req.idempotency_key);
        if let Some((intent, _)) = &prior
            && intent.state == IntentState::Captured
        {
            info!(
                key = %req.idempotency_key,
                intent_id = %intent.intent_id,
                "replaying captured intent"
            );
            return Ok(LockedOutcome {
                result: PaymentResult {
                    status: PaymentStatus::Captured,
                    intent_id: intent.intent_id,
                    transaction_id: None,
                    rollback_id: None,
                    gateway_reference: intent.gateway_reference.clone(),
                    failure_reason: None,
                    replayed: true,
                },
                metric: MetricOutcome::Success,
            });
        }

        // Step 2: routing flag; both routes share the breaker and every
        // guarantee
        let context = FlagContext::for_key(format!("venue:{}", req.venue_id))
            .with_attr("venue", req.venue_id.to_string());
        let gateway = match &self.alternate_gateway {
            Some(alternate) if self.features.is_enabled(&self.config.routing_flag, &context) => {
                alternate.clone()
            }
            _ => self.gateway.clone(),
        };

        // Last cancellation point: nothing irreversible has happened yet
        if cancel.is_cancelled() {
            return Err(PaymentFailure::early(
                PaymentError::Cancelled,
                &req.idempotency_key,
            ));
        }

        // Step 3: breaker admission; rejection leaves counters untouched
        let breaker = self.breakers.breaker(GATEWAY_DEPENDENCY);
        let admission = breaker.admit();
        if let Admission::Rejected { retry_after } = admission {
            return Err(PaymentFailure::early(
                PaymentError::FailFast {
                    dependency: GATEWAY_DEPENDENCY.to_string(),
                    retry_after,
                },
                &req.idempotency_key,
            ));
        }

        // Step 4: deadline-bounded transaction
        let tx = match self
            .transactions
            .begin(&format!("pay:{}", req.idempotency_key))
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                // Never reached the gateway; the trial slot must not leak
                if admission == Admission::Trial {
                    breaker.abandon_trial();
                }
                return Err(PaymentFailure::early(e, &req.idempotency_key));
            }
        };

        let mut intent = PaymentIntent::from_request(req);
        if let Some((previous, _)) = &prior {
            intent.attempts = previous.attempts + 1;
        }
        let base_version = prior.map(|(_, version)| version).unwrap_or(0);

        // Step 5: gateway call under its own deadline, outcome feeds the
        // breaker
        let call = tokio::time::timeout(
            self.config.gateway_deadline,
            gateway.authorize(req.amount, &req.currency, &req.idempotency_key),
        )
        .await;
        let gateway_result = match call {
            Ok(result) => result,
            Err(_) => Err(PaymentError::GatewayTimeout),
        };

        match gateway_result {
            Ok(GatewayOutcome::Approved { reference }) => {
                breaker.record_success();
                self.finish_captured(req, intent, tx, base_version, reference)
                    .await
            }
            Ok(GatewayOutcome::Declined { reason }) => {
                // The gateway answered; the dependency is healthy
                breaker.record_success();
                self.fail_with_rollback(
                    intent,
                    tx,
                    None,
                    PaymentError::GatewayRejected { reason },
                )
                .await
            }
            Err(e) => {
                breaker.record_failure();
                // Outcome unknown: the charge may have landed. Compensate by
                // idempotency key so an invisible charge still gets refunded.
                self.fail_with_rollback(
                    intent,
                    tx,
                    Some(req.idempotency_key.clone()),
                    e,
                )
                .await
            }
        }
    }

    /// Step 6: stage the captured intent and order advance, then commit.
    async fn finish_captured(
        &self,
        req: &PaymentRequest,
        mut intent: PaymentIntent,
        tx: TransactionId,
        base_version: u64,
        reference: String,
    ) -> Result<LockedOutcome, PaymentFailure> {
        intent.state = IntentState::Captured;
        intent.gateway_reference = Some(reference.clone());
        intent.updated_at = now_ms();
        let intent_id = intent.intent_id;

        let staged = self.stage_captured(req, intent.clone(), tx, base_version).await;

        let commit = match staged {
            Ok(()) => self.transactions.commit(tx).await,
            Err(e) => {
                warn!(transaction_id = %tx, error = %e, "staging failed after capture");
                Err(e)
            }
        };

        match commit {
            Ok(()) => {
                info!(
                    key = %intent.idempotency_key,
                    intent_id = %intent_id,
                    transaction_id = %tx,
                    reference = %reference,
                    "payment captured"
                );
                Ok(LockedOutcome {
                    result: PaymentResult {
                        status: PaymentStatus::Captured,
                        intent_id,
                        transaction_id: Some(tx),
                        rollback_id: None,
                        gateway_reference: Some(reference),
                        failure_reason: None,
                        replayed: false,
                    },
                    metric: MetricOutcome::Success,
                })
            }
            Err(e) => {
                // Commit failure after gateway success: the charge is real
                // and must be compensated by reference
                self.fail_with_rollback(intent, tx, Some(reference), e).await
            }
        }
    }

    async fn stage_captured(
        &self,
        req: &PaymentRequest,
        intent: PaymentIntent,
        tx: TransactionId,
        base_version: u64,
    ) -> Result<(), PaymentError> {
        let intent_id = intent.intent_id;
        self.transactions
            .stage(
                tx,
                "write_intent",
                StagedWrite::PutIntent {
                    base_version,
                    intent,
                },
            )
            .await?;

        // Advance the order as applicable: a captured payment verifies a
        // placed order
        if let Some((mut order, order_version)) = self.store.get_order(req.order_id)
            && order.state == OrderState::Placed
        {
            order.verification = Some(Verification {
                verified_by: format!("intent:{intent_id}"),
                verified_at: now_ms(),
            });
            let mut metadata = req.metadata.clone();
            metadata.push(("payment_intent".to_string(), intent_id.to_string().into()));
            self.orders
                .transition(&mut order, OrderState::Verified, metadata)?;
            self.transactions
                .stage(
                    tx,
                    "advance_order",
                    StagedWrite::PutOrder {
                        base_version: order_version,
                        order,
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Step 7: compensate any landed charge, abort the transaction, and
    /// surface a terminal failed result.
    async fn fail_with_rollback(
        &self,
        mut intent: PaymentIntent,
        tx: TransactionId,
        charge_reference: Option<String>,
        cause: PaymentError,
    ) -> Result<LockedOutcome, PaymentFailure> {
        let compensations = charge_reference
            .map(|reference| vec![Compensation::RefundCharge { reference }])
            .unwrap_or_default();
        let had_compensations = !compensations.is_empty();

        let rollback_id = self.rollbacks.create_rollback_point(tx, compensations);

        match self.rollbacks.execute_rollback(rollback_id).await {
            Ok(summary) if !summary.all_succeeded() => {
                warn!(
                    rollback_id = %rollback_id,
                    "rollback left failed compensations; recovery worker will retry"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(rollback_id = %rollback_id, error = %e, "rollback execution error");
            }
        }

        if let Err(e) = self.transactions.rollback(tx).await {
            warn!(transaction_id = %tx, error = %e, "transaction abort failed");
        }

        // Escalated inside verify_rollback; never swallowed silently
        if had_compensations
            && let Err(e) = self.rollbacks.verify_rollback(rollback_id).await
        {
            warn!(
                rollback_id = %rollback_id,
                error = %e,
                "dangling side effect awaiting recovery"
            );
        }

        intent.state = IntentState::Failed;
        intent.failure_reason = Some(cause.to_string());
        intent.updated_at = now_ms();
        let intent_id = intent.intent_id;
        // Terminal failed record lands outside the aborted transaction so a
        // retry sees the attempt count
        self.store.put_intent_direct(intent);

        info!(
            intent_id = %intent_id,
            transaction_id = %tx,
            rollback_id = %rollback_id,
            cause = %cause,
            "payment failed"
        );

        Ok(LockedOutcome {
            result: PaymentResult {
                status: PaymentStatus::Failed,
                intent_id,
                transaction_id: Some(tx),
                rollback_id: Some(rollback_id),
                gateway_reference: None,
                failure_reason: Some(cause.to_string()),
                replayed: false,
            },
            metric: MetricOutcome::Failure(cause.code()),
        })
    }
}

fn validate(req: &PaymentRequest) -> Result<(), PaymentError> {
    if req.idempotency_key.is_empty() {
        return Err(PaymentError::Validation {
            field: "idempotency_key",
            reason: "must not be empty".to_string(),
        });
    }
    if req.amount == 0 {
        return Err(PaymentError::Validation {
            field: "amount",
            reason: "must be greater than zero".to_string(),
        });
    }
    if req.currency.len() != 3 || !req.currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(PaymentError::Validation {
            field: "currency",
            reason: format!("'{}' is not an ISO currency code", req.currency),
        });
    }
    if req.user_id == 0 {
        return Err(PaymentError::Validation {
            field: "user_id",
            reason: "user is required".to_string(),
        });
    }
    Ok(())
}
