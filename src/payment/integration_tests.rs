//! Integration Tests for the Payment Orchestrator
//!
//! Exercise the complete protocol against in-memory stores and the simulated
//! gateway; no external services needed.

use std::sync::Arc;
use std::time::Duration;

use crate::core_types::now_ms;
use crate::payment::breaker::{BreakerConfig, BreakerState, CircuitBreakerRegistry};
use crate::payment::error::PaymentError;
use crate::payment::features::{
    FeatureFlag, FeatureManager, FeatureStore, InMemoryFeatureStore, Rollout,
};
use crate::payment::gateway::{ChargeStatus, PaymentGateway, SimulatedGateway};
use crate::payment::lock::{InMemoryLockStore, LockManager};
use crate::payment::metrics::{InMemoryMetricsSink, PaymentMetrics};
use crate::payment::orchestrator::{
    GATEWAY_DEPENDENCY, OrchestratorConfig, PaymentOrchestrator,
};
use crate::payment::rollback::RollbackManager;
use crate::payment::state_machine::{ItemKind, Order, OrderItem, OrderState};
use crate::payment::store::PaymentStore;
use crate::payment::transaction::{InMemorySessionStore, TransactionManager, TxState};
use crate::payment::types::{
    CancelFlag, IntentState, PaymentRequest, PaymentStatus, RetryPolicy,
};

struct Harness {
    store: Arc<PaymentStore>,
    gateway: Arc<SimulatedGateway>,
    alternate: Arc<SimulatedGateway>,
    flags: Arc<InMemoryFeatureStore>,
    transactions: Arc<TransactionManager>,
    rollbacks: Arc<RollbackManager>,
    metrics: Arc<PaymentMetrics>,
    orchestrator: Arc<PaymentOrchestrator>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(
            BreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_millis(50),
                observation_window: Duration::from_secs(60),
            },
            OrchestratorConfig {
                lock_ttl: Duration::from_secs(5),
                gateway_deadline: Duration::from_millis(200),
                routing_flag: "gateway-routing-v2".to_string(),
            },
        )
    }

    fn with_config(breaker: BreakerConfig, config: OrchestratorConfig) -> Self {
        let store = Arc::new(PaymentStore::new());
        let gateway = Arc::new(SimulatedGateway::new("gateway"));
        let alternate = Arc::new(SimulatedGateway::new("gateway-v2"));
        let flags = Arc::new(InMemoryFeatureStore::new());

        let locks = Arc::new(LockManager::new(Arc::new(InMemoryLockStore::new())));
        let transactions = Arc::new(TransactionManager::new(
            Arc::new(InMemorySessionStore::new(store.clone())),
            Duration::from_secs(5),
        ));
        let rollbacks = Arc::new(RollbackManager::new(
            gateway.clone(),
            RetryPolicy::none(),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(breaker));
        let metrics = Arc::new(PaymentMetrics::new(Arc::new(InMemoryMetricsSink::new())));
        let features = Arc::new(FeatureManager::new(flags.clone()));

        let orchestrator = Arc::new(
            PaymentOrchestrator::new(
                store.clone(),
                locks,
                transactions.clone(),
                rollbacks.clone(),
                breakers,
                metrics.clone(),
                features,
                gateway.clone(),
                config,
            )
            .with_alternate_gateway(alternate.clone()),
        );

        Self {
            store,
            gateway,
            alternate,
            flags,
            transactions,
            rollbacks,
            metrics,
            orchestrator,
        }
    }

    fn place_order(&self) -> u64 {
        let order = Order::place(
            42,
            7,
            1001,
            vec![OrderItem {
                kind: ItemKind::Ticket,
                name: "GA pass".to_string(),
                price: 2500,
                tip: None,
            }],
        )
        .unwrap();
        self.store.insert_order(order);
        42
    }

    fn request(&self, key: &str) -> PaymentRequest {
        PaymentRequest {
            idempotency_key: key.to_string(),
            order_id: 42,
            venue_id: 7,
            user_id: 1001,
            amount: 2500,
            currency: "USD".to_string(),
            metadata: vec![],
        }
    }
}

// ============================================================================
// Happy Path
// ============================================================================

#[tokio::test]
async fn test_capture_advances_order_and_commits() {
    let harness = Harness::new();
    harness.place_order();

    let result = harness
        .orchestrator
        .process(harness.request("key-1"))
        .await
        .unwrap();

    assert_eq!(result.status, PaymentStatus::Captured);
    assert!(!result.replayed);
    assert!(result.gateway_reference.is_some());
    assert_eq!(
        harness.transactions.state(result.transaction_id.unwrap()).unwrap(),
        TxState::Committed
    );

    let (intent, _) = harness.store.get_intent("key-1").unwrap();
    assert_eq!(intent.state, IntentState::Captured);
    assert_eq!(intent.attempts, 1);

    let (order, _) = harness.store.get_order(42).unwrap();
    assert_eq!(order.state, OrderState::Verified);
    assert_eq!(order.status_history.len(), 2);
    assert!(order.verification.is_some());
}

#[tokio::test]
async fn test_capture_without_order_still_succeeds() {
    let harness = Harness::new();
    // No order seeded; payment captures, nothing to advance
    let result = harness
        .orchestrator
        .process(harness.request("key-1"))
        .await
        .unwrap();
    assert_eq!(result.status, PaymentStatus::Captured);
}

// ============================================================================
// Idempotency & Locking
// ============================================================================

#[tokio::test]
async fn test_retry_replays_captured_result() {
    let harness = Harness::new();
    harness.place_order();

    let first = harness
        .orchestrator
        .process(harness.request("key-1"))
        .await
        .unwrap();
    let second = harness
        .orchestrator
        .process(harness.request("key-1"))
        .await
        .unwrap();

    assert_eq!(second.status, PaymentStatus::Captured);
    assert!(second.replayed);
    assert_eq!(second.intent_id, first.intent_id);
    assert_eq!(second.gateway_reference, first.gateway_reference);
    // The gateway saw exactly one charge
    assert_eq!(harness.gateway.authorize_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_single_capture() {
    let harness = Harness::new();
    harness.place_order();
    // Slow gateway so submissions overlap
    harness.gateway.set_latency(Duration::from_millis(100));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orchestrator = harness.orchestrator.clone();
        let req = harness.request("key-1");
        handles.push(tokio::spawn(async move { orchestrator.process(req).await }));
    }

    let mut captured = 0;
    let mut busy = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => {
                assert_eq!(result.status, PaymentStatus::Captured);
                // Losers that arrive after completion replay, never re-charge
                captured += 1;
            }
            Err(failure) => {
                assert!(matches!(failure.error, PaymentError::Busy { .. }));
                busy += 1;
            }
        }
    }

    assert!(captured >= 1);
    assert_eq!(captured + busy, 8);
    assert_eq!(harness.gateway.authorize_count(), 1);
}

#[tokio::test]
async fn test_busy_error_carries_retry_hint() {
    let harness = Harness::new();
    harness.gateway.set_latency(Duration::from_millis(150));

    let background = {
        let orchestrator = harness.orchestrator.clone();
        let req = harness.request("key-1");
        tokio::spawn(async move { orchestrator.process(req).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let failure = harness
        .orchestrator
        .process(harness.request("key-1"))
        .await
        .unwrap_err();
    assert!(matches!(failure.error, PaymentError::Busy { .. }));
    assert!(failure.error.retry_after().is_some());
    assert_eq!(failure.idempotency_key, "key-1");

    background.await.unwrap().unwrap();
}

// ============================================================================
// Failure & Compensation
// ============================================================================

#[tokio::test]
async fn test_decline_fails_without_charge() {
    let harness = Harness::new();
    harness.place_order();
    harness.gateway.decline_next("card declined");

    let result = harness
        .orchestrator
        .process(harness.request("key-1"))
        .await
        .unwrap();

    assert_eq!(result.status, PaymentStatus::Failed);
    assert!(result.rollback_id.is_some());
    assert!(result.failure_reason.unwrap().contains("card declined"));
    // Nothing to refund: the decline never charged
    assert_eq!(harness.gateway.refund_count(), 0);

    // Order unchanged, transaction aborted
    let (order, _) = harness.store.get_order(42).unwrap();
    assert_eq!(order.state, OrderState::Placed);
    assert_eq!(order.status_history.len(), 1);
    assert_eq!(
        harness.transactions.state(result.transaction_id.unwrap()).unwrap(),
        TxState::Aborted
    );

    // Failed intent recorded for attempt accounting; key not burned
    let (intent, _) = harness.store.get_intent("key-1").unwrap();
    assert_eq!(intent.state, IntentState::Failed);
    let retry = harness
        .orchestrator
        .process(harness.request("key-1"))
        .await
        .unwrap();
    assert_eq!(retry.status, PaymentStatus::Captured);
    let (intent, _) = harness.store.get_intent("key-1").unwrap();
    assert_eq!(intent.attempts, 2);
}

#[tokio::test]
async fn test_timeout_with_landed_charge_refunds_by_key() {
    let harness = Harness::new();
    harness.place_order();
    // Transport failure after the charge lands: the worst case
    harness.gateway.fail_next_authorize();

    let result = harness
        .orchestrator
        .process(harness.request("key-1"))
        .await
        .unwrap();

    assert_eq!(result.status, PaymentStatus::Failed);
    assert!(result.rollback_id.is_some());
    assert!(harness.gateway.refund_count() >= 1);
    // The invisible charge was compensated
    assert_eq!(
        harness.gateway.charge_status("key-1").await.unwrap(),
        ChargeStatus::Refunded
    );
    harness
        .rollbacks
        .verify_rollback(result.rollback_id.unwrap())
        .await
        .unwrap();

    let (order, _) = harness.store.get_order(42).unwrap();
    assert_eq!(order.state, OrderState::Placed);
}

#[tokio::test]
async fn test_slow_gateway_hits_deadline_and_rolls_back() {
    let harness = Harness::new();
    harness.place_order();
    harness.gateway.set_latency(Duration::from_millis(500));

    let result = harness
        .orchestrator
        .process(harness.request("key-1"))
        .await
        .unwrap();

    assert_eq!(result.status, PaymentStatus::Failed);
    assert!(result.rollback_id.is_some());
    assert!(result.failure_reason.unwrap().contains("deadline"));
    assert_eq!(
        harness.transactions.state(result.transaction_id.unwrap()).unwrap(),
        TxState::Aborted
    );
    assert!(harness.gateway.refund_count() >= 1);

    let (order, _) = harness.store.get_order(42).unwrap();
    assert_eq!(order.state, OrderState::Placed);
    assert_eq!(order.status_history.len(), 1);

    // Lock released on the failure path: a fresh key processes immediately
    harness.gateway.set_latency(Duration::ZERO);
    harness
        .orchestrator
        .process(harness.request("key-2"))
        .await
        .unwrap();
}

// ============================================================================
// Circuit Breaker
// ============================================================================

#[tokio::test]
async fn test_breaker_opens_and_fails_fast() {
    let harness = Harness::new();

    for i in 0..3 {
        harness.gateway.fail_next_authorize();
        let result = harness
            .orchestrator
            .process(harness.request(&format!("key-{i}")))
            .await
            .unwrap();
        assert_eq!(result.status, PaymentStatus::Failed);
    }
    let calls_before = harness.gateway.authorize_count();

    // Breaker is open: fail fast, no gateway call, counters untouched
    let failure = harness
        .orchestrator
        .process(harness.request("key-fast"))
        .await
        .unwrap_err();
    assert!(matches!(failure.error, PaymentError::FailFast { .. }));
    assert!(failure.error.retry_after().is_some());
    assert_eq!(harness.gateway.authorize_count(), calls_before);

    let report = harness.orchestrator.health_report();
    assert!(report.is_degraded());
    assert_eq!(report.breakers[0].dependency, GATEWAY_DEPENDENCY);
    assert_eq!(report.breakers[0].state, BreakerState::Open);
}

#[tokio::test]
async fn test_breaker_recovers_through_trial() {
    let harness = Harness::new();

    for i in 0..3 {
        harness.gateway.fail_next_authorize();
        harness
            .orchestrator
            .process(harness.request(&format!("key-{i}")))
            .await
            .unwrap();
    }

    // Cooldown elapses; the next call is the half-open trial and succeeds
    tokio::time::sleep(Duration::from_millis(80)).await;
    let result = harness
        .orchestrator
        .process(harness.request("key-trial"))
        .await
        .unwrap();
    assert_eq!(result.status, PaymentStatus::Captured);
    assert!(!harness.orchestrator.health_report().is_degraded());
}

// ============================================================================
// Cancellation & Routing
// ============================================================================

#[tokio::test]
async fn test_cancellation_before_transaction() {
    let harness = Harness::new();
    let cancel = CancelFlag::new();
    cancel.cancel();

    let failure = harness
        .orchestrator
        .process_with_cancel(harness.request("key-1"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(failure.error, PaymentError::Cancelled);
    assert_eq!(harness.gateway.authorize_count(), 0);

    // Lock was released; the same key processes normally afterwards
    let result = harness
        .orchestrator
        .process(harness.request("key-1"))
        .await
        .unwrap();
    assert_eq!(result.status, PaymentStatus::Captured);
}

#[tokio::test]
async fn test_routing_flag_selects_alternate_gateway() {
    let harness = Harness::new();
    harness.flags.put(FeatureFlag {
        name: "gateway-routing-v2".to_string(),
        rollout: Rollout::Global(true),
        overrides: vec![],
    });

    let result = harness
        .orchestrator
        .process(harness.request("key-1"))
        .await
        .unwrap();

    assert_eq!(result.status, PaymentStatus::Captured);
    assert_eq!(harness.alternate.authorize_count(), 1);
    assert_eq!(harness.gateway.authorize_count(), 0);
}

// ============================================================================
// Validation & Metrics
// ============================================================================

#[tokio::test]
async fn test_validation_surfaces_before_any_work() {
    let harness = Harness::new();
    let mut req = harness.request("key-1");
    req.amount = 0;

    let failure = harness.orchestrator.process(req).await.unwrap_err();
    assert!(matches!(
        failure.error,
        PaymentError::Validation { field: "amount", .. }
    ));
    assert_eq!(harness.gateway.authorize_count(), 0);
}

#[tokio::test]
async fn test_metrics_reflect_outcomes() {
    let harness = Harness::new();
    let from = now_ms() - 1;

    harness
        .orchestrator
        .process(harness.request("key-ok"))
        .await
        .unwrap();
    harness.gateway.decline_next("card declined");
    harness
        .orchestrator
        .process(harness.request("key-bad"))
        .await
        .unwrap();

    let report = harness.metrics.aggregate(from, now_ms() + 1);
    assert_eq!(report.total, 2);
    assert_eq!(report.successes, 1);
    assert_eq!(report.failures, 1);
    assert_eq!(report.failures_by_reason.get("GATEWAY_REJECTED"), Some(&1));

    let health = harness.orchestrator.health_report();
    assert_eq!(health.lock_contention, 0);
}
