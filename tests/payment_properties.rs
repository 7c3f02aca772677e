//! Black-box property tests for the payment orchestrator.
//!
//! Everything here goes through the public crate API the way an embedding
//! service would: build the subsystems, wire the orchestrator, and hammer it.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use venuepay::payment::breaker::{BreakerConfig, CircuitBreakerRegistry};
use venuepay::payment::features::{FeatureManager, InMemoryFeatureStore};
use venuepay::payment::gateway::SimulatedGateway;
use venuepay::payment::lock::{InMemoryLockStore, LockManager};
use venuepay::payment::metrics::{InMemoryMetricsSink, PaymentMetrics};
use venuepay::payment::orchestrator::{OrchestratorConfig, PaymentOrchestrator};
use venuepay::payment::rollback::RollbackManager;
use venuepay::payment::store::PaymentStore;
use venuepay::payment::transaction::{InMemorySessionStore, TransactionManager};
use venuepay::payment::types::{PaymentRequest, PaymentStatus, RetryPolicy};
use venuepay::payment::PaymentError;

struct Stack {
    store: Arc<PaymentStore>,
    gateway: Arc<SimulatedGateway>,
    orchestrator: Arc<PaymentOrchestrator>,
}

fn stack() -> Stack {
    let store = Arc::new(PaymentStore::new());
    let gateway = Arc::new(SimulatedGateway::new("gateway"));

    let orchestrator = Arc::new(PaymentOrchestrator::new(
        store.clone(),
        Arc::new(LockManager::new(Arc::new(InMemoryLockStore::new()))),
        Arc::new(TransactionManager::new(
            Arc::new(InMemorySessionStore::new(store.clone())),
            Duration::from_secs(5),
        )),
        Arc::new(RollbackManager::new(gateway.clone(), RetryPolicy::none())),
        Arc::new(CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_millis(50),
            observation_window: Duration::from_secs(60),
        })),
        Arc::new(PaymentMetrics::new(Arc::new(InMemoryMetricsSink::new()))),
        Arc::new(FeatureManager::new(Arc::new(InMemoryFeatureStore::new()))),
        gateway.clone(),
        OrchestratorConfig {
            lock_ttl: Duration::from_secs(5),
            gateway_deadline: Duration::from_millis(500),
            routing_flag: "gateway-routing-v2".to_string(),
        },
    ));

    Stack {
        store,
        gateway,
        orchestrator,
    }
}

fn request(key: &str, amount: u64) -> PaymentRequest {
    PaymentRequest {
        idempotency_key: key.to_string(),
        order_id: 42,
        venue_id: 7,
        user_id: 1001,
        amount,
        currency: "USD".to_string(),
        metadata: vec![],
    }
}

/// N concurrent submissions of one idempotency key settle exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_duplicate_submissions_settle_once() {
    let stack = stack();
    stack.gateway.set_latency(Duration::from_millis(80));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let orchestrator = stack.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.process(request("abc", 1000)).await
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    let captures = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(r) if r.status == PaymentStatus::Captured))
        .count();
    let busy = outcomes
        .iter()
        .filter(|o| matches!(o, Err(f) if matches!(f.error, PaymentError::Busy { .. })))
        .count();

    assert_eq!(captures + busy, 32);
    assert!(captures >= 1);
    // One charge, ever, no matter how many submissions
    assert_eq!(stack.gateway.authorize_count(), 1);
    assert_eq!(stack.store.get_intent("abc").unwrap().0.attempts, 1);
}

/// Random interleavings of distinct keys all settle independently.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn independent_keys_settle_in_parallel() {
    let stack = stack();

    let mut handles = Vec::new();
    for i in 0..24u64 {
        let orchestrator = stack.orchestrator.clone();
        let jitter = rand::thread_rng().gen_range(0..10u64);
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(jitter)).await;
            orchestrator.process(request(&format!("key-{i}"), 100 + i)).await
        }));
    }

    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, PaymentStatus::Captured);
    }
    assert_eq!(stack.gateway.authorize_count(), 24);
}

/// A retry after a completed capture replays the stored result.
#[tokio::test]
async fn late_retry_returns_original_capture() {
    let stack = stack();

    let first = stack.orchestrator.process(request("abc", 1000)).await.unwrap();
    let second = stack.orchestrator.process(request("abc", 1000)).await.unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.intent_id, second.intent_id);
    assert_eq!(first.gateway_reference, second.gateway_reference);
    assert_eq!(stack.gateway.authorize_count(), 1);
}

/// Gateway timeout after transaction begin: compensated, aborted, unlocked.
#[tokio::test]
async fn timeout_is_compensated_and_key_stays_usable() {
    let stack = stack();
    stack.gateway.fail_next_authorize();

    let failed = stack.orchestrator.process(request("abc", 1000)).await.unwrap();
    assert_eq!(failed.status, PaymentStatus::Failed);
    assert!(failed.rollback_id.is_some());
    assert!(stack.gateway.refund_count() >= 1);

    // Same key retried afterwards: lock free, fresh charge succeeds
    let retried = stack.orchestrator.process(request("abc", 1000)).await.unwrap();
    assert_eq!(retried.status, PaymentStatus::Captured);
    assert_eq!(stack.store.get_intent("abc").unwrap().0.attempts, 2);
}

/// The breaker opens under consecutive transport failures and recovers.
#[tokio::test]
async fn breaker_protects_and_recovers() {
    let stack = stack();

    for i in 0..5 {
        stack.gateway.fail_next_authorize();
        stack
            .orchestrator
            .process(request(&format!("fail-{i}"), 100))
            .await
            .unwrap();
    }

    let rejected = stack
        .orchestrator
        .process(request("blocked", 100))
        .await
        .unwrap_err();
    assert!(matches!(rejected.error, PaymentError::FailFast { .. }));

    tokio::time::sleep(Duration::from_millis(80)).await;
    let recovered = stack
        .orchestrator
        .process(request("recovered", 100))
        .await
        .unwrap();
    assert_eq!(recovered.status, PaymentStatus::Captured);
}
