//! VenuePay demo binary
//!
//! Wires the orchestrator with in-memory backends and the simulated gateway,
//! then runs a few representative payments: a capture, a duplicate retry,
//! and a declined charge. Production deployments embed the library behind
//! their own transport and swap the store/gateway seams.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use venuepay::config::AppConfig;
use venuepay::logging::init_logging;
use venuepay::payment::breaker::{BreakerConfig, CircuitBreakerRegistry};
use venuepay::payment::features::{FeatureManager, InMemoryFeatureStore};
use venuepay::payment::gateway::SimulatedGateway;
use venuepay::payment::lock::{InMemoryLockStore, LockManager};
use venuepay::payment::metrics::{InMemoryMetricsSink, PaymentMetrics};
use venuepay::payment::orchestrator::{OrchestratorConfig, PaymentOrchestrator};
use venuepay::payment::rollback::RollbackManager;
use venuepay::payment::state_machine::{ItemKind, Order, OrderItem};
use venuepay::payment::store::PaymentStore;
use venuepay::payment::transaction::{InMemorySessionStore, TransactionManager};
use venuepay::payment::types::{PaymentRequest, RetryPolicy};
use venuepay::payment::worker::{RecoveryWorker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load_or_default("dev");
    let _guard = init_logging(&config);
    info!("venuepay starting");

    let pay = &config.payment;
    let store = Arc::new(PaymentStore::new());
    let gateway = Arc::new(SimulatedGateway::new("gateway"));

    let locks = Arc::new(LockManager::new(Arc::new(InMemoryLockStore::new())));
    let transactions = Arc::new(TransactionManager::new(
        Arc::new(InMemorySessionStore::new(store.clone())),
        pay.transaction_deadline(),
    ));
    let rollbacks = Arc::new(RollbackManager::new(
        gateway.clone(),
        RetryPolicy {
            max_attempts: pay.rollback.max_attempts,
            base_delay: Duration::from_millis(pay.rollback.base_delay_ms),
            backoff_multiplier: pay.rollback.backoff_multiplier,
        },
    ));
    let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig {
        failure_threshold: pay.breaker.failure_threshold,
        cooldown: Duration::from_millis(pay.breaker.cooldown_ms),
        observation_window: Duration::from_millis(pay.breaker.observation_window_ms),
    }));
    let metrics = Arc::new(PaymentMetrics::new(Arc::new(InMemoryMetricsSink::new())));
    let features = Arc::new(FeatureManager::new(Arc::new(InMemoryFeatureStore::new())));

    let orchestrator = Arc::new(PaymentOrchestrator::new(
        store.clone(),
        locks,
        transactions.clone(),
        rollbacks.clone(),
        breakers,
        metrics,
        features,
        gateway.clone(),
        OrchestratorConfig {
            lock_ttl: pay.lock_ttl(),
            gateway_deadline: pay.gateway_deadline(),
            routing_flag: pay.routing_flag.clone(),
        },
    ));

    // Background sweep for expired transactions and failed compensations
    let worker = RecoveryWorker::new(
        transactions,
        rollbacks,
        WorkerConfig {
            scan_interval: Duration::from_millis(pay.worker.scan_interval_ms),
        },
    );
    tokio::spawn(async move { worker.run().await });

    // Seed an order the way the ticketing backend would
    store.insert_order(Order::place(
        42,
        7,
        1001,
        vec![OrderItem {
            kind: ItemKind::Ticket,
            name: "GA pass".to_string(),
            price: 2500,
            tip: None,
        }],
    )?);

    let request = PaymentRequest {
        idempotency_key: "demo-order-42".to_string(),
        order_id: 42,
        venue_id: 7,
        user_id: 1001,
        amount: 2500,
        currency: "USD".to_string(),
        metadata: vec![("channel".to_string(), "demo".into())],
    };

    let captured = orchestrator.process(request.clone()).await?;
    println!("capture:   {}", serde_json::to_string_pretty(&captured)?);

    // Same idempotency key again: replayed, never a second charge
    let replayed = orchestrator.process(request).await?;
    println!("replay:    {}", serde_json::to_string_pretty(&replayed)?);

    // A declined charge runs the rollback path to a terminal failed result
    gateway.decline_next("insufficient funds");
    let declined = orchestrator
        .process(PaymentRequest {
            idempotency_key: "demo-order-43".to_string(),
            order_id: 43,
            venue_id: 7,
            user_id: 1002,
            amount: 4800,
            currency: "USD".to_string(),
            metadata: vec![],
        })
        .await?;
    println!("declined:  {}", serde_json::to_string_pretty(&declined)?);

    let health = orchestrator.health_report();
    println!("health:    {}", serde_json::to_string_pretty(&health)?);

    info!(charges = gateway.authorize_count(), "venuepay demo done");
    Ok(())
}
