//! Payment Transaction Orchestrator
//!
//! Settles venue-ticketing payments exactly once despite concurrent
//! duplicate submissions, transient gateway/store outages, and crashes
//! mid-flight.
//!
//! # Architecture
//!
//! ```text
//! PaymentOrchestrator
//! ├── LockManager ............ LockStore (set-if-absent-with-ttl)
//! ├── CircuitBreakerRegistry .. one breaker per dependency
//! ├── FeatureManager .......... FeatureStore (routing flags)
//! ├── TransactionManager ...... SessionStore (begin/stage/commit/abort)
//! ├── RollbackManager ......... PaymentGateway (refund compensations)
//! ├── OrderStateMachine ....... pure transition logic
//! └── PaymentMetrics .......... MetricsSink (never raises)
//! ```
//!
//! # Safety Invariants
//!
//! 1. **One success per key**: an idempotency key maps to at most one
//!    captured intent; replays return the original result
//! 2. **Single holder**: at most one unexpired lock exists per key
//! 3. **Compensate, never abandon**: once the gateway is called, the
//!    success or rollback path runs to completion
//! 4. **Bounded lifetimes**: every transaction carries a deadline and every
//!    lock a TTL, so a crash mid-flight cannot wedge a key forever

pub mod breaker;
pub mod error;
pub mod features;
pub mod gateway;
pub mod health;
pub mod lock;
pub mod metrics;
pub mod orchestrator;
pub mod rollback;
pub mod state_machine;
pub mod store;
pub mod transaction;
pub mod types;
pub mod worker;

#[cfg(test)]
mod integration_tests;

// Re-exports for convenience
pub use breaker::{
    Admission, BreakerConfig, BreakerState, CircuitBreaker, CircuitBreakerRegistry,
    CircuitBreakerState,
};
pub use error::{PaymentError, PaymentFailure};
pub use features::{
    FeatureFlag, FeatureManager, FeatureStore, FlagContext, InMemoryFeatureStore, Rollout,
};
pub use gateway::{ChargeStatus, GatewayOutcome, PaymentGateway, SimulatedGateway};
pub use health::HealthReport;
pub use lock::{InMemoryLockStore, LockManager, LockStore, LockToken};
pub use metrics::{InMemoryMetricsSink, MetricsReport, MetricsSink, PaymentMetrics};
pub use orchestrator::{GATEWAY_DEPENDENCY, OrchestratorConfig, PaymentOrchestrator};
pub use rollback::{Compensation, RollbackManager, RollbackSummary};
pub use state_machine::{
    ItemKind, Order, OrderItem, OrderState, OrderStateMachine, Verification,
};
pub use store::{PaymentStore, StagedWrite};
pub use transaction::{InMemorySessionStore, SessionStore, TransactionManager, TxState};
pub use types::{
    CancelFlag, IntentState, PaymentIntent, PaymentIntentId, PaymentRequest, PaymentResult,
    PaymentStatus, RetryPolicy, RollbackId, TransactionId,
};
pub use worker::{RecoveryWorker, WorkerConfig};
