//! VenuePay - Payment Transaction Orchestrator
//!
//! Settles venue-ticketing payments exactly once despite concurrent
//! duplicate submissions, transient outages, and crashes mid-flight.
//!
//! # Modules
//!
//! - [`core_types`] - Shared type aliases and metadata values
//! - [`config`] - YAML configuration with per-subsystem sections
//! - [`logging`] - tracing subscriber setup
//! - [`payment`] - The orchestrator and all of its collaborators:
//!   distributed locks, bounded transactions, compensating rollback,
//!   circuit breakers, the order state machine, metrics, and feature flags

pub mod config;
pub mod core_types;
pub mod logging;
pub mod payment;

// Convenient re-exports at crate root
pub use config::AppConfig;
pub use core_types::{Amount, MetaValue, Metadata, OrderId, UserId, VenueId};
pub use payment::{
    BreakerConfig, BreakerState, CancelFlag, ChargeStatus, CircuitBreaker,
    CircuitBreakerRegistry, FeatureFlag, FeatureManager, FeatureStore, FlagContext, GatewayOutcome,
    HealthReport, InMemoryFeatureStore, InMemoryLockStore, InMemoryMetricsSink,
    InMemorySessionStore, IntentState, ItemKind, LockManager, LockStore, MetricsSink, Order,
    OrderItem, OrderState, OrderStateMachine, OrchestratorConfig, PaymentError, PaymentFailure,
    PaymentGateway, PaymentIntent, PaymentIntentId, PaymentMetrics, PaymentOrchestrator,
    PaymentRequest, PaymentResult, PaymentStatus, PaymentStore, RecoveryWorker, RetryPolicy,
    RollbackId, RollbackManager, SessionStore, SimulatedGateway, TransactionId,
    TransactionManager, TxState, WorkerConfig,
};
