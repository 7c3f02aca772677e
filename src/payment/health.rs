//! Health Surface
//!
//! Snapshot consumed by an external health-check endpoint. This crate only
//! builds the report; serving it is transport plumbing outside the core.

use serde::Serialize;

use crate::core_types::{TimestampMs, now_ms};

use super::breaker::{BreakerState, CircuitBreakerRegistry, CircuitBreakerState};
use super::lock::LockManager;

/// Per-dependency breaker states plus lock contention counters
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub breakers: Vec<CircuitBreakerState>,
    /// Refused lock acquisitions since startup
    pub lock_contention: u64,
    pub generated_at: TimestampMs,
}

impl HealthReport {
    pub fn gather(breakers: &CircuitBreakerRegistry, locks: &LockManager) -> Self {
        Self {
            breakers: breakers.snapshots(),
            lock_contention: locks.contention_count(),
            generated_at: now_ms(),
        }
    }

    /// Degraded when any breaker is not closed
    pub fn is_degraded(&self) -> bool {
        self.breakers
            .iter()
            .any(|snapshot| snapshot.state != BreakerState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::breaker::BreakerConfig;
    use crate::payment::lock::InMemoryLockStore;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_health_report_contents() {
        let registry = CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(30),
            observation_window: Duration::from_secs(60),
        });
        let locks = LockManager::new(Arc::new(InMemoryLockStore::new()));

        locks.acquire("pay:k", Duration::from_secs(5)).await.unwrap();
        let _ = locks.acquire("pay:k", Duration::from_secs(5)).await;

        let healthy = HealthReport::gather(&registry, &locks);
        assert!(!healthy.is_degraded());
        assert_eq!(healthy.lock_contention, 1);

        registry.breaker("gateway").record_failure();
        let degraded = HealthReport::gather(&registry, &locks);
        assert!(degraded.is_degraded());
        assert_eq!(degraded.breakers.len(), 1);

        // Serializes for the health endpoint
        let json = serde_json::to_string(&degraded).unwrap();
        assert!(json.contains("\"dependency\":\"gateway\""));
    }
}
