//! Recovery Worker
//!
//! Background sweep that keeps the subsystem convergent after crashes and
//! outages: aborts transactions past their deadline and retries failed
//! compensations until no dangling side effect remains.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use super::rollback::RollbackManager;
use super::transaction::TransactionManager;

/// Configuration for the recovery worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to run a sweep
    pub scan_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
        }
    }
}

/// Recovery worker
pub struct RecoveryWorker {
    transactions: Arc<TransactionManager>,
    rollbacks: Arc<RollbackManager>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(
        transactions: Arc<TransactionManager>,
        rollbacks: Arc<RollbackManager>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            transactions,
            rollbacks,
            config,
        }
    }

    pub fn with_defaults(
        transactions: Arc<TransactionManager>,
        rollbacks: Arc<RollbackManager>,
    ) -> Self {
        Self::new(transactions, rollbacks, WorkerConfig::default())
    }

    /// Run the sweep loop forever.
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            "starting recovery worker"
        );

        loop {
            if let Err(e) = self.scan_once().await {
                error!(error = %e, "recovery sweep failed");
            }
            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// One sweep cycle. Returns (aborted transactions, recovered
    /// compensations).
    pub async fn scan_once(&self) -> Result<(usize, usize), super::error::PaymentError> {
        let aborted = self.transactions.abort_expired().await?;
        if !aborted.is_empty() {
            info!(count = aborted.len(), "aborted transactions past deadline");
        }

        let recovered = self.rollbacks.retry_failed().await;
        if recovered > 0 {
            info!(count = recovered, "recovered failed compensations");
        }

        let unresolved = self.rollbacks.unresolved_count();
        if unresolved > 0 {
            // Still-dangling side effects get another pass next sweep
            error!(
                target: "venuepay::ops_alert",
                count = unresolved,
                "rollback points with unresolved compensations"
            );
        } else {
            debug!("sweep clean");
        }

        Ok((aborted.len(), recovered))
    }
}
