//! Transaction Manager
//!
//! Bounded atomic sessions over a `SessionStore` backing primitive. Every
//! transaction carries its own deadline, independent of individual step
//! timeouts, and auto-aborts on expiry - together with the lock TTL this
//! guarantees eventual lock release even after a crash mid-flight.
//!
//! # State Machine
//!
//! ```text
//! PENDING → COMMITTED
//!    ↓
//! ABORTED   (rollback, conflict, or deadline expiry)
//! ```
//!
//! The ordered step log is immutable once a transaction is finalized.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::core_types::{TimestampMs, now_ms};

use super::error::PaymentError;
use super::store::{PaymentStore, StagedWrite};
use super::types::TransactionId;

/// Session handle issued by the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(ulid::Ulid);

impl SessionId {
    fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Atomic-session primitive
///
/// Any store offering begin / stage / commit / abort / is-active suffices.
/// Commit applies all staged writes atomically or none of them.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn begin(&self) -> Result<SessionId, PaymentError>;
    async fn stage(&self, session: SessionId, write: StagedWrite) -> Result<(), PaymentError>;
    async fn commit(&self, session: SessionId) -> Result<(), PaymentError>;
    async fn abort(&self, session: SessionId) -> Result<(), PaymentError>;
    async fn is_active(&self, session: SessionId) -> bool;
}

/// In-memory session store over the payment backing store
pub struct InMemorySessionStore {
    store: Arc<PaymentStore>,
    sessions: DashMap<SessionId, Vec<StagedWrite>>,
}

impl InMemorySessionStore {
    pub fn new(store: Arc<PaymentStore>) -> Self {
        Self {
            store,
            sessions: DashMap::new(),
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn begin(&self) -> Result<SessionId, PaymentError> {
        let session = SessionId::new();
        self.sessions.insert(session, Vec::new());
        Ok(session)
    }

    async fn stage(&self, session: SessionId, write: StagedWrite) -> Result<(), PaymentError> {
        match self.sessions.get_mut(&session) {
            Some(mut writes) => {
                writes.push(write);
                Ok(())
            }
            None => Err(PaymentError::Store(format!(
                "session {session} is not active"
            ))),
        }
    }

    async fn commit(&self, session: SessionId) -> Result<(), PaymentError> {
        let (_, writes) = self
            .sessions
            .remove(&session)
            .ok_or_else(|| PaymentError::Store(format!("session {session} is not active")))?;
        self.store.apply_versioned(&writes)
    }

    async fn abort(&self, session: SessionId) -> Result<(), PaymentError> {
        // Idempotent: aborting an unknown session is a no-op
        self.sessions.remove(&session);
        Ok(())
    }

    async fn is_active(&self, session: SessionId) -> bool {
        self.sessions.contains_key(&session)
    }
}

/// Transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    Pending,
    Committed,
    Aborted,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Pending => "PENDING",
            TxState::Committed => "COMMITTED",
            TxState::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One step-log entry
#[derive(Debug, Clone)]
pub struct StepEntry {
    pub step: String,
    pub at: TimestampMs,
}

struct TxRecord {
    session: SessionId,
    context: String,
    state: TxState,
    /// Set while a commit or abort is in flight, so a concurrent finalizer
    /// observes AlreadyFinalized instead of racing the session store.
    finalizing: bool,
    steps: Vec<StepEntry>,
    deadline_at: TimestampMs,
}

/// Transaction manager
pub struct TransactionManager {
    sessions: Arc<dyn SessionStore>,
    deadline: Duration,
    txs: DashMap<TransactionId, TxRecord>,
}

impl TransactionManager {
    pub fn new(sessions: Arc<dyn SessionStore>, deadline: Duration) -> Self {
        Self {
            sessions,
            deadline,
            txs: DashMap::new(),
        }
    }

    /// Open a deadline-bounded transaction.
    pub async fn begin(&self, context: &str) -> Result<TransactionId, PaymentError> {
        let session = self.sessions.begin().await?;
        let id = TransactionId::new();
        let now = now_ms();
        self.txs.insert(
            id,
            TxRecord {
                session,
                context: context.to_string(),
                state: TxState::Pending,
                finalizing: false,
                steps: vec![StepEntry {
                    step: "begin".to_string(),
                    at: now,
                }],
                deadline_at: now + self.deadline.as_millis() as i64,
            },
        );
        debug!(transaction_id = %id, context = context, "transaction opened");
        Ok(id)
    }

    /// Stage a write and append a step-log entry.
    ///
    /// Fails `AlreadyFinalized` if the transaction is not pending; a
    /// transaction past its deadline is aborted first.
    pub async fn stage(
        &self,
        id: TransactionId,
        step: &str,
        write: StagedWrite,
    ) -> Result<(), PaymentError> {
        if self.expire_if_overdue(id).await? {
            return Err(PaymentError::AlreadyFinalized { transaction_id: id });
        }

        let session = {
            let mut record = self
                .txs
                .get_mut(&id)
                .ok_or(PaymentError::TransactionNotFound(id))?;
            if record.state != TxState::Pending || record.finalizing {
                return Err(PaymentError::AlreadyFinalized { transaction_id: id });
            }
            record.steps.push(StepEntry {
                step: step.to_string(),
                at: now_ms(),
            });
            record.session
        };

        self.sessions.stage(session, write).await
    }

    /// Commit the transaction, applying all staged writes atomically.
    ///
    /// Fails `TransactionConflict` on write conflicts and `AlreadyFinalized`
    /// if the transaction is not pending.
    pub async fn commit(&self, id: TransactionId) -> Result<(), PaymentError> {
        if self.expire_if_overdue(id).await? {
            return Err(PaymentError::AlreadyFinalized { transaction_id: id });
        }

        let session = self.claim_finalize(id)?;

        match self.sessions.commit(session).await {
            Ok(()) => {
                self.finalize(id, TxState::Committed, "commit");
                info!(transaction_id = %id, "transaction committed");
                Ok(())
            }
            Err(e) => {
                // The session store discarded the staged writes already
                self.finalize(id, TxState::Aborted, "commit_failed");
                warn!(transaction_id = %id, error = %e, "commit failed, transaction aborted");
                Err(e)
            }
        }
    }

    /// Abort the transaction, discarding staged writes. Idempotent.
    pub async fn rollback(&self, id: TransactionId) -> Result<(), PaymentError> {
        self.rollback_with_step(id, "rollback").await
    }

    /// Current state of a transaction.
    pub fn state(&self, id: TransactionId) -> Result<TxState, PaymentError> {
        self.txs
            .get(&id)
            .map(|record| record.state)
            .ok_or(PaymentError::TransactionNotFound(id))
    }

    /// Ordered step log, for the orchestrator and tests.
    pub fn steps(&self, id: TransactionId) -> Result<Vec<StepEntry>, PaymentError> {
        self.txs
            .get(&id)
            .map(|record| record.steps.clone())
            .ok_or(PaymentError::TransactionNotFound(id))
    }

    /// Abort every pending transaction past its deadline.
    ///
    /// Returns the aborted ids. Called by the recovery worker; the same
    /// check also runs lazily on stage/commit.
    pub async fn abort_expired(&self) -> Result<Vec<TransactionId>, PaymentError> {
        let now = now_ms();
        let overdue: Vec<TransactionId> = self
            .txs
            .iter()
            .filter(|entry| {
                entry.state == TxState::Pending && !entry.finalizing && now >= entry.deadline_at
            })
            .map(|entry| *entry.key())
            .collect();

        let mut aborted = Vec::new();
        for id in overdue {
            match self.rollback_with_step(id, "deadline_abort").await {
                Ok(()) => aborted.push(id),
                // Lost the race to a concurrent finalizer
                Err(PaymentError::AlreadyFinalized { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(aborted)
    }

    async fn rollback_with_step(
        &self,
        id: TransactionId,
        step: &'static str,
    ) -> Result<(), PaymentError> {
        let session = {
            let mut record = self
                .txs
                .get_mut(&id)
                .ok_or(PaymentError::TransactionNotFound(id))?;
            match record.state {
                TxState::Aborted => return Ok(()),
                TxState::Committed => {
                    return Err(PaymentError::AlreadyFinalized { transaction_id: id });
                }
                TxState::Pending if record.finalizing => {
                    return Err(PaymentError::AlreadyFinalized { transaction_id: id });
                }
                TxState::Pending => {
                    record.finalizing = true;
                    record.session
                }
            }
        };

        self.sessions.abort(session).await?;
        self.finalize(id, TxState::Aborted, step);
        info!(transaction_id = %id, reason = step, "transaction aborted");
        Ok(())
    }

    /// CAS Pending -> finalizing; errors if already claimed or finalized.
    fn claim_finalize(&self, id: TransactionId) -> Result<SessionId, PaymentError> {
        let mut record = self
            .txs
            .get_mut(&id)
            .ok_or(PaymentError::TransactionNotFound(id))?;
        if record.state != TxState::Pending || record.finalizing {
            return Err(PaymentError::AlreadyFinalized { transaction_id: id });
        }
        record.finalizing = true;
        Ok(record.session)
    }

    fn finalize(&self, id: TransactionId, state: TxState, step: &str) {
        if let Some(mut record) = self.txs.get_mut(&id) {
            record.state = state;
            record.finalizing = false;
            record.steps.push(StepEntry {
                step: step.to_string(),
                at: now_ms(),
            });
        }
    }

    /// Abort the transaction if past its deadline; true when it expired now
    /// or earlier.
    async fn expire_if_overdue(&self, id: TransactionId) -> Result<bool, PaymentError> {
        let overdue = {
            let record = self
                .txs
                .get(&id)
                .ok_or(PaymentError::TransactionNotFound(id))?;
            record.state == TxState::Pending
                && !record.finalizing
                && now_ms() >= record.deadline_at
        };
        if overdue {
            match self.rollback_with_step(id, "deadline_abort").await {
                Ok(()) | Err(PaymentError::AlreadyFinalized { .. }) => {}
                Err(e) => return Err(e),
            }
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::types::{PaymentIntent, PaymentRequest};

    fn intent(key: &str) -> PaymentIntent {
        PaymentIntent::from_request(&PaymentRequest {
            idempotency_key: key.to_string(),
            order_id: 42,
            venue_id: 7,
            user_id: 1001,
            amount: 2500,
            currency: "USD".to_string(),
            metadata: vec![],
        })
    }

    fn manager(deadline: Duration) -> (TransactionManager, Arc<PaymentStore>) {
        let store = Arc::new(PaymentStore::new());
        let sessions = Arc::new(InMemorySessionStore::new(store.clone()));
        (TransactionManager::new(sessions, deadline), store)
    }

    #[tokio::test]
    async fn test_begin_stage_commit() {
        let (txs, store) = manager(Duration::from_secs(5));

        let tx = txs.begin("pay:k1").await.unwrap();
        assert_eq!(txs.state(tx).unwrap(), TxState::Pending);

        txs.stage(
            tx,
            "write_intent",
            StagedWrite::PutIntent {
                base_version: 0,
                intent: intent("k1"),
            },
        )
        .await
        .unwrap();

        txs.commit(tx).await.unwrap();
        assert_eq!(txs.state(tx).unwrap(), TxState::Committed);
        assert!(store.get_intent("k1").is_some());

        let steps: Vec<String> = txs.steps(tx).unwrap().into_iter().map(|s| s.step).collect();
        assert_eq!(steps, vec!["begin", "write_intent", "commit"]);
    }

    #[tokio::test]
    async fn test_commit_twice_fails_already_finalized() {
        let (txs, _) = manager(Duration::from_secs(5));
        let tx = txs.begin("pay:k1").await.unwrap();
        txs.commit(tx).await.unwrap();

        let err = txs.commit(tx).await.unwrap_err();
        assert!(matches!(err, PaymentError::AlreadyFinalized { .. }));
    }

    #[tokio::test]
    async fn test_rollback_is_idempotent() {
        let (txs, store) = manager(Duration::from_secs(5));
        let tx = txs.begin("pay:k1").await.unwrap();
        txs.stage(
            tx,
            "write_intent",
            StagedWrite::PutIntent {
                base_version: 0,
                intent: intent("k1"),
            },
        )
        .await
        .unwrap();

        txs.rollback(tx).await.unwrap();
        txs.rollback(tx).await.unwrap();
        assert_eq!(txs.state(tx).unwrap(), TxState::Aborted);
        assert!(store.get_intent("k1").is_none());
    }

    #[tokio::test]
    async fn test_commit_conflict_aborts() {
        let (txs, store) = manager(Duration::from_secs(5));

        // Both transactions stage against version 0 of the same key
        let tx1 = txs.begin("pay:k1").await.unwrap();
        let tx2 = txs.begin("pay:k1").await.unwrap();
        for tx in [tx1, tx2] {
            txs.stage(
                tx,
                "write_intent",
                StagedWrite::PutIntent {
                    base_version: 0,
                    intent: intent("k1"),
                },
            )
            .await
            .unwrap();
        }

        txs.commit(tx1).await.unwrap();
        let err = txs.commit(tx2).await.unwrap_err();
        assert!(matches!(err, PaymentError::TransactionConflict { .. }));
        assert_eq!(txs.state(tx2).unwrap(), TxState::Aborted);
        assert_eq!(store.get_intent("k1").unwrap().1, 1);
    }

    #[tokio::test]
    async fn test_deadline_auto_abort_on_access() {
        let (txs, _) = manager(Duration::from_millis(20));
        let tx = txs.begin("pay:k1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        let err = txs.commit(tx).await.unwrap_err();
        assert!(matches!(err, PaymentError::AlreadyFinalized { .. }));
        assert_eq!(txs.state(tx).unwrap(), TxState::Aborted);
    }

    #[tokio::test]
    async fn test_abort_expired_sweep() {
        let (txs, _) = manager(Duration::from_millis(20));
        let stale = txs.begin("pay:stale").await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        // Opened after the sleep, so its deadline has not passed yet
        let fresh = txs.begin("pay:fresh").await.unwrap();

        let aborted = txs.abort_expired().await.unwrap();
        assert_eq!(aborted, vec![stale]);
        assert_eq!(txs.state(stale).unwrap(), TxState::Aborted);
        assert_eq!(txs.state(fresh).unwrap(), TxState::Pending);
    }

    #[tokio::test]
    async fn test_step_log_immutable_after_finalize() {
        let (txs, _) = manager(Duration::from_secs(5));
        let tx = txs.begin("pay:k1").await.unwrap();
        txs.rollback(tx).await.unwrap();

        let err = txs
            .stage(
                tx,
                "late_write",
                StagedWrite::PutIntent {
                    base_version: 0,
                    intent: intent("k1"),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::AlreadyFinalized { .. }));

        let steps: Vec<String> = txs.steps(tx).unwrap().into_iter().map(|s| s.step).collect();
        assert_eq!(steps, vec!["begin", "rollback"]);
    }
}
