//! Payment Core Types
//!
//! Type definitions for the payment orchestration subsystem.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core_types::{Amount, Metadata, OrderId, TimestampMs, UserId, VenueId, now_ms};

/// Payment intent ID - ULID-based unique identifier
///
/// ULIDs are monotonic, sortable, and need no machine-id coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentIntentId(ulid::Ulid);

impl PaymentIntentId {
    /// Generate a new unique PaymentIntentId
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for PaymentIntentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PaymentIntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PaymentIntentId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Transaction ID - ULID-based unique identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(ulid::Ulid);

impl TransactionId {
    /// Generate a new unique TransactionId
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Rollback point ID - ULID-based unique identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RollbackId(ulid::Ulid);

impl RollbackId {
    /// Generate a new unique RollbackId
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for RollbackId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RollbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RollbackId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Payment intent lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentState {
    /// Created, gateway not yet called
    Pending,
    /// Gateway authorized but not captured
    Authorized,
    /// Terminal: funds captured
    Captured,
    /// Terminal: gateway rejected or protocol failed
    Failed,
    /// Terminal: captured then refunded via compensation
    Refunded,
}

impl IntentState {
    /// Check if this is a terminal state
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentState::Captured | IntentState::Failed | IntentState::Refunded
        )
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentState::Pending => "PENDING",
            IntentState::Authorized => "AUTHORIZED",
            IntentState::Captured => "CAPTURED",
            IntentState::Failed => "FAILED",
            IntentState::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for IntentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment intent record
///
/// Exclusively owned by the invocation that created it until commit, after
/// which ownership passes to the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Unique intent ID
    pub intent_id: PaymentIntentId,
    /// Caller-supplied idempotency key (unique per logical request)
    pub idempotency_key: String,
    /// Amount in minor units
    pub amount: Amount,
    /// ISO currency code
    pub currency: String,
    /// Order being paid for
    pub order_id: OrderId,
    /// Venue the order belongs to
    pub venue_id: VenueId,
    /// Paying user
    pub user_id: UserId,
    /// Current lifecycle state
    pub state: IntentState,
    /// Submission attempt count for this idempotency key
    pub attempts: u32,
    /// Gateway charge reference, once authorized
    pub gateway_reference: Option<String>,
    /// Last failure reason, for reconciliation
    pub failure_reason: Option<String>,
    /// Created timestamp (millis)
    pub created_at: TimestampMs,
    /// Last updated timestamp (millis)
    pub updated_at: TimestampMs,
}

impl PaymentIntent {
    /// Create a new intent in PENDING state from a request
    pub fn from_request(req: &PaymentRequest) -> Self {
        let now = now_ms();
        Self {
            intent_id: PaymentIntentId::new(),
            idempotency_key: req.idempotency_key.clone(),
            amount: req.amount,
            currency: req.currency.clone(),
            order_id: req.order_id,
            venue_id: req.venue_id,
            user_id: req.user_id,
            state: IntentState::Pending,
            attempts: 1,
            gateway_reference: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl fmt::Display for PaymentIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Intent[{}] key={} order={} amount={} {} state={}",
            self.intent_id,
            self.idempotency_key,
            self.order_id,
            self.amount,
            self.currency,
            self.state
        )
    }
}

/// Payment request from the API layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Caller-supplied idempotency key
    pub idempotency_key: String,
    /// Order being paid for
    pub order_id: OrderId,
    /// Venue the order belongs to
    pub venue_id: VenueId,
    /// Paying user
    pub user_id: UserId,
    /// Amount in minor units
    pub amount: Amount,
    /// ISO currency code
    pub currency: String,
    /// Request metadata, carried into order history on success
    #[serde(default)]
    pub metadata: Metadata,
}

/// Final payment status returned to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Captured,
    Failed,
}

/// Result of one orchestrated payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentResult {
    pub status: PaymentStatus,
    pub intent_id: PaymentIntentId,
    pub transaction_id: Option<TransactionId>,
    pub rollback_id: Option<RollbackId>,
    pub gateway_reference: Option<String>,
    pub failure_reason: Option<String>,
    /// True when this result was served from an earlier captured intent
    pub replayed: bool,
}

/// Bounded retry policy with an exponential backoff schedule
///
/// Parameterized at the call site; there are no ad hoc sleep loops.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Multiplier applied per subsequent attempt
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay to wait before attempt `attempt` (0-based); `None` when the
    /// budget is exhausted or before the first attempt.
    pub fn delay_before(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return Some(Duration::ZERO);
        }
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = self.backoff_multiplier.powi(attempt as i32 - 1);
        Some(self.base_delay.mul_f64(factor))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
        }
    }
}

/// Cooperative cancellation flag
///
/// Honored only before the transaction begins; once a gateway call is issued
/// the orchestrator runs the success or rollback path to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
