//! Order Lifecycle State Machine
//!
//! Pure validation and transition logic for orders. No I/O, no async.
//!
//! # State Machine
//!
//! ```text
//! PLACED → VERIFIED → COMPLETED
//! ```
//!
//! Each target state has a validation predicate that must pass before the
//! transition commits. Every successful transition appends exactly one entry
//! to the order's status history; history is never mutated retroactively.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core_types::{Amount, Metadata, OrderId, TimestampMs, UserId, VenueId, now_ms};

use super::error::PaymentError;

/// Order lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    /// Initial state - order recorded, payment not confirmed
    Placed,
    /// Payment confirmed and order contents verified
    Verified,
    /// Terminal: order fulfilled
    Completed,
}

impl OrderState {
    /// Declared edges out of this state
    pub fn allowed_next(&self) -> &'static [OrderState] {
        match self {
            OrderState::Placed => &[OrderState::Verified],
            OrderState::Verified => &[OrderState::Completed],
            OrderState::Completed => &[],
        }
    }

    /// Check if this is a terminal state
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.allowed_next().is_empty()
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Placed => "PLACED",
            OrderState::Verified => "VERIFIED",
            OrderState::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What kind of thing an order line is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Ticket,
    Drink,
    Merch,
}

/// One order line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub kind: ItemKind,
    pub name: String,
    /// Price in minor units
    pub price: Amount,
    /// Tip in minor units; required at completion for drink items
    pub tip: Option<Amount>,
}

/// Verification record attached when an order is verified
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    /// What verified the order (payment intent, staff id, ...)
    pub verified_by: String,
    /// Verification timestamp (millis)
    pub verified_at: TimestampMs,
}

/// One append-only status history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub state: OrderState,
    pub at: TimestampMs,
    pub metadata: Metadata,
}

/// Order record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub venue_id: VenueId,
    pub user_id: UserId,
    pub items: Vec<OrderItem>,
    pub state: OrderState,
    pub verification: Option<Verification>,
    /// Append-only; entries are never edited or removed
    pub status_history: Vec<HistoryEntry>,
}

impl Order {
    /// Create a new order in PLACED state with one initial history entry.
    ///
    /// Fails the PLACED predicate if items are missing or venue/user are
    /// unset.
    pub fn place(
        order_id: OrderId,
        venue_id: VenueId,
        user_id: UserId,
        items: Vec<OrderItem>,
    ) -> Result<Self, PaymentError> {
        let order = Self {
            order_id,
            venue_id,
            user_id,
            items,
            state: OrderState::Placed,
            verification: None,
            status_history: vec![HistoryEntry {
                state: OrderState::Placed,
                at: now_ms(),
                metadata: vec![],
            }],
        };
        validate(&order, OrderState::Placed)?;
        Ok(order)
    }
}

/// Validation predicate for entering `target`
fn validate(order: &Order, target: OrderState) -> Result<(), PaymentError> {
    match target {
        OrderState::Placed => {
            if order.items.is_empty() {
                return Err(PaymentError::Validation {
                    field: "items",
                    reason: "order must contain at least one item".to_string(),
                });
            }
            if order.venue_id == 0 {
                return Err(PaymentError::Validation {
                    field: "venue_id",
                    reason: "venue is required".to_string(),
                });
            }
            if order.user_id == 0 {
                return Err(PaymentError::Validation {
                    field: "user_id",
                    reason: "user is required".to_string(),
                });
            }
            Ok(())
        }
        OrderState::Verified => match &order.verification {
            Some(v) if v.verified_at > 0 => Ok(()),
            Some(_) => Err(PaymentError::Validation {
                field: "verification",
                reason: "verification record has no timestamp".to_string(),
            }),
            None => Err(PaymentError::Validation {
                field: "verification",
                reason: "verification record is required".to_string(),
            }),
        },
        OrderState::Completed => {
            let untipped_drink = order
                .items
                .iter()
                .find(|item| item.kind == ItemKind::Drink && item.tip.is_none());
            match untipped_drink {
                Some(item) => Err(PaymentError::Validation {
                    field: "tip",
                    reason: format!("drink item '{}' requires a tip amount", item.name),
                }),
                None => Ok(()),
            }
        }
    }
}

/// Order state machine
///
/// Stateless; owns only the transition table and predicates.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderStateMachine;

impl OrderStateMachine {
    pub fn new() -> Self {
        Self
    }

    /// Transition `order` to `target`.
    ///
    /// Fails `InvalidTransition` if `target` is not a declared edge from the
    /// current state, or with the predicate's own error if validation fails.
    /// On success appends exactly one history entry.
    pub fn transition(
        &self,
        order: &mut Order,
        target: OrderState,
        metadata: Metadata,
    ) -> Result<(), PaymentError> {
        if !order.state.allowed_next().contains(&target) {
            return Err(PaymentError::InvalidTransition {
                from: order.state,
                to: target,
            });
        }
        validate(order, target)?;

        order.state = target;
        order.status_history.push(HistoryEntry {
            state: target,
            at: now_ms(),
            metadata,
        });
        Ok(())
    }
}
