//! Payment Backing Store
//!
//! Committed home for intents and orders. Every record carries a version;
//! transactional writes name the version they were staged against, and a
//! commit applying a stale write fails with `TransactionConflict`
//! (first-writer-wins).

use std::sync::Mutex;

use dashmap::DashMap;

use crate::core_types::OrderId;

use super::error::PaymentError;
use super::state_machine::Order;
use super::types::PaymentIntent;

/// Version a staged write was read against. 0 means "expects absent".
pub type Version = u64;

/// One write staged inside a transaction
#[derive(Debug, Clone)]
pub enum StagedWrite {
    PutIntent {
        base_version: Version,
        intent: PaymentIntent,
    },
    PutOrder {
        base_version: Version,
        order: Order,
    },
}

impl StagedWrite {
    /// Conflict-reporting key for this write
    pub fn key(&self) -> String {
        match self {
            StagedWrite::PutIntent { intent, .. } => {
                format!("intent:{}", intent.idempotency_key)
            }
            StagedWrite::PutOrder { order, .. } => format!("order:{}", order.order_id),
        }
    }
}

struct Versioned<T> {
    value: T,
    version: Version,
}

/// In-memory backing store
///
/// Intents are keyed by idempotency key - the uniqueness invariant lives
/// here. Reads are lock-free (dashmap); versioned multi-write application is
/// serialized by a store-wide gate so conflict checks and writes are atomic.
#[derive(Default)]
pub struct PaymentStore {
    intents: DashMap<String, Versioned<PaymentIntent>>,
    orders: DashMap<OrderId, Versioned<Order>>,
    commit_gate: Mutex<()>,
}

impl PaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed intent for an idempotency key, with its version
    pub fn get_intent(&self, idempotency_key: &str) -> Option<(PaymentIntent, Version)> {
        self.intents
            .get(idempotency_key)
            .map(|entry| (entry.value.clone(), entry.version))
    }

    /// Committed order, with its version
    pub fn get_order(&self, order_id: OrderId) -> Option<(Order, Version)> {
        self.orders
            .get(&order_id)
            .map(|entry| (entry.value.clone(), entry.version))
    }

    /// Seed an order outside any payment transaction (order placement is an
    /// upstream concern; payments only advance existing orders).
    pub fn insert_order(&self, order: Order) {
        self.orders.insert(
            order.order_id,
            Versioned {
                value: order,
                version: 1,
            },
        );
    }

    /// Unconditional versioned put of a terminal intent record.
    ///
    /// Used for failed intents written after a transaction aborted, so a
    /// later retry sees the attempt count. Successful intents only ever land
    /// through a transactional commit.
    pub fn put_intent_direct(&self, intent: PaymentIntent) {
        let _gate = self.commit_gate.lock().unwrap();
        match self.intents.entry(intent.idempotency_key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let next = occupied.get().version + 1;
                occupied.insert(Versioned {
                    value: intent,
                    version: next,
                });
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Versioned {
                    value: intent,
                    version: 1,
                });
            }
        }
    }

    /// Apply a batch of staged writes atomically.
    ///
    /// All version checks pass before any write lands; a stale base version
    /// fails the whole batch with `TransactionConflict`.
    pub(crate) fn apply_versioned(&self, writes: &[StagedWrite]) -> Result<(), PaymentError> {
        let _gate = self.commit_gate.lock().unwrap();

        for write in writes {
            let current = match write {
                StagedWrite::PutIntent { intent, .. } => self
                    .intents
                    .get(&intent.idempotency_key)
                    .map(|entry| entry.version)
                    .unwrap_or(0),
                StagedWrite::PutOrder { order, .. } => self
                    .orders
                    .get(&order.order_id)
                    .map(|entry| entry.version)
                    .unwrap_or(0),
            };
            let base = match write {
                StagedWrite::PutIntent { base_version, .. } => *base_version,
                StagedWrite::PutOrder { base_version, .. } => *base_version,
            };
            if current != base {
                return Err(PaymentError::TransactionConflict { key: write.key() });
            }
        }

        for write in writes {
            match write {
                StagedWrite::PutIntent {
                    base_version,
                    intent,
                } => {
                    self.intents.insert(
                        intent.idempotency_key.clone(),
                        Versioned {
                            value: intent.clone(),
                            version: base_version + 1,
                        },
                    );
                }
                StagedWrite::PutOrder {
                    base_version,
                    order,
                } => {
                    self.orders.insert(
                        order.order_id,
                        Versioned {
                            value: order.clone(),
                            version: base_version + 1,
                        },
                    );
                }
            }
        }
        Ok(())
    }
}
