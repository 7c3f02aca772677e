//! Distributed Lock Manager
//!
//! Mutual exclusion per key over a `LockStore` backing primitive. Acquisition
//! never blocks-and-waits: it fails immediately with `Busy` if the key is
//! held, and callers bring their own retry policy. With a correctly sized
//! TTL, at most one caller system-wide proceeds past acquisition for a key.
//!
//! # Safety Invariants
//!
//! 1. Acquisition is atomic set-if-absent-with-ttl; there is no check/set gap
//! 2. Release is delete-if-token-matches; a stale holder can never release a
//!    lock re-acquired by someone else after expiry
//! 3. `is_locked` is diagnostic only, never used for correctness

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::core_types::{TimestampMs, now_ms};

use super::error::PaymentError;

/// Opaque holder token proving lock ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(ulid::Ulid);

impl LockToken {
    fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stored lock record
#[derive(Debug, Clone)]
pub struct LockEntry {
    pub token: LockToken,
    pub acquired_at: TimestampMs,
    pub ttl: Duration,
    pub expires_at: TimestampMs,
}

impl LockEntry {
    fn new(ttl: Duration) -> Self {
        let now = now_ms();
        Self {
            token: LockToken::new(),
            acquired_at: now,
            ttl,
            expires_at: now + ttl.as_millis() as i64,
        }
    }

    #[inline]
    fn is_expired(&self, now: TimestampMs) -> bool {
        now >= self.expires_at
    }
}

/// Backing lock store primitive
///
/// Any store offering atomic "set-if-absent-with-ttl" and
/// "delete-if-token-matches" suffices.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically install `entry` for `key` if no unexpired lock exists.
    /// Returns the surviving entry's remaining TTL on refusal.
    async fn put_if_absent(&self, key: &str, entry: LockEntry)
    -> Result<Option<Duration>, PaymentError>;

    /// Delete the lock for `key` only if `token` matches the current holder.
    /// Returns whether a matching lock was removed.
    async fn delete_if_match(&self, key: &str, token: LockToken) -> Result<bool, PaymentError>;

    /// Best-effort peek at the current entry, expired or not.
    async fn peek(&self, key: &str) -> Result<Option<LockEntry>, PaymentError>;
}

/// In-process lock store
///
/// Correct within one process; production deployments swap in a store backed
/// by a shared service with the same two primitives. Atomicity comes from the
/// dashmap shard entry lock.
#[derive(Default)]
pub struct InMemoryLockStore {
    locks: DashMap<String, LockEntry>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn put_if_absent(
        &self,
        key: &str,
        entry: LockEntry,
    ) -> Result<Option<Duration>, PaymentError> {
        let now = now_ms();
        // Entry API holds the shard lock across the check and the insert.
        match self.locks.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.is_expired(now) {
                    occupied.insert(entry);
                    Ok(None)
                } else {
                    let remaining = (current.expires_at - now).max(0) as u64;
                    Ok(Some(Duration::from_millis(remaining)))
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(None)
            }
        }
    }

    async fn delete_if_match(&self, key: &str, token: LockToken) -> Result<bool, PaymentError> {
        Ok(self
            .locks
            .remove_if(key, |_, entry| entry.token == token)
            .is_some())
    }

    async fn peek(&self, key: &str) -> Result<Option<LockEntry>, PaymentError> {
        Ok(self.locks.get(key).map(|entry| entry.clone()))
    }
}

/// Distributed lock manager
pub struct LockManager {
    store: Arc<dyn LockStore>,
    /// Refused acquisitions, exposed to the health surface
    contention: AtomicU64,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            contention: AtomicU64::new(0),
        }
    }

    /// Acquire the lock for `key` with the given TTL.
    ///
    /// Fails `Busy` immediately if an unexpired lock exists; the retry hint
    /// is the surviving lock's remaining TTL.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockToken, PaymentError> {
        let entry = LockEntry::new(ttl);
        let token = entry.token;

        match self.store.put_if_absent(key, entry).await? {
            None => {
                debug!(key = key, token = %token, "lock acquired");
                Ok(token)
            }
            Some(remaining) => {
                self.contention.fetch_add(1, Ordering::Relaxed);
                debug!(key = key, remaining_ms = remaining.as_millis() as u64, "lock busy");
                Err(PaymentError::Busy {
                    key: key.to_string(),
                    retry_after: remaining,
                })
            }
        }
    }

    /// Release the lock for `key`.
    ///
    /// No-op if `token` no longer matches the current holder, which happens
    /// when the lock expired and was re-acquired by someone else.
    pub async fn release(&self, key: &str, token: LockToken) -> Result<(), PaymentError> {
        let removed = self.store.delete_if_match(key, token).await?;
        if removed {
            debug!(key = key, token = %token, "lock released");
        } else {
            warn!(key = key, token = %token, "release skipped: token no longer holds lock");
        }
        Ok(())
    }

    /// Best-effort diagnostic: is `key` currently locked?
    pub async fn is_locked(&self, key: &str) -> Result<bool, PaymentError> {
        let now = now_ms();
        Ok(self
            .store
            .peek(key)
            .await?
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false))
    }

    /// Number of refused acquisitions since startup
    pub fn contention_count(&self) -> u64 {
        self.contention.load(Ordering::Relaxed)
    }
}
