//! Feature Flags
//!
//! Gating for optional, correctness-equivalent paths only - a flag may pick
//! which route a payment takes, never whether its guarantees hold. Percentage
//! rollouts hash a caller-chosen stable context key (e.g. the venue id) with
//! crc32, so a given context lands in the same bucket on every process.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One context-override rule, matched against evaluation context attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRule {
    /// Context attribute to match
    pub key: String,
    /// Required attribute value
    pub value: String,
    /// Flag result when the rule matches
    pub enabled: bool,
}

/// How a flag rolls out when no override matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rollout {
    /// Same answer for everyone
    Global(bool),
    /// Enabled for this percentage of context-key buckets (0-100)
    Percentage(u8),
}

/// Flag definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub name: String,
    pub rollout: Rollout,
    /// Checked in order; the first matching rule wins
    #[serde(default)]
    pub overrides: Vec<OverrideRule>,
}

/// Evaluation context
#[derive(Debug, Clone, Default)]
pub struct FlagContext {
    /// Stable bucketing key, e.g. the venue id
    pub key: String,
    /// Attributes matched by override rules
    pub attrs: Vec<(String, String)>,
}

impl FlagContext {
    pub fn for_key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            attrs: Vec::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }
}

/// Flag definition store; externally persisted in production
pub trait FeatureStore: Send + Sync {
    fn get(&self, name: &str) -> Option<FeatureFlag>;
    fn put(&self, flag: FeatureFlag);
}

/// In-memory flag store
#[derive(Default)]
pub struct InMemoryFeatureStore {
    flags: DashMap<String, FeatureFlag>,
}

impl InMemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FeatureStore for InMemoryFeatureStore {
    fn get(&self, name: &str) -> Option<FeatureFlag> {
        self.flags.get(name).map(|flag| flag.clone())
    }

    fn put(&self, flag: FeatureFlag) {
        self.flags.insert(flag.name.clone(), flag);
    }
}

/// Feature flag evaluator
pub struct FeatureManager {
    store: Arc<dyn FeatureStore>,
}

impl FeatureManager {
    pub fn new(store: Arc<dyn FeatureStore>) -> Self {
        Self { store }
    }

    /// Evaluate `name` for `context`.
    ///
    /// Unknown flags are disabled. Overrides are checked in declaration
    /// order; otherwise the rollout decides, with percentage rollouts
    /// bucketed on the stable context key.
    pub fn is_enabled(&self, name: &str, context: &FlagContext) -> bool {
        let Some(flag) = self.store.get(name) else {
            return false;
        };

        for rule in &flag.overrides {
            let matched = context
                .attrs
                .iter()
                .any(|(key, value)| *key == rule.key && *value == rule.value);
            if matched {
                debug!(flag = name, rule = %rule.key, enabled = rule.enabled, "flag override matched");
                return rule.enabled;
            }
        }

        match flag.rollout {
            Rollout::Global(enabled) => enabled,
            Rollout::Percentage(pct) => rollout_bucket(name, &context.key) < pct.min(100) as u32,
        }
    }
}

/// Stable bucket in [0, 100) for a (flag, context-key) pair
fn rollout_bucket(flag: &str, context_key: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(flag.as_bytes());
    hasher.update(b":");
    hasher.update(context_key.as_bytes());
    hasher.finalize() % 100
}
