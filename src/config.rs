//! Application Configuration
//!
//! YAML-file configuration with one section per subsystem. Every section has
//! defaults so a partial file (or none at all, for the demo binary) works.

use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default)]
    pub use_json: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String,
    #[serde(default)]
    pub payment: PaymentConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

fn default_log_file() -> String {
    "venuepay.log".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            log_file: default_log_file(),
            use_json: false,
            rotation: default_rotation(),
            payment: PaymentConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PaymentConfig {
    /// Lock TTL in milliseconds; must exceed worst-case protocol duration
    pub lock_ttl_ms: u64,
    /// Transaction deadline in milliseconds
    pub transaction_deadline_ms: u64,
    /// Per-call deadline for gateway authorize, milliseconds
    pub gateway_deadline_ms: u64,
    /// Feature flag gating the alternate gateway route
    pub routing_flag: String,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub rollback: RollbackSection,
    #[serde(default)]
    pub worker: WorkerSection,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 10_000,
            transaction_deadline_ms: 5_000,
            gateway_deadline_ms: 3_000,
            routing_flag: "gateway-routing-v2".to_string(),
            breaker: BreakerSection::default(),
            rollback: RollbackSection::default(),
            worker: WorkerSection::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub observation_window_ms: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            observation_window_ms: 60_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RollbackSection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RollbackSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkerSection {
    pub scan_interval_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            scan_interval_ms: 30_000,
        }
    }
}

impl AppConfig {
    /// Load `config/{env}.yaml`.
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{env}.yaml");
        let content = fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("failed to read {config_path}: {e}"))?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Load `config/{env}.yaml`, falling back to defaults if missing.
    pub fn load_or_default(env: &str) -> Self {
        Self::load(env).unwrap_or_default()
    }
}

impl PaymentConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn transaction_deadline(&self) -> Duration {
        Duration::from_millis(self.transaction_deadline_ms)
    }

    pub fn gateway_deadline(&self) -> Duration {
        Duration::from_millis(self.gateway_deadline_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.payment.lock_ttl_ms, 10_000);
        assert_eq!(config.payment.breaker.failure_threshold, 5);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
log_level: debug
payment:
  lock_ttl_ms: 2000
  transaction_deadline_ms: 1000
  gateway_deadline_ms: 500
  routing_flag: gateway-routing-v2
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.payment.lock_ttl(), Duration::from_millis(2000));
        // Unspecified sections fall back
        assert_eq!(config.payment.breaker.cooldown_ms, 30_000);
        assert_eq!(config.rotation, "daily");
    }
}
