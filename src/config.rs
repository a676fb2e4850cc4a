// config.rs
use std::str::FromStr;

use sqlx::types::BigDecimal;
use thiserror::Error;

use crate::service::escrow_service::PayoutMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMode {
    Http,
    Stub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub store: StoreBackend,
    // Payment processor
    pub webhook_secret: String,
    pub gateway_base_url: String,
    pub gateway_secret_key: String,
    pub gateway_mode: GatewayMode,
    pub gateway_timeout_secs: u64,
    pub payout_mode: PayoutMode,
    // Milestones
    pub auto_approval_days: i64,
    pub max_revisions_per_milestone: i32,
    pub auto_release_on_approval: bool,
    // Webhooks
    pub webhook_max_retries: i32,
    pub webhook_processing_lease_secs: i64,
    // Disputes
    pub dispute_fee: BigDecimal,
    pub mediation_timeout_hours: i64,
    pub high_value_dispute_threshold: BigDecimal,
    pub advisory_url: Option<String>,
    pub advisory_timeout_ms: u64,
    // Housekeeping
    pub audit_retention_days: Option<i64>,
    pub sweep_interval_secs: u64,
    pub notification_webhook_url: Option<String>,
    pub notification_queue_capacity: usize,
}

fn optional(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::Missing(key))
}

fn parsed<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

fn parsed_opt<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match optional(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(None),
    }
}

impl Config {
    /// Reads the environment. Call `dotenv().ok()` first.
    pub fn init() -> Result<Config, ConfigError> {
        let store = match optional("STORE").as_deref() {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "STORE",
                    value: other.to_string(),
                })
            }
        };
        // The in-memory store runs without a database.
        let database_url = match store {
            StoreBackend::Postgres => required("DATABASE_URL")?,
            StoreBackend::Memory => optional("DATABASE_URL").unwrap_or_default(),
        };
        let webhook_secret = required("WEBHOOK_SECRET")?;

        let gateway_mode = match optional("GATEWAY_MODE").as_deref() {
            None | Some("http") => GatewayMode::Http,
            Some("stub") => GatewayMode::Stub,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "GATEWAY_MODE",
                    value: other.to_string(),
                })
            }
        };

        Ok(Config {
            database_url,
            port: parsed("PORT", 8000)?,
            store,
            webhook_secret,
            gateway_base_url: optional("GATEWAY_BASE_URL").unwrap_or_else(|| "https://api.paystack.co".to_string()),
            gateway_secret_key: optional("GATEWAY_SECRET_KEY").unwrap_or_else(|| "test_secret_key".to_string()),
            gateway_mode,
            gateway_timeout_secs: parsed("GATEWAY_TIMEOUT_SECS", 10)?,
            payout_mode: parsed("PAYOUT_MODE", PayoutMode::Transfer)?,
            auto_approval_days: parsed("AUTO_APPROVAL_DAYS", 7)?,
            max_revisions_per_milestone: parsed("MAX_REVISIONS_PER_MILESTONE", 3)?,
            auto_release_on_approval: parsed("AUTO_RELEASE_ON_APPROVAL", true)?,
            webhook_max_retries: parsed("WEBHOOK_MAX_RETRIES", 5)?,
            webhook_processing_lease_secs: parsed("WEBHOOK_PROCESSING_LEASE_SECS", 300)?,
            dispute_fee: parsed("DISPUTE_FEE", BigDecimal::from(0))?,
            mediation_timeout_hours: parsed("MEDIATION_TIMEOUT_HOURS", 72)?,
            high_value_dispute_threshold: parsed("HIGH_VALUE_DISPUTE_THRESHOLD", BigDecimal::from(100000))?,
            advisory_url: optional("ADVISORY_URL"),
            advisory_timeout_ms: parsed("ADVISORY_TIMEOUT_MS", 1500)?,
            audit_retention_days: parsed_opt("AUDIT_RETENTION_DAYS")?,
            sweep_interval_secs: parsed("SWEEP_INTERVAL_SECS", 300)?,
            notification_webhook_url: optional("NOTIFICATION_WEBHOOK_URL"),
            notification_queue_capacity: parsed("NOTIFICATION_QUEUE_CAPACITY", 1024)?,
        })
    }

    /// Defaults used by tests and local runs on the in-memory store.
    pub fn for_memory(webhook_secret: &str) -> Config {
        Config {
            database_url: String::new(),
            port: 8000,
            store: StoreBackend::Memory,
            webhook_secret: webhook_secret.to_string(),
            gateway_base_url: String::new(),
            gateway_secret_key: String::new(),
            gateway_mode: GatewayMode::Stub,
            gateway_timeout_secs: 10,
            payout_mode: PayoutMode::Transfer,
            auto_approval_days: 7,
            max_revisions_per_milestone: 3,
            auto_release_on_approval: true,
            webhook_max_retries: 5,
            webhook_processing_lease_secs: 300,
            dispute_fee: BigDecimal::from(0),
            mediation_timeout_hours: 72,
            high_value_dispute_threshold: BigDecimal::from(100000),
            advisory_url: None,
            advisory_timeout_ms: 1500,
            audit_retention_days: None,
            sweep_interval_secs: 300,
            notification_webhook_url: None,
            notification_queue_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsed_falls_back_and_rejects_garbage() {
        std::env::remove_var("ESCROWLINE_TEST_UNSET");
        assert_eq!(parsed("ESCROWLINE_TEST_UNSET", 42u16).unwrap(), 42);

        std::env::set_var("ESCROWLINE_TEST_PORT", " 9090 ");
        assert_eq!(parsed("ESCROWLINE_TEST_PORT", 8000u16).unwrap(), 9090);

        std::env::set_var("ESCROWLINE_TEST_BAD", "ninety");
        let err = parsed("ESCROWLINE_TEST_BAD", 8000u16).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ESCROWLINE_TEST_BAD", .. }));
    }

    #[test]
    fn blank_values_count_as_missing() {
        std::env::set_var("ESCROWLINE_TEST_BLANK", "   ");
        assert!(matches!(
            required("ESCROWLINE_TEST_BLANK"),
            Err(ConfigError::Missing("ESCROWLINE_TEST_BLANK"))
        ));
        assert_eq!(parsed_opt::<i64>("ESCROWLINE_TEST_BLANK").unwrap(), None);
    }

    #[test]
    fn memory_defaults_use_the_stub_gateway() {
        let config = Config::for_memory("whsec");
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.gateway_mode, GatewayMode::Stub);
        assert_eq!(config.webhook_max_retries, 5);
        assert!(config.audit_retention_days.is_none());
    }
}
