//! Configuration module for lease-billing-service.
//!
//! Loaded from an optional `configuration` file and `LEASE_BILLING__*`
//! environment variables, e.g. `LEASE_BILLING__DATABASE__URL` or
//! `LEASE_BILLING__RUN__PERIOD=2024-03`.

use crate::billing::{OverpaymentPolicy, DEFAULT_INVOICE_PREFIX, DEFAULT_MAX_PARALLEL_LEASES};
use crate::models::{InvoiceRunKind, ProrationMethod};
use chrono::{Months, NaiveDate};
use secrecy::Secret;
use serde::Deserialize;
use service_core::config::{self as core_config, load_config};
use service_core::error::AppError;
use service_core::retry::RetryConfig;
use std::time::Duration;
use uuid::Uuid;

pub const ENV_PREFIX: &str = "LEASE_BILLING";

#[derive(Debug, Clone, Deserialize)]
pub struct LeaseBillingConfig {
    #[serde(default)]
    pub common: core_config::Config,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    pub run: RunRequest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_run_migrations() -> bool {
    true
}

/// Engine behaviour shared by every operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_parallel_leases: usize,
    pub overpayment_policy: OverpaymentPolicy,
    pub default_invoice_prefix: String,
    pub retry: RetrySettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_leases: DEFAULT_MAX_PARALLEL_LEASES,
            overpayment_policy: OverpaymentPolicy::default(),
            default_invoice_prefix: DEFAULT_INVOICE_PREFIX.to_string(),
            retry: RetrySettings::default(),
        }
    }
}

/// Backoff for concurrency conflicts during invoice runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            ..RetryConfig::default()
        }
    }
}

/// The batch the binary executes.
#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub kind: InvoiceRunKind,
    pub org_id: Uuid,
    /// Billing month as `YYYY-MM`.
    pub period: String,
    #[serde(default)]
    pub proration_method: Option<ProrationMethod>,
}

impl RunRequest {
    /// First and last day of the billing month.
    pub fn period_bounds(&self) -> Result<(NaiveDate, NaiveDate), AppError> {
        let start = NaiveDate::parse_from_str(&format!("{}-01", self.period.trim()), "%Y-%m-%d")
            .map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!(
                    "run.period must be YYYY-MM, got {:?}: {}",
                    self.period,
                    e
                ))
            })?;
        let end = start
            .checked_add_months(Months::new(1))
            .and_then(|next| next.pred_opt())
            .ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!("run.period {} is out of range", self.period))
            })?;
        Ok((start, end))
    }
}

impl LeaseBillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let config: Self = load_config(ENV_PREFIX)?;
        if config.engine.max_parallel_leases == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "engine.max_parallel_leases must be at least 1"
            )));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(period: &str) -> RunRequest {
        RunRequest {
            kind: InvoiceRunKind::MonthlyRent,
            org_id: Uuid::nil(),
            period: period.to_string(),
            proration_method: None,
        }
    }

    #[test]
    fn test_period_bounds_cover_the_month() {
        let (start, end) = request("2024-02").period_bounds().unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());

        let (_, december_end) = request("2023-12").period_bounds().unwrap();
        assert_eq!(december_end, NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());
    }

    #[test]
    fn test_malformed_period_is_a_config_error() {
        let err = request("March").period_bounds().unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn test_engine_defaults() {
        let engine = EngineConfig::default();
        assert_eq!(engine.max_parallel_leases, 4);
        assert_eq!(engine.default_invoice_prefix, "INV");
        assert_eq!(engine.overpayment_policy, OverpaymentPolicy::AcceptAndFlag);
        assert_eq!(engine.retry.to_retry_config().max_retries, 3);
    }
}
