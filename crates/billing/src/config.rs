//! Billing configuration loaded from the environment

use std::str::FromStr;
use std::time::Duration;

use time::UtcOffset;

use crate::error::{BillingError, BillingResult};
use crate::gateway::GatewayPolicy;
use crate::plan::PlanCatalog;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub gateway_base_url: String,
    pub gateway_secret_key: String,
    pub gateway_policy: GatewayPolicy,
    pub catalog: PlanCatalog,
    /// Six-field cron expression (seconds first) for the daily run
    pub billing_cron: String,
    /// Offset of the billing calendar zone from UTC, in whole hours
    pub utc_offset_hours: i8,
    /// Subscriptions charged in parallel within one run
    pub scheduler_concurrency: usize,
    /// Postgres pool size. Every in-flight charge holds one connection for
    /// its subscription lock, so this must exceed `scheduler_concurrency`.
    pub db_max_connections: u32,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment
    pub fn from_lookup<F>(lookup: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| BillingError::Config(format!("{} must be set", key)))
        };

        let defaults = PlanCatalog::default();
        let config = Self {
            gateway_base_url: required("GATEWAY_BASE_URL")?,
            gateway_secret_key: required("GATEWAY_SECRET_KEY")?,
            gateway_policy: GatewayPolicy {
                timeout: Duration::from_secs(parse_or(&lookup, "GATEWAY_TIMEOUT_SECS", 10)?),
                retry_delay: Duration::from_millis(parse_or(&lookup, "GATEWAY_RETRY_DELAY_MS", 500)?),
            },
            catalog: PlanCatalog {
                premium_price: parse_or(&lookup, "PREMIUM_PRICE", defaults.premium_price)?,
                premium_charge_limit: parse_or(
                    &lookup,
                    "PREMIUM_CHARGE_LIMIT",
                    defaults.premium_charge_limit,
                )?,
                base_charge_limit: parse_or(&lookup, "BASE_CHARGE_LIMIT", defaults.base_charge_limit)?,
            },
            billing_cron: lookup("BILLING_CRON").unwrap_or_else(|| "0 0 9 * * *".to_string()),
            utc_offset_hours: parse_or(&lookup, "BILLING_UTC_OFFSET_HOURS", 9)?,
            scheduler_concurrency: parse_or(&lookup, "SCHEDULER_CONCURRENCY", 4)?,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 10)?,
        };

        if config.catalog.premium_price <= 0 {
            return Err(BillingError::Config("PREMIUM_PRICE must be positive".into()));
        }
        config.utc_offset()?;
        if (config.db_max_connections as usize) <= config.scheduler_concurrency.max(1) {
            return Err(BillingError::Config(format!(
                "DB_MAX_CONNECTIONS ({}) must exceed SCHEDULER_CONCURRENCY ({})",
                config.db_max_connections, config.scheduler_concurrency
            )));
        }

        Ok(config)
    }

    pub fn utc_offset(&self) -> BillingResult<UtcOffset> {
        UtcOffset::from_hms(self.utc_offset_hours, 0, 0).map_err(|e| {
            BillingError::Config(format!(
                "BILLING_UTC_OFFSET_HOURS {} out of range: {}",
                self.utc_offset_hours, e
            ))
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> BillingResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| BillingError::Config(format!("{} is invalid: {}", key, e))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_applied() {
        let config = BillingConfig::from_lookup(lookup(&[
            ("GATEWAY_BASE_URL", "https://gateway.test"),
            ("GATEWAY_SECRET_KEY", "sk"),
        ]))
        .unwrap();

        assert_eq!(config.gateway_policy, GatewayPolicy::default());
        assert_eq!(config.catalog, PlanCatalog::default());
        assert_eq!(config.billing_cron, "0 0 9 * * *");
        assert_eq!(config.utc_offset().unwrap(), UtcOffset::from_hms(9, 0, 0).unwrap());
        assert_eq!(config.scheduler_concurrency, 4);
        assert_eq!(config.db_max_connections, 10);
    }

    #[test]
    fn test_pool_must_outnumber_concurrent_charges() {
        let err = BillingConfig::from_lookup(lookup(&[
            ("GATEWAY_BASE_URL", "https://gateway.test"),
            ("GATEWAY_SECRET_KEY", "sk"),
            ("SCHEDULER_CONCURRENCY", "5"),
            ("DB_MAX_CONNECTIONS", "5"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BillingError::Config(msg) if msg.contains("DB_MAX_CONNECTIONS")));

        let config = BillingConfig::from_lookup(lookup(&[
            ("GATEWAY_BASE_URL", "https://gateway.test"),
            ("GATEWAY_SECRET_KEY", "sk"),
            ("SCHEDULER_CONCURRENCY", "5"),
            ("DB_MAX_CONNECTIONS", "6"),
        ]))
        .unwrap();
        assert_eq!(config.db_max_connections, 6);
    }

    #[test]
    fn test_missing_secret_is_config_error() {
        let err = BillingConfig::from_lookup(lookup(&[("GATEWAY_BASE_URL", "https://gateway.test")]))
            .unwrap_err();
        assert!(matches!(err, BillingError::Config(msg) if msg.contains("GATEWAY_SECRET_KEY")));
    }

    #[test]
    fn test_garbage_number_rejected() {
        let err = BillingConfig::from_lookup(lookup(&[
            ("GATEWAY_BASE_URL", "https://gateway.test"),
            ("GATEWAY_SECRET_KEY", "sk"),
            ("PREMIUM_PRICE", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BillingError::Config(_)));
    }

    #[test]
    fn test_offset_out_of_range() {
        let err = BillingConfig::from_lookup(lookup(&[
            ("GATEWAY_BASE_URL", "https://gateway.test"),
            ("GATEWAY_SECRET_KEY", "sk"),
            ("BILLING_UTC_OFFSET_HOURS", "30"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BillingError::Config(_)));
    }
}
