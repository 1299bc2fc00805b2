use crate::error::{HookError, Result};
use crate::validation::MAX_TIMEOUT_SECS;
use serde::{Deserialize, Serialize};
use std::path::Path;

const CONFIG_FILE: &str = "hooks.toml";
const ENV_PREFIX: &str = "NEXUS_HOOKS";

/// Cap on a single backoff delay so `base^attempts` cannot overflow the
/// timestamp arithmetic. Roughly ten years.
const MAX_BACKOFF_SECS: u64 = 10 * 365 * 24 * 60 * 60;

const RETENTION_DAYS_RANGE: std::ops::RangeInclusive<i64> = 1..=3650;
const BREAKER_WINDOW_HOURS_RANGE: std::ops::RangeInclusive<i64> = 1..=720;
/// A claim must outlive the slowest possible attempt, with room for the
/// bookkeeping around it.
const CLAIM_LEASE_SECS_RANGE: std::ops::RangeInclusive<i64> =
    (2 * MAX_TIMEOUT_SECS as i64)..=(24 * 60 * 60);

/// Delivery policy knobs shared by the dispatcher, sweeper and breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: usize,
    pub backoff_base: u32,
    pub backoff_unit_secs: u64,
    pub retention_days: i64,
    pub breaker_threshold: usize,
    pub breaker_window_hours: i64,
    pub response_body_limit: usize,
    /// A sweep claim older than this is considered abandoned and the log
    /// becomes eligible again. Must exceed the largest hook timeout.
    pub claim_lease_secs: i64,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            sweep_batch_size: 10,
            backoff_base: 2,
            backoff_unit_secs: 60,
            retention_days: 30,
            breaker_threshold: 10,
            breaker_window_hours: 24,
            response_body_limit: 1000,
            claim_lease_secs: 300,
            user_agent: concat!("nexus-hook-dispatcher/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl EngineConfig {
    /// Layer defaults, `<data_dir>/hooks.toml`, `NEXUS_HOOKS__*` environment
    /// variables and finally the host-supplied overrides.
    pub fn load(data_dir: Option<&Path>, overrides: Option<&serde_json::Value>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(dir) = data_dir {
            builder = builder.add_source(config::File::from(dir.join(CONFIG_FILE)).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        if let Some(overrides) = overrides.filter(|v| v.is_object()) {
            let json = serde_json::to_string(overrides)?;
            builder = builder.add_source(config::File::from_str(&json, config::FileFormat::Json));
        }

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backoff_base < 2 {
            return Err(HookError::Validation(
                "backoff_base must be at least 2".to_string(),
            ));
        }
        if self.backoff_unit_secs == 0 {
            return Err(HookError::Validation(
                "backoff_unit_secs must be positive".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 || self.sweep_batch_size == 0 {
            return Err(HookError::Validation(
                "sweep interval and batch size must be positive".to_string(),
            ));
        }
        if self.breaker_threshold == 0 {
            return Err(HookError::Validation(
                "breaker_threshold must be positive".to_string(),
            ));
        }
        check_range("retention_days", self.retention_days, &RETENTION_DAYS_RANGE)?;
        check_range(
            "breaker_window_hours",
            self.breaker_window_hours,
            &BREAKER_WINDOW_HOURS_RANGE,
        )?;
        check_range(
            "claim_lease_secs",
            self.claim_lease_secs,
            &CLAIM_LEASE_SECS_RANGE,
        )?;
        Ok(())
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    /// Delay before the next retry of a log that has made `attempts` attempts.
    pub fn backoff_delay(&self, attempts: u32) -> chrono::Duration {
        let factor = u64::from(self.backoff_base)
            .checked_pow(attempts)
            .unwrap_or(u64::MAX);
        let secs = factor
            .saturating_mul(self.backoff_unit_secs)
            .min(MAX_BACKOFF_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }

    pub fn breaker_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.breaker_window_hours)
    }

    pub fn claim_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_lease_secs)
    }
}

fn check_range(field: &str, value: i64, range: &std::ops::RangeInclusive<i64>) -> Result<()> {
    if range.contains(&value) {
        return Ok(());
    }
    Err(HookError::Validation(format!(
        "{field} must be between {} and {}, got {value}",
        range.start(),
        range.end()
    )))
}
