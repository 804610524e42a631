//! ============================================================================
//! Gate Configuration - Environment-driven settings
//! ============================================================================
//! Variables (a `.env` file is honored by the binaries via dotenvy):
//! - PAYGATE_DB_PATH            meter database file
//! - PAYGATE_BIND               HTTP listen address
//! - PAYGATE_DAILY_CAP          free reads per identity per day
//! - PAYGATE_UTC_OFFSET_MINUTES reference timezone for day buckets
//! - PAYGATE_STORE_TIMEOUT_MS   metering store timeout
//! - PAYGATE_DIRECTORY_PATH     JSON accounts/content directory
//! ============================================================================

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::access::DEFAULT_STORE_TIMEOUT_MS;
use crate::identity::DayBucket;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
pub const DEFAULT_DAILY_CAP: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    /// None means PAYGATE_DB_PATH or ~/.paygate/meter.redb
    pub db_path: Option<PathBuf>,
    pub bind_addr: String,
    pub daily_cap: u32,
    /// Minutes east of UTC
    pub utc_offset_minutes: i32,
    pub store_timeout_ms: u64,
    pub directory_path: Option<PathBuf>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            daily_cap: DEFAULT_DAILY_CAP,
            utc_offset_minutes: 0,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            directory_path: None,
        }
    }
}

impl GateConfig {
    /// Defaults overridden by PAYGATE_* environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            db_path: lookup("PAYGATE_DB_PATH").map(PathBuf::from),
            bind_addr: lookup("PAYGATE_BIND").unwrap_or(defaults.bind_addr),
            daily_cap: parse_var(&lookup, "PAYGATE_DAILY_CAP")?.unwrap_or(defaults.daily_cap),
            utc_offset_minutes: parse_var(&lookup, "PAYGATE_UTC_OFFSET_MINUTES")?
                .unwrap_or(defaults.utc_offset_minutes),
            store_timeout_ms: parse_var(&lookup, "PAYGATE_STORE_TIMEOUT_MS")?
                .unwrap_or(defaults.store_timeout_ms),
            directory_path: lookup("PAYGATE_DIRECTORY_PATH").map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.day_bucket()?;
        if self.store_timeout_ms == 0 {
            return Err(anyhow!("PAYGATE_STORE_TIMEOUT_MS must be greater than 0"));
        }
        Ok(())
    }

    pub fn day_bucket(&self) -> Result<DayBucket> {
        DayBucket::from_offset_minutes(self.utc_offset_minutes).ok_or_else(|| {
            anyhow!(
                "Invalid UTC offset {} minutes (must be within +/- 24h)",
                self.utc_offset_minutes
            )
        })
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("Invalid {}='{}': {}", name, raw, e)),
        None => Ok(None),
    }
}
