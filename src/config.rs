//! Engine and CLI configuration.

use crate::error::{PaymentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Ten years.
pub const MAX_MATURATION_WINDOW_HOURS: i64 = 24 * 365 * 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// ISO currency code stamped on every balance and ledger row.
    pub currency: String,

    /// Decimal places between major and minor units (2 for INR paise).
    pub minor_unit_exponent: u32,

    /// Delay between capture and mentor earnings becoming withdrawable.
    pub maturation_window_hours: i64,

    /// Cadence of the background earnings sweeper.
    pub sweep_interval_secs: u64,

    /// RocksDB directory; in-memory storage when unset.
    pub db_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            currency: "INR".to_string(),
            minor_unit_exponent: 2,
            maturation_window_hours: 24,
            sweep_interval_secs: 3600,
            db_path: None,
        }
    }
}

impl Config {
    /// Loads a TOML file; missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&raw).map_err(|e| PaymentError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.currency.trim().is_empty() {
            return Err(PaymentError::ConfigError("currency must be set".into()));
        }
        if self.minor_unit_exponent > 8 {
            return Err(PaymentError::ConfigError(format!(
                "minor_unit_exponent {} is out of range",
                self.minor_unit_exponent
            )));
        }
        if !(0..=MAX_MATURATION_WINDOW_HOURS).contains(&self.maturation_window_hours) {
            return Err(PaymentError::ConfigError(format!(
                "maturation_window_hours must be between 0 and {}",
                MAX_MATURATION_WINDOW_HOURS
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(PaymentError::ConfigError(
                "sweep_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Saturates instead of panicking for windows `validate` would reject.
    pub fn maturation_window(&self) -> chrono::Duration {
        chrono::Duration::try_hours(self.maturation_window_hours.max(0))
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }
}
