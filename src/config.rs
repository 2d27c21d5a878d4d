//! Ledger configuration.
//!
//! Defaults are compiled in and can be overridden with `SEAT_LEDGER_*` environment
//! variables, e.g. `SEAT_LEDGER_HOLD_TTL_SECS=60`.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Upper bound on seats a single hold may claim.
pub const MAX_SEATS_PER_HOLD: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("max_seats_per_hold must be between 1 and {MAX_SEATS_PER_HOLD}, got {0}")]
    SeatLimit(usize),
    #[error("sweep_interval_ms must be positive")]
    SweepInterval,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LedgerConfig {
    /// Lifetime of an unconfirmed hold.
    pub hold_ttl_secs: u64,
    pub max_seats_per_hold: usize,
    /// Period of the expiry sweeper.
    pub sweep_interval_ms: u64,
    /// How long an expired token is remembered so confirming it reports expiry.
    pub expired_retention_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            hold_ttl_secs: 900,
            max_seats_per_hold: MAX_SEATS_PER_HOLD,
            sweep_interval_ms: 2_000,
            expired_retention_secs: 3_600,
        }
    }
}

impl LedgerConfig {
    /// Load defaults overlaid with `SEAT_LEDGER_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(config::Environment::with_prefix("SEAT_LEDGER"))
    }

    fn load_from(env: config::Environment) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let loaded: Self = config::Config::builder()
            .set_default("hold_ttl_secs", defaults.hold_ttl_secs)?
            .set_default("max_seats_per_hold", defaults.max_seats_per_hold as u64)?
            .set_default("sweep_interval_ms", defaults.sweep_interval_ms)?
            .set_default("expired_retention_secs", defaults.expired_retention_secs)?
            .add_source(env.try_parsing(true))
            .build()?
            .try_deserialize()?;
        loaded.validate()
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        if !(1..=MAX_SEATS_PER_HOLD).contains(&self.max_seats_per_hold) {
            return Err(ConfigError::SeatLimit(self.max_seats_per_hold));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::SweepInterval);
        }
        Ok(self)
    }

    pub fn hold_ttl(&self) -> Duration {
        Duration::from_secs(self.hold_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn expired_retention(&self) -> Duration {
        Duration::from_secs(self.expired_retention_secs)
    }
}
