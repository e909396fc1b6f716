//! Aggregator configuration
//!
//! Configuration is plain serde JSON with defaults for every field, plus an
//! environment overlay for the handful of knobs operators tune.

use crate::classify::ClassificationRules;
use crate::error::AggregateError;
use chrono::{Duration, FixedOffset};
use serde::{Deserialize, Serialize};

/// Default tolerance for readings arriving slightly behind the latest one
pub const DEFAULT_CLOCK_SKEW_MS: i64 = 2_000;

/// Upper bound on the clock skew tolerance (one day)
pub const MAX_CLOCK_SKEW_MS: i64 = 86_400_000;

/// Default cap on retained sensor readings
pub const DEFAULT_MAX_SENSOR_READINGS: usize = 50_000;

/// Default bound when waiting on the archive worker
pub const DEFAULT_HANDOFF_TIMEOUT_MS: u64 = 5_000;

/// Aggregator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// How far behind the latest accepted reading a new one may be (ms)
    pub clock_skew_tolerance_ms: i64,
    /// Offset from UTC used to derive calendar dates (minutes)
    pub utc_offset_minutes: i32,
    /// Maximum number of sensor readings retained in memory
    pub max_sensor_readings: usize,
    /// Bound used by flush and shutdown when waiting on persistence (ms)
    pub handoff_timeout_ms: u64,
    /// Sensor type mapping
    pub rules: ClassificationRules,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            clock_skew_tolerance_ms: DEFAULT_CLOCK_SKEW_MS,
            utc_offset_minutes: 0,
            max_sensor_readings: DEFAULT_MAX_SENSOR_READINGS,
            handoff_timeout_ms: DEFAULT_HANDOFF_TIMEOUT_MS,
            rules: ClassificationRules::default(),
        }
    }
}

impl AggregatorConfig {
    /// Load configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, AggregateError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> Result<String, AggregateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Overlay `DAILY_*` environment variables on the defaults
    pub fn from_env() -> Result<Self, AggregateError> {
        Self::default().with_env(|k| std::env::var(k).ok())
    }

    /// Overlay values read through `get` onto this configuration.
    ///
    /// Tests pass a closure instead of touching the process environment.
    pub fn with_env<F>(mut self, mut get: F) -> Result<Self, AggregateError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(v) = get("DAILY_CLOCK_SKEW_MS") {
            self.clock_skew_tolerance_ms = parse_var("DAILY_CLOCK_SKEW_MS", &v)?;
        }
        if let Some(v) = get("DAILY_UTC_OFFSET_MINUTES") {
            self.utc_offset_minutes = parse_var("DAILY_UTC_OFFSET_MINUTES", &v)?;
        }
        if let Some(v) = get("DAILY_MAX_SENSOR_READINGS") {
            self.max_sensor_readings = parse_var("DAILY_MAX_SENSOR_READINGS", &v)?;
        }
        if let Some(v) = get("DAILY_HANDOFF_TIMEOUT_MS") {
            self.handoff_timeout_ms = parse_var("DAILY_HANDOFF_TIMEOUT_MS", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), AggregateError> {
        if !(0..=MAX_CLOCK_SKEW_MS).contains(&self.clock_skew_tolerance_ms) {
            return Err(AggregateError::Config(format!(
                "clock_skew_tolerance_ms must be between 0 and {MAX_CLOCK_SKEW_MS}, got {}",
                self.clock_skew_tolerance_ms
            )));
        }
        if self.max_sensor_readings == 0 {
            return Err(AggregateError::Config(
                "max_sensor_readings must be at least 1".to_string(),
            ));
        }
        self.offset()?;
        self.rules.validate()
    }

    /// Fixed offset used to map timestamps to calendar dates
    pub fn offset(&self) -> Result<FixedOffset, AggregateError> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                AggregateError::Config(format!(
                    "utc_offset_minutes {} is out of range",
                    self.utc_offset_minutes
                ))
            })
    }

    pub fn clock_skew_tolerance(&self) -> Duration {
        Duration::milliseconds(self.clock_skew_tolerance_ms)
    }

    pub fn handoff_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.handoff_timeout_ms)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, AggregateError> {
    value
        .trim()
        .parse()
        .map_err(|_| AggregateError::Config(format!("{key} has invalid value {value:?}")))
}
