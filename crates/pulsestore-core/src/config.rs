//! Configuration management for PulseStore
//!
//! Provides deployment presets, environment loading and the startup
//! validation that turns a bad configuration into a fatal error.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::ConfigError;
use crate::types::CounterSnapshot;

/// Linear weights of the trending score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatWeights {
    pub views: f64,
    pub likes: f64,
    pub comments: f64,
}

impl HeatWeights {
    pub fn score(&self, counters: &CounterSnapshot) -> f64 {
        counters.views as f64 * self.views
            + counters.likes as f64 * self.likes
            + counters.comments as f64 * self.comments
    }
}

impl Default for HeatWeights {
    fn default() -> Self {
        Self { views: 0.1, likes: 2.0, comments: 5.0 }
    }
}

/// Exponential backoff for compensating writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `n` (1-based; attempt 1 runs immediately).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
        }
    }
}

/// PulseStore configuration
#[derive(Debug, Clone)]
pub struct PulseConfig {
    /// Cadence of the reconciliation job
    pub flush_interval: Duration,
    /// Cadence of the leaderboard maintainer
    pub leaderboard_refresh_interval: Duration,
    /// Cadence of the relation sweep
    pub sweep_interval: Duration,
    /// SCAN page size hint
    pub scan_batch: usize,
    /// Entries kept in the ranked structure
    pub leaderboard_size: usize,
    /// TTL of the ranked structure after each refresh
    pub leaderboard_ttl: Duration,
    /// Candidate subjects considered per refresh
    pub candidate_limit: usize,
    pub weights: HeatWeights,
    /// Per-call timeout handed to store adapters
    pub store_timeout: Duration,
    pub compensation: RetryPolicy,
    /// Where failed compensations are recorded; `None` keeps them in logs only
    pub repair_journal: Option<PathBuf>,
    /// Durable edges read per sweep page
    pub sweep_page_size: usize,
}

impl PulseConfig {
    /// Production cadences: flush every 5 minutes, leaderboard every 10.
    pub fn production() -> Self {
        Self {
            flush_interval: Duration::from_secs(300),
            leaderboard_refresh_interval: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(3600),
            scan_batch: 100,
            leaderboard_size: 100,
            leaderboard_ttl: Duration::from_secs(3600),
            candidate_limit: 1000,
            weights: HeatWeights::default(),
            store_timeout: Duration::from_millis(500),
            compensation: RetryPolicy::default(),
            repair_journal: None,
            sweep_page_size: 500,
        }
    }

    /// Short cadences for local runs and tests.
    pub fn development() -> Self {
        Self {
            flush_interval: Duration::from_secs(5),
            leaderboard_refresh_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(30),
            scan_batch: 50,
            leaderboard_size: 20,
            leaderboard_ttl: Duration::from_secs(120),
            candidate_limit: 200,
            weights: HeatWeights::default(),
            store_timeout: Duration::from_millis(200),
            compensation: RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(50),
            },
            repair_journal: None,
            sweep_page_size: 100,
        }
    }

    /// Start from the production preset and override from `PULSE_*`
    /// environment variables. Durations are given in milliseconds.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base = Self::production();
        let config = Self {
            flush_interval: millis("PULSE_FLUSH_INTERVAL_MS", base.flush_interval)?,
            leaderboard_refresh_interval: millis("PULSE_LEADERBOARD_REFRESH_MS", base.leaderboard_refresh_interval)?,
            sweep_interval: millis("PULSE_SWEEP_INTERVAL_MS", base.sweep_interval)?,
            scan_batch: try_load("PULSE_SCAN_BATCH", base.scan_batch)?,
            leaderboard_size: try_load("PULSE_LEADERBOARD_SIZE", base.leaderboard_size)?,
            leaderboard_ttl: millis("PULSE_LEADERBOARD_TTL_MS", base.leaderboard_ttl)?,
            candidate_limit: try_load("PULSE_CANDIDATE_LIMIT", base.candidate_limit)?,
            weights: HeatWeights {
                views: try_load("PULSE_WEIGHT_VIEWS", base.weights.views)?,
                likes: try_load("PULSE_WEIGHT_LIKES", base.weights.likes)?,
                comments: try_load("PULSE_WEIGHT_COMMENTS", base.weights.comments)?,
            },
            store_timeout: millis("PULSE_STORE_TIMEOUT_MS", base.store_timeout)?,
            compensation: RetryPolicy {
                attempts: try_load("PULSE_COMPENSATION_ATTEMPTS", base.compensation.attempts)?,
                base_delay: millis("PULSE_COMPENSATION_BASE_MS", base.compensation.base_delay)?,
                max_delay: millis("PULSE_COMPENSATION_MAX_MS", base.compensation.max_delay)?,
            },
            repair_journal: env::var("PULSE_REPAIR_JOURNAL").ok().map(PathBuf::from),
            sweep_page_size: try_load("PULSE_SWEEP_PAGE_SIZE", base.sweep_page_size)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("flush_interval", self.flush_interval),
            ("leaderboard_refresh_interval", self.leaderboard_refresh_interval),
            ("sweep_interval", self.sweep_interval),
            ("leaderboard_ttl", self.leaderboard_ttl),
            ("store_timeout", self.store_timeout),
        ];
        for (field, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::new(field, "must be > 0"));
            }
        }
        if self.leaderboard_ttl < self.leaderboard_refresh_interval {
            return Err(ConfigError::new(
                "leaderboard_ttl",
                "must be >= leaderboard_refresh_interval or the structure expires between refreshes",
            ));
        }
        let sizes = [
            ("scan_batch", self.scan_batch),
            ("leaderboard_size", self.leaderboard_size),
            ("candidate_limit", self.candidate_limit),
            ("sweep_page_size", self.sweep_page_size),
        ];
        for (field, value) in sizes {
            if value == 0 {
                return Err(ConfigError::new(field, "must be > 0"));
            }
        }
        let w = self.weights;
        for (field, value) in [("weights.views", w.views), ("weights.likes", w.likes), ("weights.comments", w.comments)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::new(field, "must be a finite, non-negative number"));
            }
        }
        if w.views == 0.0 && w.likes == 0.0 && w.comments == 0.0 {
            return Err(ConfigError::new("weights", "at least one weight must be > 0"));
        }
        if self.compensation.attempts == 0 {
            return Err(ConfigError::new("compensation.attempts", "must be >= 1"));
        }
        if self.compensation.base_delay > self.compensation.max_delay {
            return Err(ConfigError::new("compensation.base_delay", "must be <= compensation.max_delay"));
        }
        Ok(())
    }
}

impl Default for PulseConfig {
    fn default() -> Self { Self::production() }
}

fn try_load<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| {
            warn!("Invalid {key} value: {e}");
            ConfigError::new(key, format!("could not parse '{raw}': {e}"))
        }),
        Err(_) => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

fn millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let ms: u64 = try_load(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}
