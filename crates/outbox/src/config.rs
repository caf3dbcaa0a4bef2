//! Outbox configuration loading and representation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::MAX_RETRIES;

/// Tunables for dispatch, retention and scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Retries allowed after the first failure before a record is dead-lettered
    pub max_retries: u32,
    /// Age after which processed records are collected
    pub retention_days: u32,
    /// How often the scheduler runs a dispatch cycle
    pub dispatch_interval_secs: u64,
    /// How often the scheduler runs a garbage collection cycle
    pub gc_interval_secs: u64,
    /// Worker threads used within one dispatch cycle
    pub dispatch_concurrency: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            retention_days: 7,
            dispatch_interval_secs: 60,
            gc_interval_secs: 3600,
            dispatch_concurrency: 1,
        }
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl OutboxConfig {
    pub const MAX_RETRIES_ENV: &'static str = "HERALD_MAX_RETRIES";
    pub const RETENTION_DAYS_ENV: &'static str = "HERALD_RETENTION_DAYS";
    pub const DISPATCH_INTERVAL_ENV: &'static str = "HERALD_DISPATCH_INTERVAL_SECS";
    pub const GC_INTERVAL_ENV: &'static str = "HERALD_GC_INTERVAL_SECS";
    pub const DISPATCH_CONCURRENCY_ENV: &'static str = "HERALD_DISPATCH_CONCURRENCY";

    /// Load from process environment, falling back to defaults for unset keys.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (environment, test map, ...).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            max_retries: parse(&lookup, Self::MAX_RETRIES_ENV, defaults.max_retries)?,
            retention_days: parse(&lookup, Self::RETENTION_DAYS_ENV, defaults.retention_days)?,
            dispatch_interval_secs: parse(
                &lookup,
                Self::DISPATCH_INTERVAL_ENV,
                defaults.dispatch_interval_secs,
            )?,
            gc_interval_secs: parse(&lookup, Self::GC_INTERVAL_ENV, defaults.gc_interval_secs)?,
            dispatch_concurrency: parse(
                &lookup,
                Self::DISPATCH_CONCURRENCY_ENV,
                defaults.dispatch_concurrency,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Every count and window must be at least 1; a zero retention would collect
    /// records the moment they are processed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let must_be_positive = [
            (Self::RETENTION_DAYS_ENV, u64::from(self.retention_days)),
            (Self::DISPATCH_INTERVAL_ENV, self.dispatch_interval_secs),
            (Self::GC_INTERVAL_ENV, self.gc_interval_secs),
            (Self::DISPATCH_CONCURRENCY_ENV, self.dispatch_concurrency as u64),
        ];
        match must_be_positive.into_iter().find(|(_, value)| *value == 0) {
            Some((key, _)) => Err(ConfigError::Invalid {
                key,
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}
