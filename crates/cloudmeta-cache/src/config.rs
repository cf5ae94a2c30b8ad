// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cache core configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Start-time configuration for a [`crate::core::CacheCore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Tick interval for the refresh pass.
    #[serde(with = "humantime_secs", default = "default_refresh_period")]
    pub refresh_period: Duration,

    /// No-access duration after which a holder is dropped regardless of TTL.
    #[serde(with = "humantime_secs", default = "default_evict_after_idle")]
    pub evict_after_idle: Duration,

    /// Lifetime of a successful lookup's holder.
    #[serde(with = "humantime_secs", default = "default_positive_ttl")]
    pub positive_ttl: Duration,

    /// Lifetime of a failed/absent lookup's holder.
    #[serde(with = "humantime_secs", default = "default_negative_ttl")]
    pub negative_ttl: Duration,

    /// Sustained rate-limiter throughput, in batches per second.
    #[serde(default = "default_rate_per_sec")]
    pub rate_per_sec: u32,

    /// Rate-limiter burst size, in batches.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_refresh_period() -> Duration {
    Duration::from_secs(30)
}

fn default_evict_after_idle() -> Duration {
    Duration::from_secs(50 * 60)
}

fn default_positive_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_negative_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_rate_per_sec() -> u32 {
    50
}

fn default_burst() -> u32 {
    10
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_period: default_refresh_period(),
            evict_after_idle: default_evict_after_idle(),
            positive_ttl: default_positive_ttl(),
            negative_ttl: default_negative_ttl(),
            rate_per_sec: default_rate_per_sec(),
            burst: default_burst(),
        }
    }
}

impl CacheConfig {
    /// Validate the configuration, rejecting anything that would make the
    /// event loop or dispatcher meaningless (zero/negative durations,
    /// zero-capacity limiter).
    ///
    /// This does not enforce the *recommended* relationships (e.g.
    /// `refresh_period \u{226a} positive_ttl`) - those are guidance, not
    /// invariants, and a caller may have reasons to violate them in tests.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_period.is_zero() {
            return Err(ConfigError::RefreshPeriodNotPositive);
        }
        if self.evict_after_idle.is_zero() {
            return Err(ConfigError::EvictAfterIdleNotPositive);
        }
        if self.positive_ttl.is_zero() {
            return Err(ConfigError::PositiveTtlNotPositive);
        }
        if self.negative_ttl.is_zero() {
            return Err(ConfigError::NegativeTtlNotPositive);
        }
        if self.burst == 0 {
            return Err(ConfigError::BurstNotPositive);
        }
        if self.rate_per_sec == 0 {
            return Err(ConfigError::RateNotPositive);
        }
        Ok(())
    }
}

/// (De)serialize a [`Duration`] as whole seconds, the way the rest of the
/// embedding's config surface is expected to express intervals.
mod humantime_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
