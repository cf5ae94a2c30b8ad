// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate error taxonomy.
//!
//! Per-item lookup/forward outcomes are data, not control-flow errors -
//! they live in [`crate::types::LookupOutcome`] and
//! [`crate::types::ForwardResult`] and are absorbed internally rather
//! than surfaced as a `Result::Err` to the caller. The errors here are
//! the ones that can stop the crate from starting up at all.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("refresh_period must be positive")]
    RefreshPeriodNotPositive,
    #[error("evict_after_idle must be positive")]
    EvictAfterIdleNotPositive,
    #[error("positive_ttl must be positive")]
    PositiveTtlNotPositive,
    #[error("negative_ttl must be positive")]
    NegativeTtlNotPositive,
    #[error("burst must be at least 1")]
    BurstNotPositive,
    #[error("rate_per_sec must be at least 1")]
    RateNotPositive,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("event loop is not running")]
    LoopShutDown,
}
