// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Demo CLI: wires a mock cloud lookup and a stdout forwarder around
//! [`cloudmeta_cache::CacheCore`] so the enrichment path can be
//! exercised from a terminal. Not part of the crate's public contract.
//!
//! ```bash
//! cloudmeta-demo --addresses 10.0.0.1,10.0.0.1,10.0.0.2 --rate-per-sec 5
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use cloudmeta_cache::{
    Address, CacheConfig, CacheCore, Cancelled, CloudLookup, Event, ForwardResult, Forwarder,
    InstanceRecord, LookupOutcome, Metric, RateLimiter, TokenBucketLimiter,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "cloudmeta-demo")]
#[command(author = "naskel.com")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Exercise the cloud-metadata enrichment cache against a mock provider")]
struct Cli {
    /// Comma-separated source addresses to submit as metrics, in order.
    #[arg(long, value_delimiter = ',', default_value = "10.0.0.1,10.0.0.1,10.0.0.2")]
    addresses: Vec<String>,

    /// Rate limiter sustained throughput, in batches per second.
    #[arg(long, default_value_t = 10)]
    rate_per_sec: u32,

    /// Rate limiter burst size, in batches.
    #[arg(long, default_value_t = 5)]
    burst: u32,
}

struct MockCloud;

#[async_trait]
impl CloudLookup for MockCloud {
    async fn describe(&self, batch: &[Address]) -> HashMap<Address, LookupOutcome> {
        batch
            .iter()
            .map(|addr| {
                let instance = InstanceRecord {
                    id: format!("i-{}", addr.as_str().replace('.', "")),
                    region: "us-east-1".to_string(),
                    tags: vec!["env:demo".to_string()],
                };
                (addr.clone(), LookupOutcome::Found(instance))
            })
            .collect()
    }

    fn max_batch_size(&self) -> usize {
        8
    }
}

struct StdoutForwarder;

#[async_trait]
impl Forwarder for StdoutForwarder {
    async fn forward_metric(&self, _cancel: &CancellationToken, metric: Metric) -> ForwardResult {
        info!(
            source = %metric.source,
            hostname = %metric.hostname,
            tags = ?metric.tags,
            "forwarded metric"
        );
        ForwardResult::Ok
    }

    async fn forward_event(&self, _cancel: &CancellationToken, event: Event) -> ForwardResult {
        info!(source = %event.source, hostname = %event.hostname, "forwarded event");
        ForwardResult::Ok
    }

    async fn drain_events(&self) {}
}

struct NoopLimiter;
#[async_trait]
impl RateLimiter for NoopLimiter {
    async fn acquire(&self, _cancel: &CancellationToken) -> Result<(), Cancelled> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    let limiter: Arc<dyn RateLimiter> = if cli.rate_per_sec == 0 {
        Arc::new(NoopLimiter)
    } else {
        Arc::new(TokenBucketLimiter::new(cli.rate_per_sec, cli.burst))
    };

    let core = CacheCore::new(
        CacheConfig::default(),
        Arc::new(MockCloud),
        limiter,
        Arc::new(StdoutForwarder),
    )
    .context("invalid cache configuration")?;

    let cancel = CancellationToken::new();
    for (i, addr) in cli.addresses.iter().enumerate() {
        let metric = Metric {
            source: Address::new(addr.clone()),
            name: "demo.metric".to_string(),
            value: i as f64,
            hostname: String::new(),
            tags: vec![],
        };
        core.dispatch_metric(&cancel, metric).await;
    }

    core.drain_events().await;
    core.shutdown();
    Ok(())
}
