// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! External collaborator interfaces: the cloud lookup, the rate
//! limiter, and the downstream forwarding target. The core depends only
//! on these traits - concrete cloud clients, limiter implementations,
//! and dispatch targets are the embedding application's concern.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::types::{Address, Cancelled, Event, ForwardResult, LookupOutcome, Metric};

/// The cloud provider's batch instance-description API.
#[async_trait]
pub trait CloudLookup: Send + Sync {
    /// Resolve a batch of addresses to their instance disposition.
    async fn describe(&self, batch: &[Address]) -> HashMap<Address, LookupOutcome>;

    /// Maximum number of addresses the provider accepts per call.
    fn max_batch_size(&self) -> usize;
}

/// A token acquirer gating lookup batches.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Block until one token is available, or until `cancel` fires.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Cancelled>;
}

/// The downstream handler that metrics and events are forwarded to.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward_metric(&self, cancel: &CancellationToken, metric: Metric) -> ForwardResult;
    async fn forward_event(&self, cancel: &CancellationToken, event: Event) -> ForwardResult;

    /// Barrier: returns once every event accepted so far has been forwarded.
    async fn drain_events(&self);
}
