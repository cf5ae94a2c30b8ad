// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The lookup dispatcher: a long-running task that batches pending
//! addresses, gates each batch on the rate limiter, and invokes the
//! cloud lookup. Modeled on the discovery server's relay-router task
//! shape (a channel-addressed routing loop) and the telemetry sink's
//! size-bounded batch buffer.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::traits::{CloudLookup, RateLimiter};
use crate::types::{Address, LookupOutcome};

/// Runs until `cancel` fires or the inbound channel closes.
///
/// Reads one address, drains up to `max_batch_size() - 1` more without
/// blocking, acquires a single rate-limit token for the whole batch,
/// then invokes the cloud lookup and emits one result per address.
pub async fn run(
    cancel: CancellationToken,
    mut inbound: mpsc::Receiver<Address>,
    outbound: mpsc::Sender<(Address, LookupOutcome)>,
    cloud: Arc<dyn CloudLookup>,
    limiter: Arc<dyn RateLimiter>,
) {
    let max_batch = cloud.max_batch_size().max(1);

    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("lookup dispatcher cancelled");
                break;
            }
            addr = inbound.recv() => match addr {
                Some(addr) => addr,
                None => {
                    debug!("lookup dispatcher inbound channel closed");
                    break;
                }
            },
        };

        let mut batch = Vec::with_capacity(max_batch);
        batch.push(first);
        while batch.len() < max_batch {
            match inbound.try_recv() {
                Ok(addr) => batch.push(addr),
                Err(_) => break,
            }
        }

        if limiter.acquire(&cancel).await.is_err() {
            debug!(
                batch_size = batch.len(),
                "rate limiter wait cancelled, abandoning batch"
            );
            continue;
        }

        let mut results = cloud.describe(&batch).await;
        for addr in batch {
            let outcome = results.remove(&addr).unwrap_or(LookupOutcome::Absent);
            if outbound.send((addr, outcome)).await.is_err() {
                debug!("lookup dispatcher outbound channel closed mid-batch");
                return;
            }
        }
    }
}
