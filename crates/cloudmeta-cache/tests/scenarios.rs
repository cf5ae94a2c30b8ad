// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end scenarios from the design's testable-properties section,
//! exercised against a real [`CacheCore`] with fake collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use cloudmeta_cache::{
    Address, CacheConfig, CacheCore, Cancelled, CloudLookup, Event, ForwardResult, Forwarder,
    InstanceRecord, LookupOutcome, Metric, RateLimiter, TokenBucketLimiter,
};

struct GatedCloud {
    max_batch_size: usize,
    gate: Arc<Notify>,
    outcome: Mutex<Box<dyn FnMut(&[Address]) -> HashMap<Address, LookupOutcome> + Send>>,
    calls: Arc<Mutex<Vec<Vec<Address>>>>,
}

impl GatedCloud {
    fn always_found(max_batch_size: usize, instance: InstanceRecord) -> (Self, Arc<Notify>, Arc<Mutex<Vec<Vec<Address>>>>) {
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let cloud = Self {
            max_batch_size,
            gate: gate.clone(),
            outcome: Mutex::new(Box::new(move |batch: &[Address]| {
                batch
                    .iter()
                    .map(|a| (a.clone(), LookupOutcome::Found(instance.clone())))
                    .collect()
            })),
            calls: calls.clone(),
        };
        (cloud, gate, calls)
    }

    fn always_error(max_batch_size: usize, message: &'static str) -> Self {
        Self {
            max_batch_size,
            gate: Arc::new(Notify::new()),
            outcome: Mutex::new(Box::new(move |batch: &[Address]| {
                batch
                    .iter()
                    .map(|a| (a.clone(), LookupOutcome::Error(message.to_string())))
                    .collect()
            })),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl CloudLookup for GatedCloud {
    async fn describe(&self, batch: &[Address]) -> HashMap<Address, LookupOutcome> {
        self.gate.notified().await;
        self.calls.lock().await.push(batch.to_vec());
        (self.outcome.lock().await)(batch)
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

/// A cloud lookup that never gates - useful when a test only cares
/// about batching/counting, not about controlling exactly when the
/// lookup completes.
struct OpenCloud {
    max_batch_size: usize,
    calls: Arc<Mutex<Vec<Vec<Address>>>>,
}

#[async_trait]
impl CloudLookup for OpenCloud {
    async fn describe(&self, batch: &[Address]) -> HashMap<Address, LookupOutcome> {
        self.calls.lock().await.push(batch.to_vec());
        batch
            .iter()
            .map(|a| {
                let instance = InstanceRecord {
                    id: format!("i-{a}"),
                    region: "r".to_string(),
                    tags: vec![],
                };
                (a.clone(), LookupOutcome::Found(instance))
            })
            .collect()
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

struct AlwaysReady;
#[async_trait]
impl RateLimiter for AlwaysReady {
    async fn acquire(&self, _cancel: &CancellationToken) -> Result<(), Cancelled> {
        Ok(())
    }
}

struct ChannelForwarder {
    metric_tx: mpsc::UnboundedSender<Metric>,
    event_tx: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl Forwarder for ChannelForwarder {
    async fn forward_metric(&self, _cancel: &CancellationToken, metric: Metric) -> ForwardResult {
        let _ = self.metric_tx.send(metric);
        ForwardResult::Ok
    }

    async fn forward_event(&self, _cancel: &CancellationToken, event: Event) -> ForwardResult {
        let _ = self.event_tx.send(event);
        ForwardResult::Ok
    }

    async fn drain_events(&self) {}
}

fn metric(addr: &str) -> Metric {
    Metric {
        source: Address::new(addr),
        name: "cpu.load".to_string(),
        value: 1.0,
        hostname: String::new(),
        tags: vec![],
    }
}

fn event(addr: &str) -> Event {
    Event {
        source: Address::new(addr),
        title: "deploy".to_string(),
        text: "deployed".to_string(),
        hostname: String::new(),
        tags: vec![],
    }
}

/// Scenario 1: coalescing. Five metrics for the same fresh address
/// produce exactly one lookup invocation and five enriched forwards.
#[tokio::test]
async fn coalescing_one_lookup_many_forwards() {
    let instance = InstanceRecord {
        id: "i-1".to_string(),
        region: "r".to_string(),
        tags: vec!["a".to_string()],
    };
    let (cloud, gate, calls) = GatedCloud::always_found(10, instance);
    let (metric_tx, mut metric_rx) = mpsc::unbounded_channel();
    let (event_tx, _event_rx) = mpsc::unbounded_channel();
    let forwarder = Arc::new(ChannelForwarder { metric_tx, event_tx });

    let core = CacheCore::new(
        CacheConfig::default(),
        Arc::new(cloud),
        Arc::new(AlwaysReady),
        forwarder,
    )
    .unwrap();

    let cancel = CancellationToken::new();
    for _ in 0..5 {
        let result = core.dispatch_metric(&cancel, metric("10.0.0.1")).await;
        assert_eq!(result, ForwardResult::Ok);
    }

    gate.notify_one();

    let mut forwarded = Vec::new();
    for _ in 0..5 {
        forwarded.push(metric_rx.recv().await.expect("metric forwarded"));
    }

    assert_eq!(calls.lock().await.len(), 1);
    assert_eq!(calls.lock().await[0], vec![Address::new("10.0.0.1")]);
    for m in forwarded {
        assert_eq!(m.hostname, "i-1");
        assert_eq!(m.tags, vec!["region:r".to_string(), "a".to_string()]);
    }
}

/// Scenario 5: an item carrying the unknown sentinel bypasses the
/// cache entirely - immediate forward, untouched tags/hostname.
#[tokio::test]
async fn unknown_address_bypasses_cache() {
    let cloud = OpenCloud {
        max_batch_size: 10,
        calls: Arc::new(Mutex::new(Vec::new())),
    };
    let calls = cloud.calls.clone();
    let (metric_tx, mut metric_rx) = mpsc::unbounded_channel();
    let (event_tx, _event_rx) = mpsc::unbounded_channel();
    let forwarder = Arc::new(ChannelForwarder { metric_tx, event_tx });

    let core = CacheCore::new(
        CacheConfig::default(),
        Arc::new(cloud),
        Arc::new(AlwaysReady),
        forwarder,
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let mut m = metric("unused");
    m.source = Address::unknown();
    m.tags = vec!["preexisting".to_string()];
    let result = core.dispatch_metric(&cancel, m).await;
    assert_eq!(result, ForwardResult::Ok);

    let forwarded = metric_rx.recv().await.expect("forwarded immediately");
    assert_eq!(forwarded.hostname, "");
    assert_eq!(forwarded.tags, vec!["preexisting".to_string()]);
    assert!(calls.lock().await.is_empty());
    assert_eq!(core.cache().len().await, 0);
}

/// Scenario 6: the drain barrier does not return while events are
/// still pending on an unprimed address, and returns once they forward.
#[tokio::test]
async fn drain_events_waits_for_pending_events() {
    let instance = InstanceRecord {
        id: "i-6".to_string(),
        region: "r".to_string(),
        tags: vec![],
    };
    let (cloud, gate, _calls) = GatedCloud::always_found(10, instance);
    let (metric_tx, _metric_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let forwarder = Arc::new(ChannelForwarder { metric_tx, event_tx });

    let core = CacheCore::new(
        CacheConfig::default(),
        Arc::new(cloud),
        Arc::new(AlwaysReady),
        forwarder,
    )
    .unwrap();

    let cancel = CancellationToken::new();
    for _ in 0..3 {
        core.dispatch_event(&cancel, event("10.0.0.6")).await;
    }

    let drain_core = core.clone();
    let drain_handle = tokio::spawn(async move { drain_core.drain_events().await });

    // The gate is still closed - nothing has been forwarded yet, so the
    // barrier must not have returned.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!drain_handle.is_finished());

    gate.notify_one();

    for _ in 0..3 {
        event_rx.recv().await.expect("event forwarded");
    }
    drain_handle.await.expect("drain_events completed");
}

/// Scenario 2 (TTL + negative caching): a lookup error preserves the
/// previously-cached instance and re-arms the holder with
/// `negative_ttl`.
#[tokio::test(start_paused = true)]
async fn negative_caching_preserves_old_instance() {
    let config = CacheConfig {
        refresh_period: Duration::from_millis(50),
        evict_after_idle: Duration::from_secs(3600),
        positive_ttl: Duration::from_millis(200),
        negative_ttl: Duration::from_millis(100),
        rate_per_sec: 1000,
        burst: 1000,
    };

    let cloud = GatedCloud::always_error(10, "provider timeout");
    cloud.gate.notify_one(); // never block this scenario
    let (metric_tx, mut metric_rx) = mpsc::unbounded_channel();
    let (event_tx, _event_rx) = mpsc::unbounded_channel();
    let forwarder = Arc::new(ChannelForwarder { metric_tx, event_tx });

    let core = CacheCore::new(config, Arc::new(cloud), Arc::new(AlwaysReady), forwarder).unwrap();

    // Seed the cache directly with a positive holder about to expire.
    let addr = Address::new("10.0.0.2");
    let seeded = cloudmeta_cache::InstanceRecord {
        id: "i-2".to_string(),
        region: "r".to_string(),
        tags: vec![],
    };
    core.seed_for_test(addr.clone(), Some(seeded), Duration::from_millis(1))
        .await;

    // Advance past the seeded TTL and let a couple of refresh ticks run.
    tokio::time::advance(Duration::from_millis(400)).await;
    tokio::task::yield_now().await;
    tokio::time::advance(Duration::from_millis(1)).await;
    tokio::task::yield_now().await;

    let cancel = CancellationToken::new();
    let result = core.dispatch_metric(&cancel, metric("10.0.0.2")).await;
    assert_eq!(result, ForwardResult::Ok);
    let forwarded = metric_rx.recv().await.expect("enriched from preserved instance");
    assert_eq!(forwarded.hostname, "i-2");
}

/// Scenario 3 (idle eviction): an untouched entry is dropped after
/// `evict_after_idle`, even though it is not TTL-expired.
#[tokio::test(start_paused = true)]
async fn idle_entry_is_evicted() {
    let config = CacheConfig {
        refresh_period: Duration::from_millis(50),
        evict_after_idle: Duration::from_millis(200),
        positive_ttl: Duration::from_secs(3600),
        negative_ttl: Duration::from_secs(60),
        rate_per_sec: 1000,
        burst: 1000,
    };

    let cloud = OpenCloud {
        max_batch_size: 10,
        calls: Arc::new(Mutex::new(Vec::new())),
    };
    let calls = cloud.calls.clone();
    let (metric_tx, mut metric_rx) = mpsc::unbounded_channel();
    let (event_tx, _event_rx) = mpsc::unbounded_channel();
    let forwarder = Arc::new(ChannelForwarder { metric_tx, event_tx });

    let core = CacheCore::new(config, Arc::new(cloud), Arc::new(AlwaysReady), forwarder).unwrap();

    let addr = Address::new("10.0.0.3");
    let seeded = cloudmeta_cache::InstanceRecord {
        id: "i-3".to_string(),
        region: "r".to_string(),
        tags: vec![],
    };
    core.seed_for_test(addr.clone(), Some(seeded), Duration::from_secs(3600))
        .await;
    assert_eq!(core.cache().len().await, 1);

    tokio::time::advance(Duration::from_millis(400)).await;
    tokio::task::yield_now().await;

    assert_eq!(core.cache().len().await, 0, "idle entry should be evicted");

    let cancel = CancellationToken::new();
    core.dispatch_metric(&cancel, metric("10.0.0.3")).await;
    let forwarded = metric_rx.recv().await.expect("fresh lookup after eviction");
    assert_eq!(forwarded.hostname, "i-3");
    assert_eq!(calls.lock().await.len(), 1, "eviction triggers exactly one fresh lookup");
}

/// Scenario 4 (rate limiting): ten distinct addresses with a
/// small max batch size and a 1/sec burst-1 limiter take at least
/// (batches - 1) seconds of virtual time to fully resolve.
#[tokio::test(start_paused = true)]
async fn rate_limiter_gates_batches() {
    let config = CacheConfig {
        refresh_period: Duration::from_secs(3600),
        evict_after_idle: Duration::from_secs(3600),
        positive_ttl: Duration::from_secs(3600),
        negative_ttl: Duration::from_secs(60),
        rate_per_sec: 1,
        burst: 1,
    };

    let max_batch_size = 3;
    let cloud = OpenCloud {
        max_batch_size,
        calls: Arc::new(Mutex::new(Vec::new())),
    };
    let calls = cloud.calls.clone();
    let (metric_tx, mut metric_rx) = mpsc::unbounded_channel();
    let (event_tx, _event_rx) = mpsc::unbounded_channel();
    let forwarder = Arc::new(ChannelForwarder { metric_tx, event_tx });

    let limiter = Arc::new(TokenBucketLimiter::new(config.rate_per_sec, config.burst));
    let core = CacheCore::new(config, Arc::new(cloud), limiter, forwarder).unwrap();

    let cancel = CancellationToken::new();
    let start = tokio::time::Instant::now();
    for i in 0..10 {
        core.dispatch_metric(&cancel, metric(&format!("10.0.1.{i}")))
            .await;
    }

    for _ in 0..10 {
        metric_rx.recv().await.expect("every metric eventually forwarded");
    }
    let elapsed = start.elapsed();

    // Batch granularity depends on how much the event loop has handed the
    // dispatcher by the time it drains its non-blocking `try_recv` pass, so
    // this only bounds batch count rather than asserting perfect packing.
    let batches = calls.lock().await.len();
    let min_batches = (10 + max_batch_size - 1) / max_batch_size;
    assert!((min_batches..=10).contains(&batches));
    assert!(
        elapsed >= Duration::from_secs((batches - 1) as u64),
        "elapsed {:?} should cover {} limiter waits",
        elapsed,
        batches - 1
    );
}
