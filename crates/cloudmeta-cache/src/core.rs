// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The single-owner event loop and the public dispatch surface built on
//! top of it. Modeled on the discovery server's `DiscoveryServer::run`
//! select-loop and its spawned lease-checker task, generalized from a
//! multi-writer-behind-one-lock design to a true single-writer loop:
//! the loop never takes the cache's write lock to read its own state,
//! only to publish it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::dispatcher;
use crate::enrich::enrich;
use crate::error::CoreError;
use crate::registry::{CacheMap, Holder};
use crate::traits::{CloudLookup, Forwarder, RateLimiter};
use crate::types::{Address, Event, ForwardResult, Metric};

/// Wait-group-style barrier for in-flight events: supports increment,
/// batched decrement, and a race-free wait-until-zero.
#[derive(Clone)]
struct EventGate {
    count: Arc<Mutex<i64>>,
    notify: Arc<Notify>,
}

impl EventGate {
    fn new() -> Self {
        Self {
            count: Arc::new(Mutex::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    async fn increment(&self) {
        *self.count.lock().await += 1;
    }

    async fn decrement_by(&self, n: i64) {
        if n == 0 {
            return;
        }
        let mut count = self.count.lock().await;
        *count -= n;
        if *count <= 0 {
            self.notify.notify_waiters();
        }
    }

    async fn wait_until_zero(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            if *self.count.lock().await <= 0 {
                return;
            }
            notified.as_mut().await;
        }
    }
}

/// The event loop's owned state: the pending queues and the
/// pending-lookup buffer. Exclusively touched by [`EventLoop::run`] -
/// no other task may see these fields.
struct EventLoop {
    config: CacheConfig,
    cache: CacheMap,
    forwarder: Arc<dyn Forwarder>,
    cancel: CancellationToken,
    event_gate: EventGate,

    metric_rx: mpsc::Receiver<Metric>,
    event_rx: mpsc::Receiver<Event>,
    lookup_result_rx: mpsc::Receiver<(Address, crate::types::LookupOutcome)>,
    lookup_out_tx: mpsc::Sender<Address>,

    pending_metrics: HashMap<Address, Vec<Metric>>,
    pending_events: HashMap<Address, Vec<Event>>,
    pending_lookup: VecDeque<Address>,
}

impl EventLoop {
    async fn handle_metric(&mut self, metric: Metric) {
        if let Some(holder) = self.cache.get(&metric.source).await {
            holder.touch();
            let forwarder = self.forwarder.clone();
            let cancel = self.cancel.clone();
            let mut metric = metric;
            tokio::spawn(async move {
                enrich(&mut metric, holder.instance.as_ref());
                let _ = forwarder.forward_metric(&cancel, metric).await;
            });
            return;
        }

        let addr = metric.source.clone();
        let list = self.pending_metrics.entry(addr.clone()).or_default();
        let was_empty = list.is_empty();
        list.push(metric);
        if was_empty {
            self.pending_lookup.push_back(addr);
        }
    }

    async fn handle_event(&mut self, event: Event) {
        if let Some(holder) = self.cache.get(&event.source).await {
            holder.touch();
            let forwarder = self.forwarder.clone();
            let cancel = self.cancel.clone();
            let event_gate = self.event_gate.clone();
            let mut event = event;
            tokio::spawn(async move {
                enrich(&mut event, holder.instance.as_ref());
                let _ = forwarder.forward_event(&cancel, event).await;
                event_gate.decrement_by(1).await;
            });
            return;
        }

        let addr = event.source.clone();
        let list = self.pending_events.entry(addr.clone()).or_default();
        let was_empty = list.is_empty();
        list.push(event);
        if was_empty {
            self.pending_lookup.push_back(addr);
        }
    }

    async fn handle_lookup_result(&mut self, addr: Address, outcome: crate::types::LookupOutcome) {
        let now = Instant::now();
        let prior = self.cache.get(&addr).await;

        let (instance, ttl) = match outcome {
            crate::types::LookupOutcome::Found(inst) => (Some(inst), self.config.positive_ttl),
            crate::types::LookupOutcome::Absent => (None, self.config.positive_ttl),
            crate::types::LookupOutcome::Error(ref e) => {
                info!(address = %addr, error = %e, "lookup error, retaining any cached instance");
                let retained = prior.as_ref().and_then(|h| h.instance.clone());
                (retained, self.config.negative_ttl)
            }
        };

        let expires = now + ttl;
        let holder = match &prior {
            Some(old) => Holder::succeed(old, instance, expires),
            None => Holder::fresh(instance, expires),
        };
        let instance_for_forward = holder.instance.clone();
        self.cache.install(addr.clone(), holder).await;

        let metrics = self.pending_metrics.remove(&addr).unwrap_or_default();
        let events = self.pending_events.remove(&addr).unwrap_or_default();

        if !metrics.is_empty() {
            let forwarder = self.forwarder.clone();
            let cancel = self.cancel.clone();
            let instance = instance_for_forward.clone();
            tokio::spawn(async move {
                for mut metric in metrics {
                    enrich(&mut metric, instance.as_ref());
                    let _ = forwarder.forward_metric(&cancel, metric).await;
                }
            });
        }

        if !events.is_empty() {
            let forwarder = self.forwarder.clone();
            let cancel = self.cancel.clone();
            let instance = instance_for_forward;
            let event_gate = self.event_gate.clone();
            let n = events.len() as i64;
            tokio::spawn(async move {
                for mut event in events {
                    enrich(&mut event, instance.as_ref());
                    let _ = forwarder.forward_event(&cancel, event).await;
                }
                event_gate.decrement_by(n).await;
            });
        }
    }

    async fn do_refresh(&mut self) {
        let outcome = self
            .cache
            .sweep(Instant::now(), self.config.evict_after_idle)
            .await;
        if !outcome.evicted.is_empty() {
            info!(count = outcome.evicted.len(), "evicted idle cache entries");
        }
        for addr in outcome.due_for_refresh {
            self.pending_lookup.push_back(addr);
        }
    }

    /// Drives ingest, lookup completions, and refresh over a single
    /// select loop. The pending-lookup buffer is drained LIFO into a
    /// one-slot "parked" register that becomes a sixth select arm only
    /// while occupied, so the send to the dispatcher is only polled when
    /// there is actually an address waiting to go out.
    async fn run(mut self) {
        let mut refresh_ticker = tokio::time::interval(self.config.refresh_period);
        refresh_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut parked: Option<Address> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("cache core event loop cancelled");
                    break;
                }
                Some(metric) = self.metric_rx.recv() => {
                    self.handle_metric(metric).await;
                }
                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event).await;
                }
                Some((addr, outcome)) = self.lookup_result_rx.recv() => {
                    self.handle_lookup_result(addr, outcome).await;
                }
                _ = refresh_ticker.tick() => {
                    self.do_refresh().await;
                }
                Ok(()) = self.lookup_out_tx.send(
                    parked.clone().expect("select arm guarded by parked.is_some()")
                ), if parked.is_some() => {
                    parked = None;
                }
            }

            if parked.is_none() {
                parked = self.pending_lookup.pop_back();
            }
        }
    }
}

/// Handle to a running cache core. Cheap to clone; every clone shares
/// the same event loop, dispatcher, and cache map.
#[derive(Clone)]
pub struct CacheCore {
    cache: CacheMap,
    forwarder: Arc<dyn Forwarder>,
    metric_tx: mpsc::Sender<Metric>,
    event_tx: mpsc::Sender<Event>,
    event_gate: EventGate,
    cancel: CancellationToken,
}

impl CacheCore {
    /// Validate `config`, spawn the event loop and the lookup
    /// dispatcher, and return a handle. Must be called from within a
    /// running Tokio runtime.
    pub fn new(
        config: CacheConfig,
        cloud: Arc<dyn CloudLookup>,
        limiter: Arc<dyn RateLimiter>,
        forwarder: Arc<dyn Forwarder>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let cache = CacheMap::new();
        let event_gate = EventGate::new();

        let (metric_tx, metric_rx) = mpsc::channel(1);
        let (event_tx, event_rx) = mpsc::channel(1);
        let (lookup_out_tx, lookup_out_rx) = mpsc::channel(cloud.max_batch_size().max(1));
        let (lookup_result_tx, lookup_result_rx) = mpsc::channel(cloud.max_batch_size().max(1));

        tokio::spawn(dispatcher::run(
            cancel.clone(),
            lookup_out_rx,
            lookup_result_tx,
            cloud,
            limiter,
        ));

        let event_loop = EventLoop {
            config,
            cache: cache.clone(),
            forwarder: forwarder.clone(),
            cancel: cancel.clone(),
            event_gate: event_gate.clone(),
            metric_rx,
            event_rx,
            lookup_result_rx,
            lookup_out_tx,
            pending_metrics: HashMap::new(),
            pending_events: HashMap::new(),
            pending_lookup: VecDeque::new(),
        };
        tokio::spawn(event_loop.run());

        Ok(Self {
            cache,
            forwarder,
            metric_tx,
            event_tx,
            event_gate,
            cancel,
        })
    }

    /// Cache-read fast path on hit; hands off to the event loop on
    /// miss. Returns `Cancelled` only if `cancel` fires before the
    /// handoff is accepted - the event loop's own processing is never
    /// observed by the caller.
    pub async fn dispatch_metric(&self, cancel: &CancellationToken, mut metric: Metric) -> ForwardResult {
        if metric.source.is_unknown() {
            return self.forwarder.forward_metric(cancel, metric).await;
        }

        if let Some(holder) = self.cache.get(&metric.source).await {
            holder.touch();
            enrich(&mut metric, holder.instance.as_ref());
            return self.forwarder.forward_metric(cancel, metric).await;
        }

        tokio::select! {
            _ = cancel.cancelled() => ForwardResult::Cancelled,
            result = self.metric_tx.send(metric) => match result {
                Ok(()) => ForwardResult::Ok,
                Err(_) => ForwardResult::Error("cache core event loop is not running".to_string()),
            },
        }
    }

    /// Identical to [`Self::dispatch_metric`], except an in-flight event
    /// counter is incremented before handoff and decremented only once
    /// the event is actually forwarded (or the handoff itself is
    /// cancelled). Backs [`Self::drain_events`].
    pub async fn dispatch_event(&self, cancel: &CancellationToken, mut event: Event) -> ForwardResult {
        self.event_gate.increment().await;

        if event.source.is_unknown() {
            let result = self.forwarder.forward_event(cancel, event).await;
            self.event_gate.decrement_by(1).await;
            return result;
        }

        if let Some(holder) = self.cache.get(&event.source).await {
            holder.touch();
            enrich(&mut event, holder.instance.as_ref());
            let result = self.forwarder.forward_event(cancel, event).await;
            self.event_gate.decrement_by(1).await;
            return result;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.event_gate.decrement_by(1).await;
                ForwardResult::Cancelled
            }
            result = self.event_tx.send(event) => match result {
                Ok(()) => ForwardResult::Ok,
                Err(_) => {
                    self.event_gate.decrement_by(1).await;
                    ForwardResult::Error("cache core event loop is not running".to_string())
                }
            },
        }
    }

    /// Waits for every accepted event to have been forwarded, then
    /// chains into the downstream handler's own drain barrier.
    pub async fn drain_events(&self) {
        self.event_gate.wait_until_zero().await;
        self.forwarder.drain_events().await;
    }

    /// Signal cancellation: the event loop returns on its next select,
    /// the dispatcher exits after any in-flight lookup, and anything
    /// still sitting on a pending queue is discarded. Delivery is
    /// best-effort on shutdown; call [`Self::drain_events`] first if
    /// every accepted event must be forwarded before the core stops.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    #[cfg(feature = "test-util")]
    pub fn cache(&self) -> &CacheMap {
        &self.cache
    }

    /// Installs a holder directly, bypassing the lookup path entirely.
    /// Lets scenario tests seed TTL/idle state without racing the event
    /// loop's own lookup dispatch.
    #[cfg(feature = "test-util")]
    pub async fn seed_for_test(
        &self,
        addr: Address,
        instance: Option<crate::types::InstanceRecord>,
        ttl: std::time::Duration,
    ) {
        let holder = Holder::fresh(instance, Instant::now() + ttl);
        self.cache.install(addr, holder).await;
    }
}
