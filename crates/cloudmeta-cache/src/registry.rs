// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The address-keyed cache map: [`Holder`] entries, expiry, and the
//! idle-eviction sweep. Modeled on the discovery server's participant
//! registry (last-seen timestamps, `is_expired`, batched
//! `remove_expired`), generalized to the single-owner-writer /
//! shared-reader split this crate's event loop requires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::types::{Address, InstanceRecord};

// `tokio::time::Instant` rather than `std::time::Instant`: under
// `#[tokio::test(start_paused = true)]` it is the one clock that
// `tokio::time::advance` actually moves, which is what lets the TTL and
// idle-eviction scenarios run without real sleeps.
fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn nanos_since_epoch(instant: Instant) -> i64 {
    if instant >= epoch() {
        instant.duration_since(epoch()).as_nanos() as i64
    } else {
        0
    }
}

fn now_nanos() -> i64 {
    nanos_since_epoch(Instant::now())
}

/// One cache entry. Never mutated in place once published, except for
/// `last_access_nanos`, which is a single atomic word shared by every
/// holder generation descended from the same lineage (see
/// [`Holder::succeed`]).
#[derive(Debug, Clone)]
pub struct Holder {
    pub instance: Option<InstanceRecord>,
    pub expires: Instant,
    last_access_nanos: Arc<AtomicI64>,
}

impl Holder {
    /// Construct a fresh holder with no prior lineage - `last_access` is
    /// set to now.
    pub fn fresh(instance: Option<InstanceRecord>, expires: Instant) -> Self {
        Self {
            instance,
            expires,
            last_access_nanos: Arc::new(AtomicI64::new(now_nanos())),
        }
    }

    /// Construct a holder that replaces `prior`, carrying its
    /// `last_access` lineage forward untouched.
    pub fn succeed(prior: &Holder, instance: Option<InstanceRecord>, expires: Instant) -> Self {
        Self {
            instance,
            expires,
            last_access_nanos: prior.last_access_nanos.clone(),
        }
    }

    /// Record a cache hit. Monotonic: never moves backwards.
    pub fn touch(&self) {
        self.last_access_nanos.fetch_max(now_nanos(), Ordering::AcqRel);
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let idle_nanos = nanos_since_epoch(now) - self.last_access_nanos.load(Ordering::Acquire);
        Duration::from_nanos(idle_nanos.max(0) as u64)
    }
}

/// Result of a [`CacheMap::sweep`] pass.
pub struct SweepOutcome {
    /// Addresses dropped for being idle past `evict_after_idle`.
    pub evicted: Vec<Address>,
    /// Addresses whose TTL lapsed and should be re-scheduled for lookup.
    pub due_for_refresh: Vec<Address>,
}

/// The address -> holder map, shared between the event loop (sole
/// writer) and any number of concurrent readers via a read/write lock.
#[derive(Clone)]
pub struct CacheMap {
    inner: Arc<RwLock<HashMap<Address, Arc<Holder>>>>,
}

impl CacheMap {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Linearizable read: once `install` releases the write lock,
    /// every subsequent `get` observes the new holder.
    pub async fn get(&self, addr: &Address) -> Option<Arc<Holder>> {
        self.inner.read().await.get(addr).cloned()
    }

    /// Replace (or create) the holder for `addr`, returning the
    /// previous holder if any.
    pub async fn install(&self, addr: Address, holder: Holder) -> Option<Arc<Holder>> {
        self.inner.write().await.insert(addr, Arc::new(holder))
    }

    /// One pass: entries idle past `evict_after_idle` are staged for
    /// eviction; entries merely past their `expires` (and not idle) are
    /// staged for refresh. An entry that is both idle and expired is
    /// evicted, not refreshed - idle wins.
    pub async fn sweep(&self, now: Instant, evict_after_idle: Duration) -> SweepOutcome {
        let mut evicted = Vec::new();
        let mut due_for_refresh = Vec::new();
        {
            let map = self.inner.read().await;
            for (addr, holder) in map.iter() {
                if holder.idle_for(now) > evict_after_idle {
                    evicted.push(addr.clone());
                } else if now > holder.expires {
                    due_for_refresh.push(addr.clone());
                }
            }
        }
        if !evicted.is_empty() {
            let mut map = self.inner.write().await;
            for addr in &evicted {
                map.remove(addr);
            }
        }
        SweepOutcome {
            evicted,
            due_for_refresh,
        }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

impl Default for CacheMap {
    fn default() -> Self {
        Self::new()
    }
}
