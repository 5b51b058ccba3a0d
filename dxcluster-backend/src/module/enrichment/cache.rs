///! Memoizing callsign lookup cache.
///!
///! At most one outbound lookup per callsign is in flight at any time: callers
///! that miss while a lookup is running await the same shared future instead
///! of issuing their own request. Failures are remembered for a short negative
///! TTL so a struggling lookup service is not hammered, and a semaphore caps
///! how many distinct lookups run concurrently.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use dxcluster_common::EnrichmentResult;

use super::client::LookupClient;
use crate::config::EnrichmentConfig;

type SharedLookup = Shared<BoxFuture<'static, Option<EnrichmentResult>>>;

/// How long a successful lookup stays valid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessPolicy {
    Permanent,
    Ttl(Duration),
}

impl FreshnessPolicy {
    fn is_fresh(&self, stored_at: Instant, now: Instant) -> bool {
        match self {
            FreshnessPolicy::Permanent => true,
            FreshnessPolicy::Ttl(ttl) => now.duration_since(stored_at) < *ttl,
        }
    }
}

enum Entry {
    Resolved {
        result: EnrichmentResult,
        stored_at: Instant,
    },
    Failed {
        until: Instant,
    },
}

enum Cached {
    Hit(EnrichmentResult),
    RecentlyFailed,
    Miss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnrichmentCounters {
    /// Outbound lookups issued
    pub lookups: u64,
    pub failures: u64,
    /// Failures since the last success
    pub consecutive_failures: u64,
    /// Fresh successful entries held
    pub cached: usize,
}

pub struct EnrichmentCache {
    client: Arc<dyn LookupClient>,
    freshness: FreshnessPolicy,
    negative_ttl: Duration,
    entries: RwLock<HashMap<String, Entry>>,
    in_flight: Mutex<HashMap<String, SharedLookup>>,
    permits: Semaphore,
    lookups: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU64,
}

/// Cache key for a callsign
fn normalize(callsign: &str) -> String {
    callsign.trim().to_uppercase()
}

impl EnrichmentCache {
    pub fn new(
        client: Arc<dyn LookupClient>,
        freshness: FreshnessPolicy,
        negative_ttl: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            client,
            freshness,
            negative_ttl,
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            permits: Semaphore::new(max_concurrent.max(1)),
            lookups: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
        }
    }

    pub fn from_config(client: Arc<dyn LookupClient>, config: &EnrichmentConfig) -> Self {
        let freshness = match config.ttl() {
            Some(ttl) => FreshnessPolicy::Ttl(ttl),
            None => FreshnessPolicy::Permanent,
        };
        Self::new(
            client,
            freshness,
            Duration::from_secs(config.negative_ttl_secs),
            config.workers,
        )
    }

    /// Cached result for `callsign`, never touches the network.
    pub async fn lookup(&self, callsign: &str) -> Option<EnrichmentResult> {
        match self.cached(&normalize(callsign)).await {
            Cached::Hit(result) => Some(result),
            Cached::RecentlyFailed | Cached::Miss => None,
        }
    }

    /// Cached result, or the outcome of a (possibly shared) lookup.
    ///
    /// `None` when the lookup fails or failed recently.
    pub async fn resolve(self: &Arc<Self>, callsign: &str) -> Option<EnrichmentResult> {
        let key = normalize(callsign);
        if key.is_empty() {
            return None;
        }

        match self.cached(&key).await {
            Cached::Hit(result) => return Some(result),
            Cached::RecentlyFailed => return None,
            Cached::Miss => {}
        }

        let lookup = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!("Joining in-flight lookup for {}", key);
                    existing.clone()
                }
                None => {
                    // A lookup may have finished between the first check and taking
                    // the lock; it writes its entry before leaving `in_flight`.
                    match self.cached(&key).await {
                        Cached::Hit(result) => return Some(result),
                        Cached::RecentlyFailed => return None,
                        Cached::Miss => {}
                    }
                    let lookup = self.clone().run_lookup(key.clone()).boxed().shared();
                    in_flight.insert(key, lookup.clone());
                    lookup
                }
            }
        };

        lookup.await
    }

    async fn run_lookup(self: Arc<Self>, key: String) -> Option<EnrichmentResult> {
        let outcome = match self.permits.acquire().await {
            Ok(_permit) => {
                self.lookups.fetch_add(1, Ordering::Relaxed);
                self.client.lookup(&key).await
            }
            Err(_) => {
                self.in_flight.lock().await.remove(&key);
                return None;
            }
        };

        let now = Instant::now();
        let result = match outcome {
            Ok(result) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.entries.write().await.insert(
                    key.clone(),
                    Entry::Resolved {
                        result: result.clone(),
                        stored_at: now,
                    },
                );
                debug!("Resolved {}: {:?}", key, result.entity);
                Some(result)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                let streak = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Lookup for {} failed ({} in a row): {}", key, streak, e);
                self.entries.write().await.insert(
                    key.clone(),
                    Entry::Failed {
                        until: now + self.negative_ttl,
                    },
                );
                None
            }
        };

        self.in_flight.lock().await.remove(&key);
        result
    }

    async fn cached(&self, key: &str) -> Cached {
        let entries = self.entries.read().await;
        let now = Instant::now();
        match entries.get(key) {
            Some(Entry::Resolved { result, stored_at }) if self.freshness.is_fresh(*stored_at, now) => {
                Cached::Hit(result.clone())
            }
            Some(Entry::Failed { until }) if now < *until => Cached::RecentlyFailed,
            _ => Cached::Miss,
        }
    }

    /// Drop stale results and expired failures. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| match entry {
            Entry::Resolved { stored_at, .. } => self.freshness.is_fresh(*stored_at, now),
            Entry::Failed { until } => now < *until,
        });
        before - entries.len()
    }

    /// Number of lookups currently running or queued on the semaphore
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    pub async fn counters(&self) -> EnrichmentCounters {
        let now = Instant::now();
        let cached = self
            .entries
            .read()
            .await
            .values()
            .filter(|entry| matches!(entry, Entry::Resolved { stored_at, .. } if self.freshness.is_fresh(*stored_at, now)))
            .count();

        EnrichmentCounters {
            lookups: self.lookups.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            cached,
        }
    }

    /// Stop new lookups from starting; running ones finish normally.
    pub fn close(&self) {
        self.permits.close();
    }
}
