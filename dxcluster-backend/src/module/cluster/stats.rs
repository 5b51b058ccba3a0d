use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use dxcluster_common::{ConnectionState, StatsSnapshot};

use crate::module::enrichment::EnrichmentCounters;

#[derive(Debug, Default)]
struct Stats {
    state: ConnectionState,
    connected_since: Option<DateTime<Utc>>,
    total_spots_received: u64,
    total_parse_failures: u64,
    synthetic_spots: u64,
    last_reconnect_attempt: Option<DateTime<Utc>>,
    reconnect_count: u64,
}

/// Connection and ingestion counters. Every update and every snapshot takes
/// the same lock, so a snapshot never mixes before/after values.
#[derive(Debug, Default)]
pub struct StatsTracker {
    inner: RwLock<Stats>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_state(&self, state: ConnectionState) {
        let mut stats = self.inner.write().await;
        if state == ConnectionState::Connected {
            if stats.state != ConnectionState::Connected {
                stats.connected_since = Some(Utc::now());
            }
        } else {
            stats.connected_since = None;
        }
        stats.state = state;
    }

    pub async fn record_spot(&self) {
        self.inner.write().await.total_spots_received += 1;
    }

    pub async fn record_parse_failure(&self) {
        self.inner.write().await.total_parse_failures += 1;
    }

    pub async fn record_synthetic(&self) {
        self.inner.write().await.synthetic_spots += 1;
    }

    pub async fn record_reconnect_attempt(&self) {
        let mut stats = self.inner.write().await;
        stats.reconnect_count += 1;
        stats.last_reconnect_attempt = Some(Utc::now());
    }

    /// `cache_size` and the enrichment counters are owned elsewhere and passed in.
    pub async fn snapshot(&self, cache_size: usize, enrichment: Option<EnrichmentCounters>) -> StatsSnapshot {
        let stats = self.inner.read().await;
        let enrichment = enrichment.unwrap_or_default();

        StatsSnapshot {
            state: stats.state,
            connected: stats.state == ConnectionState::Connected,
            connected_since: stats.connected_since,
            total_spots_received: stats.total_spots_received,
            total_parse_failures: stats.total_parse_failures,
            synthetic_spots: stats.synthetic_spots,
            cache_size,
            last_reconnect_attempt: stats.last_reconnect_attempt,
            reconnect_count: stats.reconnect_count,
            enrichment_lookups: enrichment.lookups,
            enrichment_failures: enrichment.failures,
            enrichment_cached: enrichment.cached,
            taken_at: Utc::now(),
        }
    }
}
