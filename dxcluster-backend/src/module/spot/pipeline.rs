///! The single path every spot takes into the cache

use std::sync::Arc;

use dxcluster_common::Spot;

use super::cache::{EnrichmentTarget, SpotCache};
use crate::module::enrichment::EnrichmentPool;

pub struct SpotPipeline {
    cache: Arc<SpotCache>,
    enrichment: Option<Arc<EnrichmentPool>>,
    enrich_spotter: bool,
}

impl SpotPipeline {
    pub fn new(cache: Arc<SpotCache>) -> Self {
        Self {
            cache,
            enrichment: None,
            enrich_spotter: false,
        }
    }

    pub fn with_enrichment(mut self, pool: Arc<EnrichmentPool>, enrich_spotter: bool) -> Self {
        self.enrichment = Some(pool);
        self.enrich_spotter = enrich_spotter;
        self
    }

    pub fn cache(&self) -> &Arc<SpotCache> {
        &self.cache
    }

    pub fn enrichment(&self) -> Option<&Arc<EnrichmentPool>> {
        self.enrichment.as_ref()
    }

    /// Insert `spot` immediately, enriched only from what is already cached.
    ///
    /// Misses are queued after the insert so a fast lookup always finds the
    /// spot it should attach to.
    pub async fn ingest(&self, mut spot: Spot) -> Spot {
        let Some(pool) = &self.enrichment else {
            self.cache.insert(spot.clone()).await;
            return spot;
        };

        spot.enrichment = pool.cache().lookup(&spot.dx_callsign).await;
        if self.enrich_spotter {
            spot.spotter_enrichment = pool.cache().lookup(&spot.spotter_callsign).await;
        }

        self.cache.insert(spot.clone()).await;

        if spot.enrichment.is_none() {
            pool.resolve_async(EnrichmentTarget::Dx, &spot.dx_callsign);
        }
        if self.enrich_spotter && spot.spotter_enrichment.is_none() {
            pool.resolve_async(EnrichmentTarget::Spotter, &spot.spotter_callsign);
        }

        spot
    }
}
