use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use dxcluster_common::{Band, ConnectionState, Spot, StatsSnapshot};

use crate::config::BackendConfig;
use crate::error::{EnrichmentError, ServiceError};
use crate::module::cluster::{ClusterConnection, ClusterHandle, StatsTracker};
use crate::module::enrichment::{EnrichmentCache, EnrichmentPool, HttpLookupClient, LookupClient};
use crate::module::spot::{SpotCache, SpotPipeline, local_spot};

/// Everything the HTTP/portal layer is allowed to touch.
///
/// Owns the spot cache, the stats, the optional enrichment pool and the
/// cluster connection task. Construct inside a tokio runtime.
pub struct DxClusterService {
    callsign: String,
    cache: Arc<SpotCache>,
    pipeline: Arc<SpotPipeline>,
    stats: Arc<StatsTracker>,
    cluster: ClusterHandle,
}

impl DxClusterService {
    /// Build from configuration, with the HTTP lookup client when enrichment is enabled.
    pub fn new(config: &BackendConfig) -> Result<Self, EnrichmentError> {
        let client: Option<Arc<dyn LookupClient>> = if config.enrichment.enabled {
            Some(Arc::new(HttpLookupClient::new(&config.enrichment)?))
        } else {
            None
        };
        Ok(Self::with_lookup_client(config, client))
    }

    pub fn with_lookup_client(config: &BackendConfig, client: Option<Arc<dyn LookupClient>>) -> Self {
        let cache = Arc::new(SpotCache::new(config.cache.max_size));
        let stats = Arc::new(StatsTracker::new());

        let mut pipeline = SpotPipeline::new(cache.clone());
        if let Some(client) = client {
            let lookups = Arc::new(EnrichmentCache::from_config(client, &config.enrichment));
            let pool = EnrichmentPool::start(
                lookups,
                cache.clone(),
                config.enrichment.workers,
                config.enrichment.queue_size,
            );
            pipeline = pipeline.with_enrichment(Arc::new(pool), config.enrichment.enrich_spotter);
        }
        let pipeline = Arc::new(pipeline);

        let cluster = ClusterConnection::spawn(
            config.cluster.clone(),
            &config.backoff,
            pipeline.clone(),
            stats.clone(),
        );

        Self {
            callsign: config.cluster.callsign.clone(),
            cache,
            pipeline,
            stats,
            cluster,
        }
    }

    /// Begin connecting to the cluster node.
    pub fn start(&self) {
        self.cluster.start();
    }

    pub async fn all_spots(&self) -> Vec<Spot> {
        self.cache.all().await
    }

    pub async fn spots_by_band(&self, band: Band) -> Vec<Spot> {
        self.cache.by_band(band).await
    }

    pub async fn latest_spot(&self, khz: f64) -> Option<Spot> {
        self.cache.latest_by_frequency(khz).await
    }

    pub async fn stats(&self) -> StatsSnapshot {
        let enrichment = match self.enrichment_cache() {
            Some(cache) => Some(cache.counters().await),
            None => None,
        };
        self.stats.snapshot(self.cache.len().await, enrichment).await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.cluster.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.cluster.subscribe()
    }

    pub fn enrichment_cache(&self) -> Option<Arc<EnrichmentCache>> {
        self.pipeline.enrichment().map(|pool| pool.cache().clone())
    }

    /// Add a locally reported spot, spotted by the configured callsign.
    ///
    /// Works in any connection state.
    pub async fn submit_synthetic(
        &self,
        frequency: &str,
        dx_callsign: &str,
        remarks: &str,
    ) -> Result<Spot, ServiceError> {
        let spot = local_spot(frequency, dx_callsign, remarks, &self.callsign, Utc::now())?;
        let spot = self.pipeline.ingest(spot).await;
        self.stats.record_synthetic().await;
        info!("Synthetic spot added: {} {}", spot.frequency, spot.dx_callsign);
        Ok(spot)
    }

    pub fn restart(&self) {
        info!("Cluster connection restart requested");
        self.cluster.restart();
    }

    pub async fn send_raw_command(&self, text: &str) -> Result<(), ServiceError> {
        Ok(self.cluster.send_line(text).await?)
    }

    /// Announce a spot on the cluster as `dx <freq> <call> <remarks>`.
    ///
    /// Remarks with line breaks or other control characters are refused.
    pub async fn send_spot(&self, frequency: &str, dx_callsign: &str, remarks: &str) -> Result<(), ServiceError> {
        let spot = local_spot(frequency, dx_callsign, remarks, &self.callsign, Utc::now())?;
        let command = format!("dx {} {} {}", spot.frequency, spot.dx_callsign, spot.remarks.trim());
        self.send_raw_command(command.trim_end()).await
    }

    /// Change the spot cache capacity. Returns how many spots were evicted.
    pub async fn resize_cache(&self, max_size: usize) -> usize {
        self.cache.resize(max_size).await
    }

    /// Stop the connection and cancel pending lookups.
    pub async fn shutdown(&self) {
        info!("Shutting down DX cluster service...");
        self.cluster.shutdown().await;
        if let Some(pool) = self.pipeline.enrichment() {
            pool.shutdown();
        }
        info!("DX cluster service stopped");
    }
}
