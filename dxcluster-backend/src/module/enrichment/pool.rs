///! Background enrichment workers
///!
///! Ingestion hands callsigns to a bounded queue and moves on; a fixed set of
///! workers resolves them and attaches the results to the cached spots.
///! A full queue drops the request, the spot simply stays unenriched.

use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::cache::EnrichmentCache;
use crate::module::spot::{EnrichmentTarget, SpotCache};

#[derive(Debug, Clone)]
struct LookupJob {
    target: EnrichmentTarget,
    callsign: String,
}

pub struct EnrichmentPool {
    cache: Arc<EnrichmentCache>,
    queue: mpsc::Sender<LookupJob>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl EnrichmentPool {
    /// Spawn `workers` tasks resolving into `spots`.
    pub fn start(
        cache: Arc<EnrichmentCache>,
        spots: Arc<SpotCache>,
        workers: usize,
        queue_size: usize,
    ) -> Self {
        let (queue, receiver) = mpsc::channel(queue_size.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|id| {
                let cache = cache.clone();
                let spots = spots.clone();
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    Self::worker_loop(id, cache, spots, receiver).await;
                })
            })
            .collect::<Vec<_>>();

        info!("Started {} enrichment workers (queue size {})", handles.len(), queue_size);

        Self {
            cache,
            queue,
            workers: std::sync::Mutex::new(handles),
        }
    }

    async fn worker_loop(
        id: usize,
        cache: Arc<EnrichmentCache>,
        spots: Arc<SpotCache>,
        receiver: Arc<Mutex<mpsc::Receiver<LookupJob>>>,
    ) {
        loop {
            let job = receiver.lock().await.recv().await;
            let Some(job) = job else {
                debug!("Enrichment worker {} exiting, queue closed", id);
                break;
            };

            if let Some(result) = cache.resolve(&job.callsign).await {
                let updated = spots.attach_enrichment(job.target, &job.callsign, &result).await;
                debug!(
                    "Worker {} enriched {} cached spot(s) for {} ({:?})",
                    id, updated, job.callsign, job.target
                );
            }
        }
    }

    pub fn cache(&self) -> &Arc<EnrichmentCache> {
        &self.cache
    }

    /// Queue a lookup without waiting. Returns `false` if the queue is full or closed.
    pub fn resolve_async(&self, target: EnrichmentTarget, callsign: &str) -> bool {
        let job = LookupJob {
            target,
            callsign: callsign.to_string(),
        };
        match self.queue.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                debug!("Enrichment queue full, skipping {}", job.callsign);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Cancel pending and running lookups.
    ///
    /// Spot cache writes happen under its lock, so aborting a worker mid-job
    /// leaves the cache consistent.
    pub fn shutdown(&self) {
        self.cache.close();
        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in &handles {
            handle.abort();
        }
        if !handles.is_empty() {
            info!("Stopped {} enrichment workers", handles.len());
        }
    }
}

impl Drop for EnrichmentPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
