///! Bounded in-memory spot history
///!
///! A ring of the most recent spots plus two indices (band, exact frequency).
///! Ring and indices sit behind one lock so readers never observe an insert
///! or eviction half-applied; every read returns owned copies.

use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

use dxcluster_common::{Band, EnrichmentResult, Spot};

/// Which callsign of a spot a lookup result belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnrichmentTarget {
    Dx,
    Spotter,
}

/// Frequencies are matched at 1 Hz resolution
fn frequency_key(khz: f64) -> u64 {
    (khz * 1000.0).round() as u64
}

struct CachedSpot {
    id: u64,
    spot: Spot,
}

struct CacheStore {
    max_size: usize,
    next_id: u64,
    /// Oldest first; ids are consecutive
    ring: VecDeque<CachedSpot>,
    by_band: HashMap<Band, VecDeque<u64>>,
    latest_by_frequency: HashMap<u64, u64>,
}

impl CacheStore {
    fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            next_id: 0,
            ring: VecDeque::with_capacity(max_size.max(1)),
            by_band: HashMap::new(),
            latest_by_frequency: HashMap::new(),
        }
    }

    fn get(&self, id: u64) -> Option<&CachedSpot> {
        let front = self.ring.front()?.id;
        let index = usize::try_from(id.checked_sub(front)?).ok()?;
        self.ring.get(index).filter(|entry| entry.id == id)
    }

    fn push(&mut self, spot: Spot) {
        while self.ring.len() >= self.max_size {
            self.evict_oldest();
        }

        let id = self.next_id;
        self.next_id += 1;

        self.by_band.entry(spot.band).or_default().push_back(id);
        self.latest_by_frequency.insert(frequency_key(spot.frequency), id);
        self.ring.push_back(CachedSpot { id, spot });
    }

    fn evict_oldest(&mut self) -> Option<Spot> {
        let evicted = self.ring.pop_front()?;

        if let Some(ids) = self.by_band.get_mut(&evicted.spot.band) {
            if ids.front() == Some(&evicted.id) {
                ids.pop_front();
            }
            if ids.is_empty() {
                self.by_band.remove(&evicted.spot.band);
            }
        }

        // The evicted spot is the oldest in the ring, so if it is still the
        // latest for its frequency no other spot at that frequency remains.
        let key = frequency_key(evicted.spot.frequency);
        if self.latest_by_frequency.get(&key) == Some(&evicted.id) {
            self.latest_by_frequency.remove(&key);
        }

        Some(evicted.spot)
    }
}

pub struct SpotCache {
    store: RwLock<CacheStore>,
}

impl SpotCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            store: RwLock::new(CacheStore::new(max_size)),
        }
    }

    /// Append a spot, evicting the oldest first when full.
    pub async fn insert(&self, spot: Spot) {
        self.store.write().await.push(spot);
    }

    /// Every cached spot, oldest first.
    pub async fn all(&self) -> Vec<Spot> {
        let store = self.store.read().await;
        store.ring.iter().map(|entry| entry.spot.clone()).collect()
    }

    /// Cached spots on `band`, oldest first.
    pub async fn by_band(&self, band: Band) -> Vec<Spot> {
        let store = self.store.read().await;
        store
            .by_band
            .get(&band)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| store.get(*id))
                    .map(|entry| entry.spot.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Most recently inserted spot on exactly `khz`.
    pub async fn latest_by_frequency(&self, khz: f64) -> Option<Spot> {
        let store = self.store.read().await;
        store
            .latest_by_frequency
            .get(&frequency_key(khz))
            .and_then(|id| store.get(*id))
            .map(|entry| entry.spot.clone())
    }

    /// Attach a lookup result to every cached spot for `callsign` that has none yet.
    ///
    /// Returns how many spots were updated.
    pub async fn attach_enrichment(
        &self,
        target: EnrichmentTarget,
        callsign: &str,
        result: &EnrichmentResult,
    ) -> usize {
        let mut store = self.store.write().await;
        let mut updated = 0;

        for entry in store.ring.iter_mut() {
            let (owner, slot) = match target {
                EnrichmentTarget::Dx => (&entry.spot.dx_callsign, &mut entry.spot.enrichment),
                EnrichmentTarget::Spotter => (
                    &entry.spot.spotter_callsign,
                    &mut entry.spot.spotter_enrichment,
                ),
            };
            if slot.is_none() && owner.eq_ignore_ascii_case(callsign) {
                *slot = Some(result.clone());
                updated += 1;
            }
        }

        updated
    }

    /// Change the capacity, evicting oldest spots if the cache shrinks.
    pub async fn resize(&self, max_size: usize) -> usize {
        let mut store = self.store.write().await;
        store.max_size = max_size.max(1);

        let mut evicted = 0;
        while store.ring.len() > store.max_size {
            store.evict_oldest();
            evicted += 1;
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.ring.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.read().await.ring.is_empty()
    }

    pub async fn capacity(&self) -> usize {
        self.store.read().await.max_size
    }
}
