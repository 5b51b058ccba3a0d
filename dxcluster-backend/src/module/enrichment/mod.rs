///! Callsign enrichment
///!
///! Looks up DXCC entity, CQ zone and LoTW membership for spotted callsigns
///! through an external lookup service, memoizing results and bounding how
///! hard that service gets hit.

pub mod client;
pub mod cache;
pub mod pool;

pub use client::{HttpLookupClient, LookupClient};
pub use cache::{EnrichmentCache, EnrichmentCounters, FreshnessPolicy};
pub use pool::EnrichmentPool;
