///! Data shared between the cluster backend and whatever serves it over HTTP.

pub mod types;

pub use types::{Band, ConnectionState, EnrichmentResult, Spot, SpotSource, StatsSnapshot};
