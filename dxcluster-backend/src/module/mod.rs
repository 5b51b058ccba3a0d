pub mod cluster;
pub mod enrichment;
pub mod scheduled;
pub mod spot;
