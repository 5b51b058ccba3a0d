///! DX spots
///!
///! Turning cluster lines into spots and keeping a bounded, indexed history
///! of them in memory.

pub mod band;
pub mod codec;
pub mod parser;
pub mod cache;
pub mod pipeline;

pub use band::band_for_khz;
pub use cache::{EnrichmentTarget, SpotCache};
pub use codec::LineBuffer;
pub use parser::{local_spot, parse_spot};
pub use pipeline::SpotPipeline;
