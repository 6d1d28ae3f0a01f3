// Similarity pipeline: in-process co-occurrence scoring, store-backed
// compute cycles, and the cache sync that feeds the serving tier.

pub mod computer;
pub mod cooccur;
pub mod sync;
