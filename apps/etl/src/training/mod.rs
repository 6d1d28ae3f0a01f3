// Training data extraction: labeled samples out of the analytical store,
// feature snapshots joined on, derived columns, Parquet export.

pub mod derive;
pub mod export;
pub mod features;
pub mod pipeline;
