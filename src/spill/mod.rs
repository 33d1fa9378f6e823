// Spill-to-disk pipeline: chunk and run formats, aggregation, k-way merge
pub mod agg_spill;
pub mod format;
pub mod sort_spill;

pub use agg_spill::*;
pub use format::*;
pub use sort_spill::*;
