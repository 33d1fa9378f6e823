/// Relation ingestion: row sources consumed by the chunker
pub mod row_source;

pub use row_source::*;
