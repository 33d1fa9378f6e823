//! # spind
//!
//! External-memory discovery of partial inclusion dependencies (pINDs).
//!
//! For every attribute combination `A` of the given relations, spind finds
//! every combination `B` such that at least `threshold` of `A`'s occurrences
//! also occur in `B`. Relations may be far larger than memory: each layer
//! aggregates chunk files into sorted runs, merges them into one sorted file
//! per relation and validates all candidates in a single streaming pass.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use spind::{DiscoveryConfig, RelationInput, SpindEngine, VecRowSource};
//!
//! let config = DiscoveryConfig {
//!     threshold: 0.9,
//!     ..Default::default()
//! };
//! let engine = SpindEngine::new(config).unwrap();
//! let pinds = engine
//!     .discover(vec![
//!         RelationInput::new("orders", VecRowSource::from_strs(&["customer"], &[&["1"], &["2"]])),
//!         RelationInput::new("customers", VecRowSource::from_strs(&["id"], &[&["1"], &["2"], &["3"]])),
//!     ])
//!     .unwrap();
//!
//! for pind in pinds {
//!     println!("{}", pind);
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod ingestion;
pub mod lattice;
pub mod metadata;
pub mod result_format;
pub mod spill;

// Public API
pub use config::{DiscoveryConfig, DuplicateHandling, NullHandling};
pub use engine::{DiscoveryReport, RelationInput, SpindEngine};
pub use error::{SpindError, SpindResult};
pub use ingestion::{CsvOptions, CsvRowSource, RowSource, VecRowSource};
pub use metadata::{Attribute, AttributeId, AttributeMetadata, Relation, RelationId};
pub use result_format::{CollectingSink, DiscoveredPind, PindSink, TextReportSink};
