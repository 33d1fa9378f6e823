/// Metadata of relations and attribute combinations
///
/// Relations are fixed for the whole job; attributes are rebuilt every layer.

pub mod attribute;
pub mod relation;

pub use attribute::{Attribute, AttributeId, AttributeMetadata, Combination, RelationId};
pub use relation::Relation;
