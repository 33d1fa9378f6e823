/// Attribute combinations and their per-layer statistics

use crate::lattice::PindList;
use serde::{Deserialize, Serialize};

/// Dense per-layer attribute id
pub type AttributeId = usize;

/// Position of a relation in the job's relation list
pub type RelationId = usize;

/// Statistics gathered for one attribute during a layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMetadata {
    /// Non-null occurrences written to the relation file
    pub total_occurrences: u64,
    /// Distinct non-null values written to the relation file
    pub distinct_values: u64,
    /// Rows where at least one column of the combination was null
    pub null_count: u64,
    /// Rows skipped because a column value was proven globally unique
    pub global_unique_skips: u64,
}

impl AttributeMetadata {
    pub fn merge(&mut self, other: &AttributeMetadata) {
        self.total_occurrences += other.total_occurrences;
        self.distinct_values += other.distinct_values;
        self.null_count += other.null_count;
        self.global_unique_skips += other.global_unique_skips;
    }
}

/// A column combination of one relation
#[derive(Debug, Clone)]
pub struct Attribute {
    pub id: AttributeId,
    pub relation_id: RelationId,
    /// Column indices; ascending for combinations created as dependents
    pub columns: Vec<usize>,
    pub metadata: AttributeMetadata,
    /// Open referenced candidates; `None` once the attribute is no viable dependent
    pub referenced: Option<PindList>,
}

impl Attribute {
    pub fn new(id: AttributeId, relation_id: RelationId, columns: Vec<usize>) -> Self {
        Self {
            id,
            relation_id,
            columns,
            metadata: AttributeMetadata::default(),
            referenced: None,
        }
    }

    /// Whether the attribute still has open referenced candidates
    pub fn is_active_dependent(&self) -> bool {
        self.referenced.as_ref().map_or(false, |list| !list.is_empty())
    }

    /// Structural identity used to de-duplicate combinations across candidates
    pub fn combination(&self) -> Combination {
        Combination {
            relation_id: self.relation_id,
            columns: self.columns.clone(),
        }
    }
}

/// (relation, ordered columns) identity of an attribute combination
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Combination {
    pub relation_id: RelationId,
    pub columns: Vec<usize>,
}

impl Combination {
    pub fn new(relation_id: RelationId, columns: Vec<usize>) -> Self {
        Self { relation_id, columns }
    }

    /// The combination with position `position` removed
    pub fn without(&self, position: usize) -> Combination {
        let mut columns = self.columns.clone();
        columns.remove(position);
        Combination::new(self.relation_id, columns)
    }

    /// The combination extended by one trailing column
    pub fn with(&self, column: usize) -> Combination {
        let mut columns = Vec::with_capacity(self.columns.len() + 1);
        columns.extend_from_slice(&self.columns);
        columns.push(column);
        Combination::new(self.relation_id, columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combination_projection_and_extension() {
        let combination = Combination::new(2, vec![0, 3, 5]);
        assert_eq!(combination.without(1), Combination::new(2, vec![0, 5]));
        assert_eq!(combination.with(7).columns, vec![0, 3, 5, 7]);
    }

    #[test]
    fn test_metadata_merge_adds_counters() {
        let mut metadata = AttributeMetadata {
            null_count: 1,
            ..Default::default()
        };
        metadata.merge(&AttributeMetadata {
            total_occurrences: 4,
            distinct_values: 2,
            null_count: 2,
            global_unique_skips: 3,
        });
        assert_eq!(metadata.null_count, 3);
        assert_eq!(metadata.total_occurrences, 4);
        assert_eq!(metadata.global_unique_skips, 3);
    }
}
