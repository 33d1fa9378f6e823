/// Candidate lattice: seeding, pruning and level-wise expansion
///
/// The lattice owns the attribute vector of the current layer. Validation
/// feedback prunes the referenced lists in place; `generate_next_layer`
/// re-derives the next layer's attributes from the surviving pairs.

use crate::config::{DiscoveryConfig, DuplicateHandling, NullHandling};
use crate::lattice::PindList;
use crate::metadata::{Attribute, AttributeId, Combination, Relation, RelationId};
use fxhash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Attribute occurrences of one distinct value across all relations
pub type ValueGroup = FxHashMap<AttributeId, u64>;

/// Tolerance for `(1 - threshold) * size` landing just below an integer
const CAP_EPSILON: f64 = 1e-9;

/// Layer-1 survivors: relation -> dependent column -> referenced (relation, column)
type UnaryIndex = FxHashMap<RelationId, BTreeMap<usize, Vec<(RelationId, usize)>>>;

pub struct Lattice {
    threshold: f64,
    duplicate_handling: DuplicateHandling,
    null_handling: NullHandling,
    layer: usize,
    attributes: Vec<Attribute>,
    unary: Option<UnaryIndex>,
}

impl Lattice {
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            threshold: config.threshold,
            duplicate_handling: config.duplicate_handling,
            null_handling: config.null_handling,
            layer: 0,
            attributes: Vec::new(),
            unary: None,
        }
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut [Attribute] {
        &mut self.attributes
    }

    pub fn is_active(&self, id: AttributeId) -> bool {
        self.attributes
            .get(id)
            .map_or(false, |attribute| attribute.is_active_dependent())
    }

    /// Seed layer 1: every column references every other column
    pub fn load_unary(&mut self, relations: &[Relation]) {
        let total: usize = relations.iter().map(|r| r.width()).sum();
        let mut attributes = Vec::with_capacity(total);
        for relation in relations {
            for column in 0..relation.width() {
                let id = relation.offset + column;
                let mut attribute = Attribute::new(id, relation.id, vec![column]);
                attribute.referenced = Some(PindList::seeded(0..total, id));
                attributes.push(attribute);
            }
        }
        debug_assert!(attributes.iter().enumerate().all(|(i, a)| a.id == i));
        self.attributes = attributes;
        self.layer = 1;
        self.unary = None;
    }

    /// Number of open (dependent, referenced) pairs
    pub fn candidate_count(&self) -> usize {
        self.attributes
            .iter()
            .filter_map(|a| a.referenced.as_ref())
            .map(|list| list.len())
            .sum()
    }

    /// Relations owning at least one attribute of the current layer
    pub fn relations_in_use(&self) -> BTreeSet<RelationId> {
        self.attributes.iter().map(|a| a.relation_id).collect()
    }

    fn dependent_size(&self, attribute: &Attribute) -> u64 {
        let metadata = &attribute.metadata;
        let base = match self.duplicate_handling {
            DuplicateHandling::Aware => metadata.total_occurrences + metadata.global_unique_skips,
            DuplicateHandling::Unaware => metadata.distinct_values,
        };
        match self.null_handling {
            NullHandling::Inequality => base + metadata.null_count,
            _ => base,
        }
    }

    /// Violation budget of a dependent with `size` occurrences
    pub fn violation_cap(&self, size: u64) -> u64 {
        ((1.0 - self.threshold) * size as f64 + CAP_EPSILON).floor() as u64
    }

    /// Reset every cap from the statistics gathered in this layer
    pub fn calculate_violations(&mut self) {
        let caps: Vec<u64> = self
            .attributes
            .iter()
            .map(|a| self.violation_cap(self.dependent_size(a)))
            .collect();
        for (attribute, cap) in self.attributes.iter_mut().zip(caps) {
            if let Some(list) = attribute.referenced.as_mut() {
                list.set_caps(cap);
            }
        }
    }

    /// Apply the null-handling policy once per layer
    pub fn prune_null(&mut self) {
        match self.null_handling {
            NullHandling::Subset | NullHandling::Equality => {}
            NullHandling::Foreign => {
                let has_nulls: Vec<bool> = self
                    .attributes
                    .iter()
                    .map(|a| a.metadata.null_count > 0)
                    .collect();
                for attribute in &mut self.attributes {
                    if let Some(list) = attribute.referenced.as_mut() {
                        list.scan(|entry| !has_nulls[entry.referenced]);
                    }
                }
            }
            NullHandling::Inequality => {
                for attribute in &mut self.attributes {
                    let nulls = attribute.metadata.null_count;
                    if nulls == 0 {
                        continue;
                    }
                    if let Some(list) = attribute.referenced.as_mut() {
                        list.violate_all(nulls);
                    }
                }
            }
        }
    }

    /// Charge occurrences skipped as globally unique; they can match nothing
    pub fn prune_global_unique(&mut self) {
        for attribute in &mut self.attributes {
            let skipped = attribute.metadata.global_unique_skips;
            if skipped == 0 {
                continue;
            }
            if let Some(list) = attribute.referenced.as_mut() {
                list.violate_all(skipped);
            }
        }
    }

    /// Prune with one value group: every referenced attribute missing from the
    /// group accrues the dependent's occurrences of the value
    pub fn prune(&mut self, group: &ValueGroup) {
        for (&dependent, &occurrences) in group {
            let charge = match self.duplicate_handling {
                DuplicateHandling::Aware => occurrences,
                DuplicateHandling::Unaware => 1,
            };
            if let Some(list) = self
                .attributes
                .get_mut(dependent)
                .and_then(|a| a.referenced.as_mut())
            {
                list.violate_missing(charge, |referenced| group.contains_key(&referenced));
            }
        }
    }

    /// Dependents without any referenced candidate are dead
    pub fn clean_candidates(&mut self) {
        for attribute in &mut self.attributes {
            if attribute.referenced.as_ref().map_or(false, |list| list.is_empty()) {
                attribute.referenced = None;
            }
        }
    }

    fn build_unary_index(&self) -> UnaryIndex {
        let mut index = UnaryIndex::default();
        for attribute in &self.attributes {
            let Some(list) = attribute.referenced.as_ref() else {
                continue;
            };
            if list.is_empty() {
                continue;
            }
            let referenced = list
                .referenced_ids()
                .map(|id| {
                    let target = &self.attributes[id];
                    (target.relation_id, target.columns[0])
                })
                .collect();
            index
                .entry(attribute.relation_id)
                .or_default()
                .insert(attribute.columns[0], referenced);
        }
        index
    }

    /// Expand the surviving pairs of layer k into the candidates of layer k+1.
    /// Returns false when the next layer is empty.
    pub fn generate_next_layer(&mut self) -> bool {
        if self.layer == 1 {
            self.unary = Some(self.build_unary_index());
        }
        let Some(unary) = self.unary.as_ref() else {
            return false;
        };

        let current_pairs: FxHashSet<(Combination, Combination)> = if self.layer > 1 {
            self.attributes
                .iter()
                .filter_map(|a| a.referenced.as_ref().map(|list| (a, list)))
                .flat_map(|(a, list)| {
                    list.referenced_ids()
                        .map(|id| (a.combination(), self.attributes[id].combination()))
                        .collect::<Vec<_>>()
                })
                .collect()
        } else {
            FxHashSet::default()
        };

        let mut interned: FxHashMap<Combination, AttributeId> = FxHashMap::default();
        let mut combinations: Vec<Combination> = Vec::new();
        let mut candidates: BTreeMap<AttributeId, Vec<AttributeId>> = BTreeMap::new();
        let mut seen_pairs: FxHashSet<(AttributeId, AttributeId)> = FxHashSet::default();

        for dependent in &self.attributes {
            let Some(list) = dependent.referenced.as_ref() else {
                continue;
            };
            let Some(extensions) = unary.get(&dependent.relation_id) else {
                continue;
            };
            let Some(&max_column) = dependent.columns.iter().max() else {
                continue;
            };
            let dependent_combination = dependent.combination();

            for (&x, survivors) in extensions.range(max_column + 1..) {
                for referenced_id in list.referenced_ids() {
                    let referenced = &self.attributes[referenced_id];
                    let same_relation = referenced.relation_id == dependent.relation_id;
                    if same_relation && referenced.columns.contains(&x) {
                        continue;
                    }
                    for &(y_relation, y) in survivors {
                        if y_relation != referenced.relation_id || referenced.columns.contains(&y) {
                            continue;
                        }
                        if same_relation && (x == y || dependent.columns.contains(&y)) {
                            continue;
                        }

                        let next_dependent = dependent_combination.with(x);
                        let next_referenced = referenced.combination().with(y);
                        if self.layer > 1 {
                            let projections_survived = (0..next_dependent.columns.len()).all(|p| {
                                current_pairs.contains(&(
                                    next_dependent.without(p),
                                    next_referenced.without(p),
                                ))
                            });
                            if !projections_survived {
                                continue;
                            }
                        }

                        let dependent_id = intern(next_dependent, &mut interned, &mut combinations);
                        let referenced_next_id =
                            intern(next_referenced, &mut interned, &mut combinations);
                        if seen_pairs.insert((dependent_id, referenced_next_id)) {
                            candidates.entry(dependent_id).or_default().push(referenced_next_id);
                        }
                    }
                }
            }
        }

        let mut next: Vec<Attribute> = combinations
            .into_iter()
            .enumerate()
            .map(|(id, combination)| Attribute::new(id, combination.relation_id, combination.columns))
            .collect();
        for (dependent, referenced) in candidates {
            let mut list = PindList::new();
            for id in referenced {
                list.add(id);
            }
            next[dependent].referenced = Some(list);
        }

        self.layer += 1;
        self.attributes = next;
        debug!(
            layer = self.layer,
            attributes = self.attributes.len(),
            candidates = self.candidate_count(),
            "Generated next layer"
        );
        !self.attributes.is_empty()
    }
}

/// Dense id of `combination`, assigned on first sight
fn intern(
    combination: Combination,
    interned: &mut FxHashMap<Combination, AttributeId>,
    combinations: &mut Vec<Combination>,
) -> AttributeId {
    if let Some(&id) = interned.get(&combination) {
        return id;
    }
    let id = combinations.len();
    interned.insert(combination.clone(), id);
    combinations.push(combination);
    id
}
