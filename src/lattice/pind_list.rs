/// Open referenced candidates of one dependent attribute
///
/// The dominant access pattern is "walk once, conditionally drop", so the
/// list is a plain vector compacted in place by `retain_mut` during the scan.

use crate::metadata::AttributeId;

/// One (dependent, referenced) candidate with its violation bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PindEntry {
    pub referenced: AttributeId,
    /// Largest number of violations the candidate tolerates
    pub violation_cap: u64,
    /// Violations accrued so far in the current layer; never decreases
    pub violations: u64,
}

impl PindEntry {
    pub fn new(referenced: AttributeId) -> Self {
        Self {
            referenced,
            violation_cap: 0,
            violations: 0,
        }
    }

    /// Accrue violations; returns whether the candidate is still valid
    pub fn violate(&mut self, occurrences: u64) -> bool {
        self.violations = self.violations.saturating_add(occurrences);
        self.is_valid()
    }

    pub fn is_valid(&self) -> bool {
        self.violations <= self.violation_cap
    }
}

#[derive(Debug, Clone, Default)]
pub struct PindList {
    entries: Vec<PindEntry>,
}

impl PindList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with every id of `referenced` except `except`
    pub fn seeded(referenced: impl IntoIterator<Item = AttributeId>, except: AttributeId) -> Self {
        Self {
            entries: referenced
                .into_iter()
                .filter(|&id| id != except)
                .map(PindEntry::new)
                .collect(),
        }
    }

    pub fn add(&mut self, referenced: AttributeId) {
        self.entries.push(PindEntry::new(referenced));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PindEntry> {
        self.entries.iter()
    }

    pub fn referenced_ids(&self) -> impl Iterator<Item = AttributeId> + '_ {
        self.entries.iter().map(|entry| entry.referenced)
    }

    pub fn contains(&self, referenced: AttributeId) -> bool {
        self.entries.iter().any(|entry| entry.referenced == referenced)
    }

    /// Set the cap of every entry; accrued violations are kept
    pub fn set_caps(&mut self, cap: u64) {
        for entry in &mut self.entries {
            entry.violation_cap = cap;
        }
    }

    /// Single pass over the list; entries for which `keep` returns false are removed
    pub fn scan(&mut self, keep: impl FnMut(&mut PindEntry) -> bool) {
        self.entries.retain_mut(keep);
    }

    /// Charge `occurrences` to every entry whose referenced attribute fails `present`
    pub fn violate_missing(&mut self, occurrences: u64, present: impl Fn(AttributeId) -> bool) {
        self.scan(|entry| present(entry.referenced) || entry.violate(occurrences));
    }

    /// Charge `occurrences` to every entry
    pub fn violate_all(&mut self, occurrences: u64) {
        self.scan(|entry| entry.violate(occurrences));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_list_skips_self() {
        let list = PindList::seeded(0..4, 2);
        assert_eq!(list.referenced_ids().collect::<Vec<_>>(), vec![0, 1, 3]);
    }

    #[test]
    fn test_entry_removed_only_when_cap_exceeded() {
        let mut list = PindList::seeded([1, 2], 0);
        list.set_caps(2);

        list.violate_missing(2, |id| id == 2);
        assert_eq!(list.len(), 2, "two violations are within a cap of two");

        list.violate_missing(1, |id| id == 2);
        assert_eq!(list.referenced_ids().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_violations_accumulate_across_cap_updates() {
        let mut list = PindList::seeded([1], 0);
        list.set_caps(5);
        list.violate_all(3);
        list.set_caps(4);
        let entry = list.iter().next().unwrap();
        assert_eq!(entry.violations, 3);
        assert!(entry.is_valid());

        list.violate_all(2);
        assert!(list.is_empty());
    }

    #[test]
    fn test_removed_entries_do_not_reappear() {
        let mut list = PindList::seeded([1, 2, 3], 0);
        list.violate_missing(1, |id| id != 2);
        assert!(!list.contains(2));
        list.violate_missing(0, |_| false);
        assert!(!list.contains(2));
        assert_eq!(list.len(), 2);
    }
}
