//! Plates of interest
//!
//! Plate strings are normalized (uppercase, alphanumerics only) on both
//! insertion and lookup, so formatting differences between jurisdictions and
//! camera firmware never cause a missed match.

use parking_lot::RwLock;
use std::collections::HashSet;

/// Normalize a plate for comparison
pub fn normalize(plate: &str) -> String {
    plate
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Set of plates flagged for operator attention
pub struct WatchList {
    plates: RwLock<HashSet<String>>,
}

impl WatchList {
    pub fn new(plates: impl IntoIterator<Item = String>) -> Self {
        Self {
            plates: RwLock::new(plates.into_iter().map(|p| normalize(&p)).collect()),
        }
    }

    /// Whether a detected plate is on the list
    pub fn matches(&self, plate: &str) -> bool {
        self.plates.read().contains(&normalize(plate))
    }

    pub fn add(&self, plate: &str) {
        self.plates.write().insert(normalize(plate));
    }

    pub fn remove(&self, plate: &str) -> bool {
        self.plates.write().remove(&normalize(plate))
    }

    pub fn len(&self) -> usize {
        self.plates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plates.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_ignores_formatting() {
        assert_eq!(normalize("ab-123 cd"), "AB123CD");
        assert_eq!(normalize("AB123CD"), "AB123CD");
        assert_eq!(normalize("  ab 123·cd "), "AB123CD");
    }

    #[test]
    fn test_match_is_format_insensitive() {
        let list = WatchList::new(["ab-123-cd".to_string()]);
        assert!(list.matches("AB123CD"));
        assert!(list.matches("ab 123 cd"));
        assert!(!list.matches("AB123CE"));
    }

    #[test]
    fn test_add_and_remove() {
        let list = WatchList::new([]);
        assert!(list.is_empty());
        list.add("XY 987 Z");
        assert!(list.matches("xy987z"));
        assert!(list.remove("XY-987-Z"));
        assert!(!list.matches("xy987z"));
    }
}
