//! Modification tag - explicit (guid, index) causality marker per entity.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Causality marker carried by every route entity.
///
/// The guid is chosen once at entity creation and never changes; the index
/// is 0 on create and increments on each successful update. Consumers may
/// only compare indexes of tags sharing a guid - a delete-and-recreate
/// produces a fresh guid and the two histories are not ordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationTag {
    pub guid: String,
    pub index: u32,
}

impl ModificationTag {
    /// A fresh tag for a newly created entity.
    pub fn fresh() -> Self {
        Self {
            guid: Uuid::new_v4().to_string(),
            index: 0,
        }
    }

    /// Bump the index after a successful update.
    pub fn increment(&mut self) {
        self.index += 1;
    }

    /// Returns true if `other` supersedes this tag.
    ///
    /// Only meaningful when both tags share a guid; across guids the
    /// ordering is undefined and this returns false.
    pub fn succeeded_by(&self, other: &ModificationTag) -> bool {
        self.guid == other.guid && other.index > self.index
    }
}

impl Default for ModificationTag {
    fn default() -> Self {
        Self::fresh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_tag_starts_at_zero() {
        let tag = ModificationTag::fresh();
        assert_eq!(tag.index, 0);
        assert!(!tag.guid.is_empty());
    }

    #[test]
    fn test_increment() {
        let mut tag = ModificationTag::fresh();
        let guid = tag.guid.clone();
        tag.increment();
        tag.increment();
        assert_eq!(tag.index, 2);
        assert_eq!(tag.guid, guid);
    }

    #[test]
    fn test_succeeded_by_same_guid() {
        let older = ModificationTag::fresh();
        let mut newer = older.clone();
        newer.increment();

        assert!(older.succeeded_by(&newer));
        assert!(!newer.succeeded_by(&older));
        assert!(!older.succeeded_by(&older));
    }

    #[test]
    fn test_different_guids_never_supersede() {
        let a = ModificationTag::fresh();
        let mut b = ModificationTag::fresh();
        b.index = 100;

        assert!(!a.succeeded_by(&b));
        assert!(!b.succeeded_by(&a));
    }
}
