use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;

pub type CategoryId = u64;
pub type CategorySet = BTreeSet<CategoryId>;

/// Block identifier → categories assigned when that block is present.
pub type MappingTable = BTreeMap<String, CategorySet>;

/// What to do with categories of mapped blocks that are no longer in the post.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RemovalPolicy {
    /// Never remove anything; assignment is purely additive.
    #[default]
    Keep,
    /// Remove every category mapped from an absent block, even if a block
    /// still present maps to the same category.
    Orphaned,
    /// Like `Orphaned`, but a category still reachable from a present block stays.
    OrphanedExclusive,
}

impl From<bool> for RemovalPolicy {
    fn from(removal_enabled: bool) -> Self {
        if removal_enabled {
            RemovalPolicy::Orphaned
        } else {
            RemovalPolicy::Keep
        }
    }
}

/// Compute the category set a post should carry.
///
/// `removal_enabled == true` is `RemovalPolicy::Orphaned`: a category mapped
/// from both a present and an absent block is dropped.
pub fn reconcile(
    extracted: &[String],
    mapping: &MappingTable,
    current: &CategorySet,
    removal_enabled: bool,
) -> CategorySet {
    reconcile_with_policy(extracted, mapping, current, RemovalPolicy::from(removal_enabled))
}

pub fn reconcile_with_policy(
    extracted: &[String],
    mapping: &MappingTable,
    current: &CategorySet,
    policy: RemovalPolicy,
) -> CategorySet {
    let present: HashSet<&str> = extracted.iter().map(String::as_str).collect();

    let to_add = mapped_categories(mapping, |block| present.contains(block));
    let mut result: CategorySet = current.union(&to_add).copied().collect();

    if policy == RemovalPolicy::Keep {
        return result;
    }

    let mut orphaned = mapped_categories(mapping, |block| !present.contains(block));
    if policy == RemovalPolicy::OrphanedExclusive {
        orphaned.retain(|id| !to_add.contains(id));
    }
    result.retain(|id| !orphaned.contains(id));
    result
}

fn mapped_categories<F>(mapping: &MappingTable, mut include: F) -> CategorySet
where
    F: FnMut(&str) -> bool,
{
    mapping
        .iter()
        .filter(|(block, _)| include(block.as_str()))
        .flat_map(|(_, categories)| categories.iter().copied())
        .collect()
}

/// Categories gained and lost between two assignments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryDiff {
    pub added: Vec<CategoryId>,
    pub removed: Vec<CategoryId>,
}

impl CategoryDiff {
    pub fn between(before: &CategorySet, after: &CategorySet) -> Self {
        CategoryDiff {
            added: after.difference(before).copied().collect(),
            removed: before.difference(after).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
