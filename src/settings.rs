use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reconcile::{CategoryId, CategorySet, MappingTable, RemovalPolicy};

/// Administrator settings stored next to the mapping table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub remove_categories_on_block_removal: bool,
    /// With removal on, keep a category that a block still present maps to.
    pub keep_shared_categories: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Settings {
    pub fn removal_policy(&self) -> RemovalPolicy {
        match (self.remove_categories_on_block_removal, self.keep_shared_categories) {
            (false, _) => RemovalPolicy::Keep,
            (true, false) => RemovalPolicy::Orphaned,
            (true, true) => RemovalPolicy::OrphanedExclusive,
        }
    }
}

/// Drop entries that map nothing or have a blank block name.
pub fn sanitize_mappings(mappings: MappingTable) -> MappingTable {
    mappings
        .into_iter()
        .filter_map(|(block, categories)| {
            let block = block.trim().to_string();
            (!block.is_empty() && !categories.is_empty()).then_some((block, categories))
        })
        .collect()
}

/// Parse a mapping table as posted from a settings form:
/// `{"core/table": [5, "7"], "core/embed:youtube": [3]}`.
///
/// Ids may be numbers or numeric strings; anything else in a list is skipped.
pub fn parse_mappings(json: &str) -> Result<MappingTable> {
    let value: Value = serde_json::from_str(json).context("mappings are not valid JSON")?;
    let Value::Object(entries) = value else {
        bail!("mappings must be a JSON object of block name -> category ids");
    };

    let mappings = entries
        .into_iter()
        .map(|(block, ids)| (block, category_ids(&ids)))
        .collect();
    Ok(sanitize_mappings(mappings))
}

fn category_ids(value: &Value) -> CategorySet {
    let Value::Array(items) = value else {
        return CategorySet::new();
    };
    items.iter().filter_map(category_id).collect()
}

fn category_id(value: &Value) -> Option<CategoryId> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
