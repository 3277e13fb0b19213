use std::collections::HashSet;

use serde_json::Value;

use super::blocks::BlockNode;
use crate::embeds::{embed_identifier, EMBED_BLOCK, PROVIDER_SLUG_ATTR};

/// Collect the distinct block identifiers of a tree, in document (pre-)order.
///
/// Nodes without a name are not emitted but their children are still visited.
/// Walks with an explicit stack, so nesting depth is unbounded.
pub fn extract_block_names(blocks: &[BlockNode]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    let mut stack: Vec<&BlockNode> = blocks.iter().rev().collect();

    while let Some(block) = stack.pop() {
        if let Some(name) = block_identifier(block) {
            if seen.insert(name.clone()) {
                names.push(name);
            }
        }
        stack.extend(block.inner_blocks.iter().rev());
    }

    names
}

/// The identifier a single node contributes: `core/embed:<provider>` for
/// embeds that carry a provider slug, the plain block name otherwise.
pub fn block_identifier(block: &BlockNode) -> Option<String> {
    let name = block.block_name()?;

    if name == EMBED_BLOCK {
        let slug = block
            .attrs
            .get(PROVIDER_SLUG_ATTR)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        if let Some(slug) = slug {
            return Some(embed_identifier(slug));
        }
    }

    Some(name.to_string())
}
