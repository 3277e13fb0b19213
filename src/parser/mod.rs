pub mod blocks;
pub mod names;

/// Two-pass pipeline: post content → block tree → distinct block identifiers.
pub fn block_names_in(content: &str) -> Vec<String> {
    let blocks = blocks::parse_blocks(content);
    names::extract_block_names(&blocks)
}
