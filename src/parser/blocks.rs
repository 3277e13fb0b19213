use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::{Match, Regex};
use serde::Deserialize;
use serde_json::{Map, Value};

// <!-- wp:ns/name {"attrs":1} -->, <!-- wp:name /-->, <!-- /wp:name -->
static DELIMITER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<!--\s+(?P<closer>/)?wp:(?P<namespace>[a-z][a-z0-9_-]*/)?(?P<name>[a-z][a-z0-9_-]*)\s+(?P<attrs>\{.*?\}\s+)?(?P<void>/)?-->",
    )
    .unwrap()
});

const DEFAULT_NAMESPACE: &str = "core/";

// Keys of a node in the JSON tree shape.
const NAME_KEY: &str = "blockName";
const ATTRS_KEY: &str = "attrs";
const CHILDREN_KEY: &str = "innerBlocks";
const HTML_KEY: &str = "innerHTML";

/// One node of a parsed post. `name` is `None` for freeform HTML between blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockNode {
    pub name: Option<String>,
    pub attrs: Map<String, Value>,
    pub inner_blocks: Vec<BlockNode>,
    pub inner_html: String,
}

// Unlinks children onto a heap stack so freeing a deep tree never recurses.
impl Drop for BlockNode {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.inner_blocks);
        while let Some(mut block) = pending.pop() {
            pending.append(&mut block.inner_blocks);
        }
    }
}

impl BlockNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self::named(Some(name.into()))
    }

    pub fn named(name: Option<String>) -> Self {
        let mut block = BlockNode::default();
        block.name = name;
        block
    }

    pub fn freeform(html: impl Into<String>) -> Self {
        let mut block = BlockNode::default();
        block.inner_html = html.into();
        block
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    pub fn with_children(mut self, children: Vec<BlockNode>) -> Self {
        self.inner_blocks = children;
        self
    }

    /// The block name, or `None` when the node is not a block (absent or empty name).
    pub fn block_name(&self) -> Option<&str> {
        self.name.as_deref().filter(|n| !n.is_empty())
    }
}

/// Parse serialized post content into a block tree.
///
/// Never fails: invalid attribute JSON becomes empty attributes, a closer with
/// nothing open is dropped, and blocks left open at the end are closed implicitly.
pub fn parse_blocks(content: &str) -> Vec<BlockNode> {
    let mut output = Vec::new();
    let mut open: Vec<BlockNode> = Vec::new();
    let mut cursor = 0;

    for caps in DELIMITER_RE.captures_iter(content) {
        let Some(delimiter) = caps.get(0) else {
            continue;
        };
        push_html(&content[cursor..delimiter.start()], &mut open, &mut output);
        cursor = delimiter.end();

        if caps.name("closer").is_some() {
            if let Some(block) = open.pop() {
                attach(block, &mut open, &mut output);
            }
            continue;
        }

        let mut block = BlockNode::new(full_name(caps.name("namespace"), &caps["name"]));
        block.attrs = parse_attrs(caps.name("attrs"));

        if caps.name("void").is_some() {
            attach(block, &mut open, &mut output);
        } else {
            open.push(block);
        }
    }

    push_html(&content[cursor..], &mut open, &mut output);
    while let Some(block) = open.pop() {
        attach(block, &mut open, &mut output);
    }

    output
}

/// Parse an already-parsed tree given as a JSON array of nodes
/// (`blockName` / `attrs` / `innerBlocks` / `innerHTML`).
///
/// Only invalid JSON or a non-array top level is an error. Malformed nodes and
/// fields degrade to empty, and nesting depth is not limited.
pub fn parse_blocks_json(json: &str) -> Result<Vec<BlockNode>> {
    let value = {
        let mut de = serde_json::Deserializer::from_str(json);
        de.disable_recursion_limit();
        let value = Value::deserialize(serde_stacker::Deserializer::new(&mut de))
            .context("block tree is not valid JSON")?;
        de.end().context("block tree is not valid JSON")?;
        value
    };
    let Value::Array(items) = value else {
        bail!("block tree must be a JSON array of nodes");
    };
    Ok(nodes_from_values(items))
}

fn full_name(namespace: Option<Match<'_>>, name: &str) -> String {
    let namespace = namespace.map_or(DEFAULT_NAMESPACE, |m| m.as_str());
    format!("{}{}", namespace, name)
}

fn parse_attrs(raw: Option<Match<'_>>) -> Map<String, Value> {
    raw.and_then(|m| serde_json::from_str::<Value>(m.as_str().trim()).ok())
        .and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default()
}

fn attach(block: BlockNode, open: &mut [BlockNode], output: &mut Vec<BlockNode>) {
    match open.last_mut() {
        Some(parent) => parent.inner_blocks.push(block),
        None => output.push(block),
    }
}

fn push_html(html: &str, open: &mut [BlockNode], output: &mut Vec<BlockNode>) {
    if html.is_empty() {
        return;
    }
    match open.last_mut() {
        Some(parent) => parent.inner_html.push_str(html),
        None if !html.trim().is_empty() => output.push(BlockNode::freeform(html)),
        None => {}
    }
}

// Builds the tree with an explicit stack of (node, unvisited children). Each
// JSON node is taken apart as it is visited, so nothing deep is left to drop.
fn nodes_from_values(items: Vec<Value>) -> Vec<BlockNode> {
    let mut output = Vec::new();
    let mut top = items.into_iter();
    let mut stack: Vec<(BlockNode, std::vec::IntoIter<Value>)> = Vec::new();

    loop {
        let next = match stack.last_mut() {
            Some((_, pending)) => pending.next(),
            None => top.next(),
        };
        if let Some(item) = next {
            let (block, children) = shallow_node(item);
            stack.push((block, children.into_iter()));
            continue;
        }
        let Some((block, _)) = stack.pop() else {
            break;
        };
        match stack.last_mut() {
            Some((parent, _)) => parent.inner_blocks.push(block),
            None => output.push(block),
        }
    }

    output
}

// Malformed fields degrade to empty.
fn shallow_node(item: Value) -> (BlockNode, Vec<Value>) {
    let Value::Object(mut fields) = item else {
        return (BlockNode::default(), Vec::new());
    };
    let children = match fields.remove(CHILDREN_KEY) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };

    let mut block = BlockNode::named(match fields.remove(NAME_KEY) {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    });
    if let Some(Value::Object(attrs)) = fields.remove(ATTRS_KEY) {
        block.attrs = attrs;
    }
    if let Some(Value::String(html)) = fields.remove(HTML_KEY) {
        block.inner_html = html;
    }

    (block, children)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(blocks: &[BlockNode]) -> Vec<Option<&str>> {
        blocks.iter().map(|b| b.block_name()).collect()
    }

    #[test]
    fn empty_content() {
        assert!(parse_blocks("").is_empty());
        assert!(parse_blocks("\n\n  \n").is_empty());
    }

    #[test]
    fn single_block_with_attrs() {
        let blocks = parse_blocks(
            "<!-- wp:heading {\"level\":3} -->\n<h3>Hi</h3>\n<!-- /wp:heading -->",
        );
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].block_name(), Some("core/heading"));
        assert_eq!(blocks[0].attrs.get("level"), Some(&Value::from(3)));
        assert_eq!(blocks[0].inner_html.trim(), "<h3>Hi</h3>");
    }

    #[test]
    fn namespaced_and_void_blocks() {
        let blocks = parse_blocks("<!-- wp:acme/pricing-table {\"plan\":\"pro\"} /-->\n<!-- wp:separator /-->");
        assert_eq!(names(&blocks), vec![Some("acme/pricing-table"), Some("core/separator")]);
        assert!(blocks[1].attrs.is_empty());
    }

    #[test]
    fn nested_attrs_object() {
        let blocks = parse_blocks("<!-- wp:image {\"style\":{\"border\":{\"radius\":\"4px\"}}} /-->");
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].attrs.get("style").is_some_and(Value::is_object));
    }

    #[test]
    fn nested_blocks() {
        let md = "<!-- wp:group -->\n<div>\n<!-- wp:columns -->\n<!-- wp:column -->\n<!-- wp:list -->\n<ul><li>x</li></ul>\n<!-- /wp:list -->\n<!-- /wp:column -->\n<!-- /wp:columns -->\n</div>\n<!-- /wp:group -->";
        let blocks = parse_blocks(md);
        assert_eq!(blocks.len(), 1);
        let columns = &blocks[0].inner_blocks[0];
        assert_eq!(columns.block_name(), Some("core/columns"));
        let list = &columns.inner_blocks[0].inner_blocks[0];
        assert_eq!(list.block_name(), Some("core/list"));
        assert!(list.inner_html.contains("<li>x</li>"));
    }

    #[test]
    fn freeform_between_blocks() {
        let blocks = parse_blocks("<p>classic</p>\n<!-- wp:separator /-->\ntrailing text");
        assert_eq!(names(&blocks), vec![None, Some("core/separator"), None]);
        assert_eq!(blocks[0].inner_html, "<p>classic</p>\n");
    }

    #[test]
    fn invalid_attrs_degrade_to_empty() {
        let blocks = parse_blocks("<!-- wp:embed {not json} /-->");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].block_name(), Some("core/embed"));
        assert!(blocks[0].attrs.is_empty());
    }

    #[test]
    fn stray_closer_and_unclosed_opener() {
        let blocks = parse_blocks("<!-- /wp:paragraph -->\n<!-- wp:quote -->\n<!-- wp:paragraph -->\n<p>q</p>");
        assert_eq!(names(&blocks), vec![Some("core/quote")]);
        assert_eq!(blocks[0].inner_blocks[0].block_name(), Some("core/paragraph"));
    }

    #[test]
    fn json_tree_with_malformed_fields() {
        let json = r#"[
            {"blockName": null, "attrs": [], "innerBlocks": [
                {"blockName": "core/list", "attrs": {}, "innerBlocks": [], "innerHTML": ""}
            ], "innerHTML": "\n"},
            {"blockName": 42, "innerBlocks": "oops"},
            "not a node"
        ]"#;
        let blocks = parse_blocks_json(json).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].block_name(), None);
        assert!(blocks[0].attrs.is_empty());
        assert_eq!(blocks[0].inner_blocks[0].block_name(), Some("core/list"));
        assert_eq!(blocks[1], BlockNode::default());
        assert_eq!(blocks[2], BlockNode::default());
    }

    #[test]
    fn json_tree_must_be_array() {
        assert!(parse_blocks_json("{\"blockName\": \"core/list\"}").is_err());
        assert!(parse_blocks_json("[] trailing").is_err());
    }

    #[test]
    fn json_tree_has_no_depth_limit() {
        let depth = 10_000;
        let open = r#"{"blockName":"core/group","innerBlocks":["#;
        let json = format!(
            "[{}{{\"blockName\":\"core/list\"}}{}]",
            open.repeat(depth),
            "]}".repeat(depth)
        );
        let blocks = parse_blocks_json(&json).unwrap();
        assert_eq!(blocks.len(), 1);

        let mut block = &blocks[0];
        let mut levels = 0;
        while let Some(child) = block.inner_blocks.first() {
            assert_eq!(block.block_name(), Some("core/group"));
            block = child;
            levels += 1;
        }
        assert_eq!(levels, depth);
        assert_eq!(block.block_name(), Some("core/list"));
    }

    #[test]
    fn deeply_nested_content_parses_and_drops() {
        let depth = 200_000;
        let content = "<!-- wp:group -->".repeat(depth) + "<!-- wp:list /-->";
        let blocks = parse_blocks(&content);
        assert_eq!(blocks.len(), 1);
        drop(blocks);
    }

    #[test]
    fn recipe_fixture() {
        let content = std::fs::read_to_string("tests/fixtures/recipe.html").unwrap();
        let blocks = parse_blocks(&content);
        assert_eq!(
            names(&blocks),
            vec![
                Some("core/heading"),
                Some("core/paragraph"),
                Some("core/table"),
                Some("core/group"),
                Some("core/embed"),
            ]
        );
        let group = &blocks[3];
        assert_eq!(group.inner_blocks.len(), 2);
        assert_eq!(blocks[4].attrs.get("providerNameSlug"), Some(&Value::from("youtube")));
    }

    #[test]
    fn classic_fixture_is_freeform() {
        let content = std::fs::read_to_string("tests/fixtures/classic.html").unwrap();
        let blocks = parse_blocks(&content);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].block_name(), None);
    }
}
