//! Indented text listing of the file tree, embedded in outbound prompts so
//! the model can refer to nodes by id.
//!
//! ```text
//! My Documents (folder) [ID: 3f2c...]
//!   Drafts (folder, empty) [ID: 9a1b...]
//!   Welcome.md (file) [ID: 77de...]
//! ```

use std::sync::LazyLock;

use tracing::debug;

use crate::fs_store::FileSystemMap;
use crate::types::{NodeId, NodeKind};

/// Recursion bound; nodes deeper than this are replaced by an error line.
pub const MAX_DEPTH: usize = 10;
const INDENT: &str = "  ";

static LINE_RE: LazyLock<regex_lite::Regex> = LazyLock::new(|| {
    regex_lite::Regex::new(r"^( *)(.*) \((file|folder|folder, empty)\) \[ID: ([^\]]+)\]$")
        .expect("tree listing regex")
});

/// Render the whole map, roots sorted folders-first then by name.
pub fn render_tree_listing(map: &FileSystemMap) -> String {
    render_from(map, &map.root_ids())
}

/// Render starting from explicit root ids (ids missing from the map yield an
/// error line rather than being skipped).
pub fn render_from(map: &FileSystemMap, root_ids: &[NodeId]) -> String {
    let mut out = String::new();
    for id in root_ids {
        render_node(map, id, 0, &mut out);
    }
    out.trim().to_string()
}

fn render_node(map: &FileSystemMap, id: &str, depth: usize, out: &mut String) {
    let indent = INDENT.repeat(depth);
    if depth > MAX_DEPTH {
        out.push_str(&format!("{indent}[Error: Max depth reached for node {id}]\n"));
        return;
    }
    let Some(node) = map.get(id) else {
        out.push_str(&format!("{indent}[Error: Node {id} not found in map]\n"));
        return;
    };

    let annotation = match node.children() {
        None => "file",
        Some(children) if children.is_empty() => "folder, empty",
        Some(_) => "folder",
    };
    out.push_str(&format!("{indent}{} ({annotation}) [ID: {}]\n", node.name, node.id));

    for child in map.sorted_children(id) {
        render_node(map, &child.id, depth + 1, out);
    }
}

/// One node line recovered from a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub depth: usize,
    pub name: String,
    pub kind: NodeKind,
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    /// Annotated `folder, empty`.
    pub empty: bool,
}

/// Re-derive node lines and their parent links from a rendered listing.
/// Error lines and anything else unrecognised are skipped.
pub fn parse_tree_listing(text: &str) -> Vec<ListingEntry> {
    let mut entries = Vec::new();
    // Ids of the most recent node at each depth.
    let mut ancestors: Vec<NodeId> = Vec::new();

    for line in text.lines() {
        let Some(caps) = LINE_RE.captures(line) else {
            debug!("Skipping listing line: {}", line);
            continue;
        };
        let depth = caps[1].len() / INDENT.len();
        let (kind, empty) = match &caps[3] {
            "file" => (NodeKind::File, false),
            "folder" => (NodeKind::Folder, false),
            _ => (NodeKind::Folder, true),
        };
        let id = caps[4].to_string();

        ancestors.truncate(depth);
        let parent_id = if depth == 0 { None } else { ancestors.last().cloned() };
        ancestors.push(id.clone());

        entries.push(ListingEntry {
            depth,
            name: caps[2].to_string(),
            kind,
            id,
            parent_id,
            empty,
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileSystemMap {
        let map = FileSystemMap::new();
        let (map, docs) = map.create_node("Docs", NodeKind::Folder, None, None).unwrap();
        let (map, _) = map.create_node("readme.md", NodeKind::File, None, None).unwrap();
        let (map, _) = map.create_node("b.md", NodeKind::File, Some(&docs), None).unwrap();
        let (map, inner) = map.create_node("Inner", NodeKind::Folder, Some(&docs), None).unwrap();
        let (map, _) = map.create_node("Empty", NodeKind::Folder, Some(&inner), None).unwrap();
        let (map, _) = map.create_node("a.md", NodeKind::File, Some(&docs), None).unwrap();
        map
    }

    #[test]
    fn test_render_shape() {
        let map = sample();
        let listing = render_tree_listing(&map);
        let lines: Vec<&str> = listing.lines().collect();

        assert_eq!(lines.len(), 6);
        assert!(lines[0].starts_with("Docs (folder) [ID: "));
        assert!(lines[1].starts_with("  Inner (folder) [ID: "));
        assert!(lines[2].starts_with("    Empty (folder, empty) [ID: "));
        assert!(lines[3].starts_with("  a.md (file) [ID: "));
        assert!(lines[4].starts_with("  b.md (file) [ID: "));
        assert!(lines[5].starts_with("readme.md (file) [ID: "));
        assert!(!listing.ends_with('\n'));
    }

    #[test]
    fn test_round_trip_reproduces_shape() {
        let map = sample();
        let entries = parse_tree_listing(&render_tree_listing(&map));
        assert_eq!(entries.len(), map.len());

        for entry in &entries {
            let node = map.get(&entry.id).unwrap();
            assert_eq!(entry.name, node.name);
            assert_eq!(entry.kind, node.kind());
            assert_eq!(entry.parent_id, node.parent_id);
            assert_eq!(
                entry.empty,
                node.children().is_some_and(|c| c.is_empty())
            );
        }
    }

    #[test]
    fn test_depth_bound_and_missing_root() {
        let mut map = FileSystemMap::new();
        let mut parent: Option<NodeId> = None;
        for i in 0..=MAX_DEPTH + 1 {
            let (next, id) = map
                .create_node(&format!("level{i}"), NodeKind::Folder, parent.as_deref(), None)
                .unwrap();
            map = next;
            parent = Some(id);
        }

        let listing = render_tree_listing(&map);
        let last = listing.lines().last().unwrap();
        assert!(last.trim_start().starts_with("[Error: Max depth reached for node "));
        assert_eq!(listing.lines().count(), MAX_DEPTH + 2);

        let listing = render_from(&map, &["ghost".to_string()]);
        assert_eq!(listing, "[Error: Node ghost not found in map]");
    }

    #[test]
    fn test_empty_map_renders_empty() {
        assert_eq!(render_tree_listing(&FileSystemMap::new()), "");
        assert!(parse_tree_listing("").is_empty());
    }
}
