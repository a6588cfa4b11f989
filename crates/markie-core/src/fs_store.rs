//! Virtual file system store.
//!
//! A single id-keyed table owns every node; parent/child relations are plain
//! id references. Every operation takes `&self` and returns a fresh map, so
//! the caller decides when a new snapshot becomes current and when it is
//! persisted.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::FsError;
use crate::types::{Node, NodeBody, NodeId, NodeKind};

const WELCOME_TEMPLATE: &str = include_str!("../assets/welcome.md");
const DEFAULT_FOLDER_NAME: &str = "My Documents";
const DEFAULT_FILE_NAME: &str = "Welcome.md";

/// id → Node. Roots are nodes whose `parent_id` is `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileSystemMap(BTreeMap<NodeId, Node>);

/// Result of [`FileSystemMap::rename_node`].
#[derive(Debug, Clone)]
pub struct Renamed {
    pub map: FileSystemMap,
    pub changed: bool,
}

/// Result of [`FileSystemMap::delete_node`]. `removed` lists the target first,
/// then its descendants depth-first.
#[derive(Debug, Clone)]
pub struct Deleted {
    pub map: FileSystemMap,
    pub removed: Vec<NodeId>,
}

/// A broken structural invariant found by [`FileSystemMap::check_integrity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityIssue {
    DanglingParent { node: NodeId, parent: NodeId },
    ParentNotFolder { node: NodeId, parent: NodeId },
    MissingChildLink { folder: NodeId, child: NodeId },
    StrayChildLink { folder: NodeId, child: NodeId },
    DuplicateSiblingName { parent: Option<NodeId>, name: String },
    Cycle { node: NodeId },
}

impl std::fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DanglingParent { node, parent } => {
                write!(f, "node {node} points at missing parent {parent}")
            }
            Self::ParentNotFolder { node, parent } => {
                write!(f, "node {node} points at non-folder parent {parent}")
            }
            Self::MissingChildLink { folder, child } => {
                write!(f, "folder {folder} does not list child {child}")
            }
            Self::StrayChildLink { folder, child } => {
                write!(f, "folder {folder} lists {child} which does not point back")
            }
            Self::DuplicateSiblingName { parent, name } => write!(
                f,
                "duplicate sibling name {name:?} under {}",
                parent.as_deref().unwrap_or("root")
            ),
            Self::Cycle { node } => write!(f, "node {node} is part of a parent cycle"),
        }
    }
}

fn new_id() -> NodeId {
    uuid::Uuid::new_v4().to_string()
}

/// Folders before files, then by name (case-insensitive, exact as tiebreak).
fn sort_key(node: &Node) -> (bool, String, &str) {
    (node.is_file(), node.name.to_lowercase(), node.name.as_str())
}

impl FileSystemMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from nodes as-is. No linking or validation happens here;
    /// run [`repair`](Self::repair) on untrusted input.
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        Self(nodes.into_iter().map(|n| (n.id.clone(), n)).collect())
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.0.get(id)
    }

    /// The node if it exists and is a file.
    pub fn file(&self, id: &str) -> Option<&Node> {
        self.0.get(id).filter(|n| n.is_file())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.0.values()
    }

    // ── Mutations (copy-on-write) ──

    /// Insert a new node. Rejects blank names, unknown or non-folder parents
    /// and case-insensitive sibling conflicts without touching the map.
    pub fn create_node(
        &self,
        name: &str,
        kind: NodeKind,
        parent_id: Option<&str>,
        initial_content: Option<&str>,
    ) -> Result<(Self, NodeId), FsError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(FsError::EmptyName);
        }
        if name.chars().any(char::is_control) {
            return Err(FsError::InvalidName);
        }
        if let Some(pid) = parent_id {
            match self.0.get(pid) {
                None => return Err(FsError::ParentNotFound(pid.to_string())),
                Some(parent) if !parent.is_folder() => {
                    return Err(FsError::ParentNotFolder(pid.to_string()))
                }
                Some(_) => {}
            }
        }
        if let Some(existing) = self.find_sibling_conflict(parent_id, name, None) {
            return Err(FsError::NameConflict {
                name: existing.name.clone(),
                kind: existing.kind(),
            });
        }

        let id = new_id();
        let parent = parent_id.map(String::from);
        let node = match kind {
            NodeKind::File => Node::file(id.clone(), name, parent, initial_content.unwrap_or("")),
            NodeKind::Folder => Node::folder(id.clone(), name, parent),
        };

        let mut next = self.clone();
        next.0.insert(id.clone(), node);
        if let Some(pid) = parent_id {
            next.link_child(pid, &id);
        }
        debug!("Created {} '{}' ({})", kind, name, id);
        Ok((next, id))
    }

    /// Replace a file's content. Anything other than a file is a logged no-op.
    pub fn update_content(&self, file_id: &str, content: &str) -> Self {
        let mut next = self.clone();
        match next.0.get_mut(file_id).map(|n| &mut n.body) {
            Some(NodeBody::File { content: current }) => *current = content.to_string(),
            _ => warn!("update_content: {} is not a file", file_id),
        }
        next
    }

    /// Flip a folder's `is_expanded`. No-op for anything else.
    pub fn toggle_expansion(&self, folder_id: &str) -> Self {
        let mut next = self.clone();
        if let Some(NodeBody::Folder { is_expanded, .. }) =
            next.0.get_mut(folder_id).map(|n| &mut n.body)
        {
            *is_expanded = !*is_expanded;
        }
        next
    }

    /// Rename in place. Renaming to the current name is a successful no-op.
    pub fn rename_node(&self, node_id: &str, new_name: &str) -> Result<Renamed, FsError> {
        let node = self
            .0
            .get(node_id)
            .ok_or_else(|| FsError::NotFound(node_id.to_string()))?;
        let name = new_name.trim();
        if name.is_empty() {
            return Err(FsError::EmptyName);
        }
        if name.chars().any(char::is_control) {
            return Err(FsError::InvalidName);
        }
        if name == node.name {
            return Ok(Renamed {
                map: self.clone(),
                changed: false,
            });
        }
        if let Some(other) =
            self.find_sibling_conflict(node.parent_id.as_deref(), name, Some(node_id))
        {
            return Err(FsError::NameConflict {
                name: other.name.clone(),
                kind: other.kind(),
            });
        }

        let mut next = self.clone();
        if let Some(n) = next.0.get_mut(node_id) {
            n.name = name.to_string();
        }
        Ok(Renamed {
            map: next,
            changed: true,
        })
    }

    /// Remove a node. Folders take their whole subtree with them.
    pub fn delete_node(&self, node_id: &str) -> Deleted {
        let Some(node) = self.0.get(node_id) else {
            warn!("delete_node: {} not found", node_id);
            return Deleted {
                map: self.clone(),
                removed: Vec::new(),
            };
        };

        let mut removed = vec![node_id.to_string()];
        if node.is_folder() {
            removed.extend(self.descendants(node_id));
        }

        let mut next = self.clone();
        for id in &removed {
            next.0.remove(id);
        }
        if let Some(pid) = &node.parent_id {
            next.unlink_child(pid, node_id);
        }

        // Strip any child reference that no longer resolves.
        let live: HashSet<NodeId> = next.0.keys().cloned().collect();
        for n in next.0.values_mut() {
            if let NodeBody::Folder { children_ids, .. } = &mut n.body {
                children_ids.retain(|c| live.contains(c));
            }
        }

        debug!("Deleted {} node(s) rooted at {}", removed.len(), node_id);
        Deleted { map: next, removed }
    }

    fn link_child(&mut self, folder_id: &str, child_id: &str) {
        if let Some(NodeBody::Folder { children_ids, .. }) =
            self.0.get_mut(folder_id).map(|n| &mut n.body)
        {
            children_ids.insert(child_id.to_string());
        }
    }

    fn unlink_child(&mut self, folder_id: &str, child_id: &str) {
        if let Some(NodeBody::Folder { children_ids, .. }) =
            self.0.get_mut(folder_id).map(|n| &mut n.body)
        {
            children_ids.remove(child_id);
        }
    }

    // ── Queries ──

    pub fn sorted_roots(&self) -> Vec<&Node> {
        let mut roots: Vec<&Node> = self.0.values().filter(|n| n.parent_id.is_none()).collect();
        roots.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        roots
    }

    pub fn root_ids(&self) -> Vec<NodeId> {
        self.sorted_roots().into_iter().map(|n| n.id.clone()).collect()
    }

    /// Children of a folder that resolve to nodes, folders first then name.
    pub fn sorted_children(&self, folder_id: &str) -> Vec<&Node> {
        let Some(children) = self.0.get(folder_id).and_then(Node::children) else {
            return Vec::new();
        };
        let mut nodes: Vec<&Node> = children.iter().filter_map(|c| self.0.get(c)).collect();
        nodes.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        nodes
    }

    /// A sibling under `parent_id` whose name matches case-insensitively,
    /// ignoring `exclude`.
    pub fn find_sibling_conflict(
        &self,
        parent_id: Option<&str>,
        name: &str,
        exclude: Option<&str>,
    ) -> Option<&Node> {
        let wanted = name.trim().to_lowercase();
        self.0.values().find(|n| {
            n.parent_id.as_deref() == parent_id
                && Some(n.id.as_str()) != exclude
                && n.name.to_lowercase() == wanted
        })
    }

    /// First file in display order (depth-first over the sorted tree).
    pub fn first_file(&self) -> Option<&Node> {
        let mut stack: Vec<&Node> = self.sorted_roots().into_iter().rev().collect();
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if !seen.insert(node.id.as_str()) {
                continue;
            }
            if node.is_file() {
                return Some(node);
            }
            stack.extend(self.sorted_children(&node.id).into_iter().rev());
        }
        None
    }

    /// Transitive descendants of `id`, depth-first, excluding `id` itself.
    pub fn descendants(&self, id: &str) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut seen = HashSet::from([id.to_string()]);
        self.collect_descendants(id, &mut out, &mut seen);
        out
    }

    fn collect_descendants(&self, id: &str, out: &mut Vec<NodeId>, seen: &mut HashSet<NodeId>) {
        let Some(children) = self.0.get(id).and_then(Node::children) else {
            return;
        };
        for child in children {
            if self.0.contains_key(child) && seen.insert(child.clone()) {
                out.push(child.clone());
                self.collect_descendants(child, out, seen);
            }
        }
    }

    fn in_cycle(&self, id: &str) -> bool {
        let mut current = self.0.get(id).and_then(|n| n.parent_id.as_deref());
        for _ in 0..self.0.len() {
            match current {
                None => return false,
                Some(pid) if pid == id => return true,
                Some(pid) => current = self.0.get(pid).and_then(|n| n.parent_id.as_deref()),
            }
        }
        current.is_some()
    }

    /// Every structural invariant violation in the map. Empty means healthy.
    pub fn check_integrity(&self) -> Vec<IntegrityIssue> {
        let mut issues = Vec::new();
        let mut names: HashMap<(Option<&str>, String), usize> = HashMap::new();

        for node in self.0.values() {
            *names
                .entry((node.parent_id.as_deref(), node.name.to_lowercase()))
                .or_default() += 1;

            if let Some(pid) = &node.parent_id {
                match self.0.get(pid) {
                    None => issues.push(IntegrityIssue::DanglingParent {
                        node: node.id.clone(),
                        parent: pid.clone(),
                    }),
                    Some(parent) => match parent.children() {
                        None => issues.push(IntegrityIssue::ParentNotFolder {
                            node: node.id.clone(),
                            parent: pid.clone(),
                        }),
                        Some(children) if !children.contains(&node.id) => {
                            issues.push(IntegrityIssue::MissingChildLink {
                                folder: pid.clone(),
                                child: node.id.clone(),
                            })
                        }
                        Some(_) => {}
                    },
                }
                if self.in_cycle(&node.id) {
                    issues.push(IntegrityIssue::Cycle {
                        node: node.id.clone(),
                    });
                }
            }

            if let Some(children) = node.children() {
                for child in children {
                    let points_back = self
                        .0
                        .get(child)
                        .is_some_and(|c| c.parent_id.as_deref() == Some(node.id.as_str()));
                    if !points_back {
                        issues.push(IntegrityIssue::StrayChildLink {
                            folder: node.id.clone(),
                            child: child.clone(),
                        });
                    }
                }
            }
        }

        for ((parent, name), count) in names {
            if count > 1 {
                issues.push(IntegrityIssue::DuplicateSiblingName {
                    parent: parent.map(String::from),
                    name,
                });
            }
        }
        issues
    }

    /// Self-heal a map loaded from untrusted storage: re-root nodes whose
    /// parent is missing, not a folder or part of a cycle, then rebuild every
    /// folder's `children_ids` from the `parent_id` references.
    pub fn repair(&self) -> Self {
        let issues = self.check_integrity();
        if issues.is_empty() {
            return self.clone();
        }
        for issue in &issues {
            warn!("File system integrity: {}", issue);
        }

        let mut next = self.clone();
        let ids: Vec<NodeId> = next.0.keys().cloned().collect();
        for id in &ids {
            let parent_ok = match next.0.get(id).and_then(|n| n.parent_id.as_deref()) {
                None => true,
                Some(pid) => next.0.get(pid).is_some_and(Node::is_folder),
            };
            if !parent_ok {
                if let Some(n) = next.0.get_mut(id) {
                    n.parent_id = None;
                }
            }
        }
        for id in &ids {
            if next.in_cycle(id) {
                if let Some(n) = next.0.get_mut(id) {
                    n.parent_id = None;
                }
            }
        }

        // Re-rooting can put same-named nodes side by side. The first by id
        // keeps its name; later ones get a numbered suffix.
        let existing: HashSet<(Option<NodeId>, String)> = next
            .0
            .values()
            .map(|n| (n.parent_id.clone(), n.name.to_lowercase()))
            .collect();
        let mut taken: HashSet<(Option<NodeId>, String)> = HashSet::new();
        let mut renames = Vec::new();
        for node in next.0.values() {
            let parent = node.parent_id.clone();
            if taken.insert((parent.clone(), node.name.to_lowercase())) {
                continue;
            }
            let (stem, ext) = split_extension(&node.name, node.is_file());
            let unique = (2..).map(|n| format!("{stem} ({n}){ext}")).find(|candidate| {
                let key = (parent.clone(), candidate.to_lowercase());
                !taken.contains(&key) && !existing.contains(&key)
            });
            if let Some(name) = unique {
                taken.insert((parent, name.to_lowercase()));
                renames.push((node.id.clone(), name));
            }
        }
        for (id, name) in renames {
            if let Some(n) = next.0.get_mut(&id) {
                warn!("Renamed duplicate '{}' ({}) to '{}'", n.name, id, name);
                n.name = name;
            }
        }

        let links: Vec<(NodeId, NodeId)> = next
            .0
            .values()
            .filter_map(|n| n.parent_id.clone().map(|p| (p, n.id.clone())))
            .collect();
        for n in next.0.values_mut() {
            if let NodeBody::Folder { children_ids, .. } = &mut n.body {
                children_ids.clear();
            }
        }
        for (parent, child) in links {
            next.link_child(&parent, &child);
        }
        next
    }
}

/// `("notes", ".md")` for files with an extension, `(name, "")` otherwise.
fn split_extension(name: &str, is_file: bool) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) if is_file && i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    }
}

/// Fresh workspace: an expanded "My Documents" folder holding "Welcome.md".
/// Returns the map and the welcome file's id.
pub fn default_workspace() -> (FileSystemMap, NodeId) {
    let folder_id = new_id();
    let file_id = new_id();

    let mut folder = Node::folder(folder_id.clone(), DEFAULT_FOLDER_NAME, None);
    if let NodeBody::Folder {
        children_ids,
        is_expanded,
    } = &mut folder.body
    {
        children_ids.insert(file_id.clone());
        *is_expanded = true;
    }

    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let content = WELCOME_TEMPLATE.replace("{date}", &today);
    let welcome = Node::file(file_id.clone(), DEFAULT_FILE_NAME, Some(folder_id), &content);

    (FileSystemMap::from_nodes([folder, welcome]), file_id)
}
