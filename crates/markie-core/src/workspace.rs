//! The workspace: the current file-system snapshot, the active file pointer and
//! the store they are saved to. Every committed change is saved; a failed
//! save is logged and the in-memory state stays authoritative.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::FsError;
use crate::fs_store::{default_workspace, FileSystemMap};
use crate::persistence::{PersistedWorkspace, WorkspaceStore};
use crate::types::*;

/// What happened to one assistant file-system action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Created {
        id: NodeId,
        kind: NodeKind,
        name: String,
    },
    CreateRejected {
        kind: NodeKind,
        name: String,
        error: FsError,
    },
    /// Deletion needs the user's confirmation; nothing was removed yet.
    DeleteProposed { node_id: NodeId, node_name: String },
    DeleteTargetMissing { node_id: NodeId },
    Opened { file_id: NodeId },
    OpenFailed { file_id: NodeId },
    ReadRequested {
        file_id: NodeId,
        name: String,
        content: String,
    },
    ReadFailed { label: String },
}

impl ActionOutcome {
    /// User-facing notice for this outcome, if any.
    pub fn notification(&self) -> Option<Notification> {
        use NotificationKind::*;
        let n = match self {
            ActionOutcome::Created { kind, name, .. } => {
                Notification::new(Success, format!("Markie created {kind} \"{name}\"."))
            }
            ActionOutcome::CreateRejected {
                kind,
                name,
                error: FsError::NameConflict { .. },
            } => Notification::new(
                Error,
                format!("Error: A {kind} named \"{name}\" already exists here."),
            ),
            ActionOutcome::CreateRejected { kind, name, error } => Notification::new(
                Error,
                format!("Error: Markie couldn't create {kind} \"{name}\": {error}"),
            ),
            ActionOutcome::DeleteProposed { node_name, .. } => Notification::new(
                Warning,
                format!("Markie proposes deleting \"{node_name}\". Please confirm."),
            ),
            ActionOutcome::DeleteTargetMissing { .. } => Notification::new(
                Warning,
                "Markie proposed deleting an item that no longer exists.",
            ),
            ActionOutcome::Opened { .. } => return None,
            ActionOutcome::OpenFailed { .. } => Notification::new(
                Warning,
                "Markie tried to open a file, but it couldn't be found.",
            ),
            ActionOutcome::ReadRequested { name, .. } => Notification::new(
                Info,
                format!("Markie is reading \"{name}\" to answer your query."),
            ),
            ActionOutcome::ReadFailed { label } => Notification::new(
                Error,
                format!(
                    "Error: Markie tried to read \"{label}\", but it's not a valid file or couldn't be found."
                ),
            ),
        };
        Some(n)
    }

    /// Whether the file tree changed.
    pub fn changed_tree(&self) -> bool {
        matches!(self, ActionOutcome::Created { .. })
    }
}

pub struct Workspace {
    map: FileSystemMap,
    active_file_id: Option<NodeId>,
    store: Arc<dyn WorkspaceStore>,
    load_failed: bool,
}

impl Workspace {
    /// Load the saved workspace. Missing, empty or unreadable data falls back
    /// to the default workspace, which is saved right away.
    pub async fn load(store: Arc<dyn WorkspaceStore>) -> Self {
        let (saved, load_failed) = match store.load().await {
            Ok(saved) => (saved.filter(|ws| !ws.fs_map.is_empty()), false),
            Err(e) => {
                error!("Failed to load workspace, starting fresh: {:#}", e);
                (None, true)
            }
        };

        let mut workspace = match saved {
            Some(ws) => Self {
                map: ws.fs_map,
                active_file_id: ws.last_active_file_id,
                store,
                load_failed,
            },
            None => {
                info!("No saved workspace, creating the default one");
                let (map, welcome_id) = default_workspace();
                let workspace = Self {
                    map,
                    active_file_id: Some(welcome_id),
                    store,
                    load_failed,
                };
                workspace.persist().await;
                workspace
            }
        };

        let valid = workspace
            .active_file_id
            .as_deref()
            .is_some_and(|id| workspace.map.file(id).is_some());
        if !valid {
            workspace.active_file_id = workspace.map.first_file().map(|n| n.id.clone());
            debug!("Active file reset to {:?}", workspace.active_file_id);
        }
        workspace
    }

    /// True when saved data existed but could not be read, so the default
    /// workspace replaced it.
    pub fn load_failed(&self) -> bool {
        self.load_failed
    }

    pub fn map(&self) -> &FileSystemMap {
        &self.map
    }

    pub fn active_file_id(&self) -> Option<&str> {
        self.active_file_id.as_deref()
    }

    pub fn active_file(&self) -> Option<&Node> {
        self.active_file_id.as_deref().and_then(|id| self.map.file(id))
    }

    /// Content of the active file, empty when none is open.
    pub fn active_content(&self) -> &str {
        self.active_file().and_then(Node::content).unwrap_or("")
    }

    pub fn snapshot(&self) -> PersistedWorkspace {
        PersistedWorkspace {
            fs_map: self.map.clone(),
            last_active_file_id: self.active_file_id.clone(),
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.store.save(&self.snapshot()).await {
            error!("Failed to save workspace: {:#}", e);
        }
    }

    async fn commit(&mut self, map: FileSystemMap) {
        self.map = map;
        self.persist().await;
    }

    // ── User operations ──

    pub async fn create_node(
        &mut self,
        name: &str,
        kind: NodeKind,
        parent_id: Option<&str>,
        initial_content: Option<&str>,
    ) -> Result<NodeId, FsError> {
        let (map, id) = self.map.create_node(name, kind, parent_id, initial_content)?;
        self.commit(map).await;
        Ok(id)
    }

    /// Returns whether anything changed.
    pub async fn rename_node(&mut self, node_id: &str, new_name: &str) -> Result<bool, FsError> {
        let renamed = self.map.rename_node(node_id, new_name)?;
        if renamed.changed {
            self.commit(renamed.map).await;
        }
        Ok(renamed.changed)
    }

    /// Delete a node and its subtree. The active pointer moves to the first
    /// remaining file when its target is removed.
    pub async fn delete_node(&mut self, node_id: &str) -> Vec<NodeId> {
        let deleted = self.map.delete_node(node_id);
        if deleted.removed.is_empty() {
            return deleted.removed;
        }
        self.map = deleted.map;
        let active_removed = self
            .active_file_id
            .as_ref()
            .is_some_and(|id| deleted.removed.contains(id));
        if active_removed {
            self.active_file_id = self.map.first_file().map(|n| n.id.clone());
            info!("Active file deleted, now {:?}", self.active_file_id);
        }
        self.persist().await;
        deleted.removed
    }

    pub async fn toggle_folder(&mut self, folder_id: &str) {
        let map = self.map.toggle_expansion(folder_id);
        if map != self.map {
            self.commit(map).await;
        }
    }

    /// Make `file_id` the active file. Folders and unknown ids are refused.
    pub async fn open_file(&mut self, file_id: &str) -> bool {
        if self.map.file(file_id).is_none() {
            warn!("Cannot open {}: not a file", file_id);
            return false;
        }
        if self.active_file_id.as_deref() != Some(file_id) {
            self.active_file_id = Some(file_id.to_string());
            self.persist().await;
        }
        true
    }

    /// Replace the active file's content. Returns false when no file is open.
    pub async fn update_active_content(&mut self, content: &str) -> bool {
        let Some(id) = self.active_file_id.clone() else {
            return false;
        };
        self.set_file_content(&id, content).await
    }

    pub async fn set_file_content(&mut self, file_id: &str, content: &str) -> bool {
        if self.map.file(file_id).is_none() {
            return false;
        }
        let map = self.map.update_content(file_id, content);
        if map != self.map {
            self.commit(map).await;
        }
        true
    }

    // ── Assistant actions ──

    /// Apply parsed actions in order. Creations commit immediately; a created
    /// file becomes the active file. Deletions are only proposed.
    pub async fn apply_actions(&mut self, actions: &[FsAction]) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::with_capacity(actions.len());
        for action in actions {
            let outcome = match action {
                FsAction::CreateFile {
                    parent_id,
                    file_name,
                    initial_content,
                } => {
                    let result = self
                        .create_node(
                            file_name,
                            NodeKind::File,
                            parent_id.as_deref(),
                            initial_content.as_deref(),
                        )
                        .await;
                    match result {
                        Ok(id) => {
                            self.open_file(&id).await;
                            ActionOutcome::Created {
                                id,
                                kind: NodeKind::File,
                                name: file_name.trim().to_string(),
                            }
                        }
                        Err(error) => ActionOutcome::CreateRejected {
                            kind: NodeKind::File,
                            name: file_name.clone(),
                            error,
                        },
                    }
                }
                FsAction::CreateFolder {
                    parent_id,
                    folder_name,
                } => {
                    match self
                        .create_node(folder_name, NodeKind::Folder, parent_id.as_deref(), None)
                        .await
                    {
                        Ok(id) => ActionOutcome::Created {
                            id,
                            kind: NodeKind::Folder,
                            name: folder_name.trim().to_string(),
                        },
                        Err(error) => ActionOutcome::CreateRejected {
                            kind: NodeKind::Folder,
                            name: folder_name.clone(),
                            error,
                        },
                    }
                }
                FsAction::ProposeDelete { node_id, .. } => match self.map.get(node_id) {
                    Some(node) => ActionOutcome::DeleteProposed {
                        node_id: node_id.clone(),
                        node_name: node.name.clone(),
                    },
                    None => ActionOutcome::DeleteTargetMissing {
                        node_id: node_id.clone(),
                    },
                },
                FsAction::NavigateToFile { file_id } => {
                    if self.open_file(file_id).await {
                        ActionOutcome::Opened {
                            file_id: file_id.clone(),
                        }
                    } else {
                        ActionOutcome::OpenFailed {
                            file_id: file_id.clone(),
                        }
                    }
                }
                FsAction::ReadFileContent { file_id } => match self.map.file(file_id) {
                    Some(node) => ActionOutcome::ReadRequested {
                        file_id: file_id.clone(),
                        name: node.name.clone(),
                        content: node.content().unwrap_or_default().to_string(),
                    },
                    None => ActionOutcome::ReadFailed {
                        label: self
                            .map
                            .get(file_id)
                            .map(|n| n.name.clone())
                            .unwrap_or_else(|| file_id.clone()),
                    },
                },
            };
            debug!("Action {:?} -> {:?}", action, outcome);
            outcomes.push(outcome);
        }
        outcomes
    }
}
