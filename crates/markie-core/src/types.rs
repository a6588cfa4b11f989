//! Core types: file-system nodes, chat messages, assistant actions, turn state.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

// ── File system ──

/// Opaque node identifier (UUID v4 string for nodes created here).
pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeKind {
    File,
    Folder,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::File => write!(f, "file"),
            NodeKind::Folder => write!(f, "folder"),
        }
    }
}

/// A file or folder entry. Hierarchy lives in `parent_id` / `children_ids`
/// references, never in nested ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<NodeId>,
    #[serde(flatten)]
    pub body: NodeBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum NodeBody {
    #[serde(rename_all = "camelCase")]
    File {
        #[serde(default)]
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    Folder {
        #[serde(default)]
        children_ids: BTreeSet<NodeId>,
        #[serde(default)]
        is_expanded: bool,
    },
}

impl Node {
    pub fn file(id: NodeId, name: &str, parent_id: Option<NodeId>, content: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            parent_id,
            body: NodeBody::File {
                content: content.to_string(),
            },
        }
    }

    pub fn folder(id: NodeId, name: &str, parent_id: Option<NodeId>) -> Self {
        Self {
            id,
            name: name.to_string(),
            parent_id,
            body: NodeBody::Folder {
                children_ids: BTreeSet::new(),
                is_expanded: false,
            },
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self.body {
            NodeBody::File { .. } => NodeKind::File,
            NodeBody::Folder { .. } => NodeKind::Folder,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind() == NodeKind::File
    }

    pub fn is_folder(&self) -> bool {
        self.kind() == NodeKind::Folder
    }

    /// File content, `None` for folders.
    pub fn content(&self) -> Option<&str> {
        match &self.body {
            NodeBody::File { content } => Some(content),
            NodeBody::Folder { .. } => None,
        }
    }

    /// Child ids, `None` for files.
    pub fn children(&self) -> Option<&BTreeSet<NodeId>> {
        match &self.body {
            NodeBody::Folder { children_ids, .. } => Some(children_ids),
            NodeBody::File { .. } => None,
        }
    }

    pub fn is_expanded(&self) -> bool {
        matches!(self.body, NodeBody::Folder { is_expanded: true, .. })
    }
}

// ── Assistant actions ──

/// File-system directive parsed out of assistant text. The owner of the map
/// decides whether and how to apply it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FsAction {
    #[serde(rename_all = "camelCase")]
    CreateFile {
        parent_id: Option<NodeId>,
        file_name: String,
        initial_content: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CreateFolder {
        parent_id: Option<NodeId>,
        folder_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ProposeDelete { node_id: NodeId, node_name: String },
    #[serde(rename_all = "camelCase")]
    NavigateToFile { file_id: NodeId },
    #[serde(rename_all = "camelCase")]
    ReadFileContent { file_id: NodeId },
}

// ── Notifications ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Success,
    Info,
    Warning,
    Error,
}

/// Transient, human-readable notice for the frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub text: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

// ── Chat ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Participant {
    User,
    Assistant,
    Error,
}

/// Web citation attached to an assistant reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingSource {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub participant: Participant,
    pub text: String,
    pub is_streaming: bool,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grounding_sources: Vec<GroundingSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub is_edit_proposal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_doc_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_action_feedback: Vec<String>,
}

impl ChatMessage {
    pub fn new(participant: Participant, text: &str, is_streaming: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            participant,
            text: text.to_string(),
            is_streaming,
            timestamp: chrono::Utc::now().to_rfc3339(),
            grounding_sources: Vec::new(),
            suggestions: Vec::new(),
            is_edit_proposal: false,
            proposed_doc_content: None,
            system_action_feedback: Vec::new(),
        }
    }
}

/// Role of a replayed history turn, as the model provider sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
}

// ── Turn state ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Idle,
    Sending,
    Streaming,
    Finalizing,
    Aborted,
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnState::Idle => write!(f, "idle"),
            TurnState::Sending => write!(f, "sending"),
            TurnState::Streaming => write!(f, "streaming"),
            TurnState::Finalizing => write!(f, "finalizing"),
            TurnState::Aborted => write!(f, "aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_serializes_with_type_tag() {
        let node = Node::file("f1".into(), "a.md", Some("d1".into()), "hi");
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["type"], "FILE");
        assert_eq!(value["parentId"], "d1");
        assert_eq!(value["content"], "hi");
    }

    #[test]
    fn test_folder_defaults_when_fields_missing() {
        let raw = r#"{"id":"d1","name":"Notes","parentId":null,"type":"FOLDER"}"#;
        let node: Node = serde_json::from_str(raw).unwrap();
        assert!(node.is_folder());
        assert!(node.children().unwrap().is_empty());
        assert!(!node.is_expanded());
        assert_eq!(node.parent_id, None);
    }

    #[test]
    fn test_fs_action_wire_shape() {
        let action = FsAction::ProposeDelete {
            node_id: "n1".into(),
            node_name: "Old".into(),
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "PROPOSE_DELETE");
        assert_eq!(value["payload"]["nodeName"], "Old");
    }
}
