//! ConversationEvent enum — broadcast from the conversation to web frontends
//! via tokio::broadcast.

use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, GroundingSource, Notification, TurnState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkData {
    pub message_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<GroundingSource>,
}

/// Events broadcast to every subscriber (WebSocket clients, tests).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ConversationEvent {
    /// Turn state changed (idle/sending/streaming/finalizing/aborted)
    #[serde(rename = "state")]
    State(TurnState),

    /// An empty, streaming message was appended
    #[serde(rename = "message_started")]
    MessageStarted(ChatMessage),

    /// Text increment for the in-progress message
    #[serde(rename = "chunk")]
    Chunk(ChunkData),

    /// A message reached its final form (assistant reply, error, info)
    #[serde(rename = "message_finalized")]
    MessageFinalized(ChatMessage),

    /// Transient notice (memory feedback, file-system outcomes)
    #[serde(rename = "notification")]
    Notification(Notification),

    /// Tree, active file or document content changed; clients refetch
    #[serde(rename = "workspace_changed")]
    WorkspaceChanged,
}

impl ConversationEvent {
    /// Serialize to the JSON format the frontend expects:
    /// `{"event": "...", "data": {...}}`
    pub fn to_ws_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
