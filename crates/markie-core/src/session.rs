//! Editor session — ties the workspace to the conversation.
//!
//! Assistant turns run through [`EditorSession::submit`], which applies the
//! parsed file-system actions, parks deletion proposals until the user
//! answers, and feeds requested files back to the model. Document edit
//! proposals are applied or discarded from here, with one level of undo.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::conversation::{Conversation, OutboundMessage, TurnContext, TurnOutcome, TurnStatus};
use crate::error::{ConversationError, FsError};
use crate::events::ConversationEvent;
use crate::persistence::WorkspaceStore;
use crate::preferences::PreferencesStore;
use crate::prompts::read_file_reprompt;
use crate::providers::TextSource;
use crate::types::*;
use crate::workspace::{ActionOutcome, Workspace};

/// Consecutive read-file follow-ups allowed for one submission.
pub const MAX_READ_REPROMPTS: usize = 3;

const LOAD_FAILED_NOTICE: &str = "Error loading file system. Using default.";

const DISCARD_NOTE: &str =
    "[Document edit proposal discarded. You can ask Markie to try again if needed.]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDelete {
    pub node_id: NodeId,
    pub node_name: String,
}

#[derive(Debug, Clone)]
struct UndoSnapshot {
    file_id: NodeId,
    content: String,
}

pub struct EditorSession {
    workspace: Workspace,
    conversation: Conversation,
    undo: Option<UndoSnapshot>,
    pending_delete: Option<PendingDelete>,
    startup_notices: Vec<Notification>,
}

impl EditorSession {
    pub fn new(workspace: Workspace, conversation: Conversation) -> Self {
        let mut startup_notices = Vec::new();
        if workspace.load_failed() {
            startup_notices.push(Notification::new(NotificationKind::Error, LOAD_FAILED_NOTICE));
        }
        for notice in &startup_notices {
            conversation.broadcast(ConversationEvent::Notification(notice.clone()));
        }
        Self {
            workspace,
            conversation,
            undo: None,
            pending_delete: None,
            startup_notices,
        }
    }

    /// Load the workspace first, then the conversation.
    pub async fn load(
        workspace_store: Arc<dyn WorkspaceStore>,
        preferences: Arc<dyn PreferencesStore>,
        source: Option<Arc<dyn TextSource>>,
    ) -> Self {
        let workspace = Workspace::load(workspace_store).await;
        let conversation = Conversation::load(source, preferences).await;
        Self::new(workspace, conversation)
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.conversation.subscribe()
    }

    pub fn pending_delete(&self) -> Option<&PendingDelete> {
        self.pending_delete.as_ref()
    }

    pub fn can_undo(&self) -> bool {
        self.undo.is_some()
    }

    /// Notices raised while loading, kept for clients that connect later.
    pub fn startup_notices(&self) -> &[Notification] {
        &self.startup_notices
    }

    fn notify(&self, kind: NotificationKind, text: impl Into<String>) {
        self.conversation.notify(kind, text);
    }

    fn workspace_changed(&mut self, tree_changed: bool) {
        if tree_changed {
            self.conversation.mark_stale();
        }
        self.conversation.broadcast(ConversationEvent::WorkspaceChanged);
    }

    // ── Assistant turns ──

    /// Run one user submission to completion, including any read-file
    /// follow-ups the model asks for. Returns the outcome of the last turn.
    pub async fn submit(
        &mut self,
        outbound: OutboundMessage,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, ConversationError> {
        let mut outbound = outbound;
        let mut reprompts = 0;

        loop {
            let context = TurnContext {
                document: self.workspace.active_content(),
                map: self.workspace.map(),
            };
            let outcome = self.conversation.send(outbound, &context, cancel).await?;

            let results = self.workspace.apply_actions(&outcome.actions).await;
            let will_reprompt = outcome.status == TurnStatus::Completed && !cancel.is_cancelled();
            let mut read_request = None;
            let mut tree_changed = false;
            for result in &results {
                let announces_read = matches!(result, ActionOutcome::ReadRequested { .. });
                if announces_read && !will_reprompt {
                    continue;
                }
                if let Some(n) = result.notification() {
                    self.conversation
                        .broadcast(ConversationEvent::Notification(n));
                }
                tree_changed |= result.changed_tree();
                match result {
                    ActionOutcome::DeleteProposed { node_id, node_name } => {
                        self.pending_delete = Some(PendingDelete {
                            node_id: node_id.clone(),
                            node_name: node_name.clone(),
                        });
                    }
                    ActionOutcome::ReadRequested { name, content, .. } if read_request.is_none() => {
                        read_request = Some((name.clone(), content.clone()));
                    }
                    _ => {}
                }
            }
            if !results.is_empty() {
                self.workspace_changed(tree_changed);
            }

            let Some((name, content)) = read_request else {
                return Ok(outcome);
            };
            if reprompts >= MAX_READ_REPROMPTS {
                warn!("Read-file chain stopped after {} follow-ups", reprompts);
                self.notify(
                    NotificationKind::Warning,
                    "Markie asked to read files too many times in a row. Stopping here.",
                );
                return Ok(outcome);
            }

            reprompts += 1;
            info!("Re-prompting with content of '{}' ({}/{})", name, reprompts, MAX_READ_REPROMPTS);
            let prompt = read_file_reprompt(self.conversation.last_user_query(), &name, &content);
            outbound = OutboundMessage::InternalReprompt(prompt);
        }
    }

    /// Delete the node the assistant proposed. Returns the removed ids.
    pub async fn confirm_delete(&mut self) -> Option<Vec<NodeId>> {
        let pending = self.pending_delete.take()?;
        let removed = self.workspace.delete_node(&pending.node_id).await;
        if removed.is_empty() {
            self.notify(
                NotificationKind::Warning,
                format!("\"{}\" no longer exists.", pending.node_name),
            );
        } else {
            self.notify(
                NotificationKind::Success,
                format!("Deleted \"{}\".", pending.node_name),
            );
            self.workspace_changed(true);
        }
        Some(removed)
    }

    pub fn cancel_delete(&mut self) -> Option<PendingDelete> {
        let pending = self.pending_delete.take()?;
        self.notify(
            NotificationKind::Info,
            format!("Kept \"{}\".", pending.node_name),
        );
        Some(pending)
    }

    // ── Document proposals and undo ──

    /// Replace the active document with a proposal's content.
    pub async fn apply_proposal(&mut self, message_id: &str) -> bool {
        let Some(file) = self.workspace.active_file() else {
            self.notify(NotificationKind::Error, "No active file to apply changes to.");
            return false;
        };
        let file_id = file.id.clone();
        let previous = file.content().unwrap_or_default().to_string();

        let Some(document) = self.conversation.close_proposal(message_id) else {
            warn!("No open proposal on message {}", message_id);
            return false;
        };
        self.undo = Some(UndoSnapshot {
            file_id: file_id.clone(),
            content: previous,
        });
        self.workspace.set_file_content(&file_id, &document).await;
        self.notify(
            NotificationKind::Success,
            "Markie's suggested document update has been applied.",
        );
        self.workspace_changed(false);
        true
    }

    pub fn discard_proposal(&mut self, message_id: &str) -> bool {
        if self.conversation.close_proposal(message_id).is_none() {
            return false;
        }
        self.conversation.push_info(DISCARD_NOTE);
        true
    }

    /// Empty the active document, keeping its content for undo.
    pub async fn clear_document(&mut self) -> bool {
        let Some(file) = self.workspace.active_file() else {
            self.notify(NotificationKind::Error, "No active file to clear.");
            return false;
        };
        let file_id = file.id.clone();
        let name = file.name.clone();
        let previous = file.content().unwrap_or_default().to_string();

        self.undo = Some(UndoSnapshot {
            file_id: file_id.clone(),
            content: previous,
        });
        self.workspace.set_file_content(&file_id, "").await;
        self.notify(
            NotificationKind::Info,
            format!("Content of \"{name}\" cleared. You can undo."),
        );
        self.workspace_changed(false);
        true
    }

    /// Restore the document saved by the last apply or clear.
    pub async fn undo(&mut self) -> bool {
        let Some(snapshot) = self.undo.take() else {
            return false;
        };
        if !self
            .workspace
            .set_file_content(&snapshot.file_id, &snapshot.content)
            .await
        {
            self.notify(NotificationKind::Warning, "The file to undo no longer exists.");
            return false;
        }
        self.notify(NotificationKind::Info, "Last action has been undone.");
        self.workspace_changed(false);
        true
    }

    // ── User file-system operations ──

    pub async fn create_node(
        &mut self,
        name: &str,
        kind: NodeKind,
        parent_id: Option<&str>,
    ) -> Result<NodeId, FsError> {
        let id = self.workspace.create_node(name, kind, parent_id, None).await?;
        if kind == NodeKind::File {
            self.workspace.open_file(&id).await;
        }
        self.workspace_changed(true);
        Ok(id)
    }

    pub async fn rename_node(&mut self, node_id: &str, new_name: &str) -> Result<bool, FsError> {
        let changed = self.workspace.rename_node(node_id, new_name).await?;
        if changed {
            self.notify(
                NotificationKind::Success,
                format!("Renamed to \"{}\".", new_name.trim()),
            );
            self.workspace_changed(true);
        }
        Ok(changed)
    }

    pub async fn delete_node(&mut self, node_id: &str) -> Result<Vec<NodeId>, FsError> {
        let removed = self.workspace.delete_node(node_id).await;
        if removed.is_empty() {
            return Err(FsError::NotFound(node_id.to_string()));
        }
        if self
            .pending_delete
            .as_ref()
            .is_some_and(|p| removed.contains(&p.node_id))
        {
            self.pending_delete = None;
        }
        self.workspace_changed(true);
        Ok(removed)
    }

    pub async fn toggle_folder(&mut self, folder_id: &str) {
        self.workspace.toggle_folder(folder_id).await;
        self.workspace_changed(false);
    }

    pub async fn open_file(&mut self, file_id: &str) -> Result<(), FsError> {
        if !self.workspace.open_file(file_id).await {
            return Err(FsError::NotFound(file_id.to_string()));
        }
        self.workspace_changed(false);
        Ok(())
    }

    /// Editor typing. Returns false when no file is open.
    pub async fn update_document(&mut self, content: &str) -> bool {
        self.workspace.update_active_content(content).await
    }

    pub async fn clear_chat(&mut self, forget_facts: bool) {
        self.conversation.clear_chat(forget_facts).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryWorkspaceStore;
    use crate::preferences::MemoryPreferencesStore;
    use crate::protocol::{EDIT_END_MARKER, EDIT_START_MARKER};
    use crate::providers::scripted::{Reply, ScriptedSource};
    use crate::providers::StreamChunk;

    async fn workspace() -> Workspace {
        Workspace::load(Arc::new(MemoryWorkspaceStore::default())).await
    }

    async fn session(ws: Workspace, replies: Vec<Reply>) -> (EditorSession, Arc<ScriptedSource>) {
        let source = ScriptedSource::new(replies);
        let conversation = Conversation::load(
            Some(source.clone()),
            Arc::new(MemoryPreferencesStore::default()),
        )
        .await;
        (EditorSession::new(ws, conversation), source)
    }

    fn notifications(rx: &mut broadcast::Receiver<ConversationEvent>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ConversationEvent::Notification(n) = event {
                out.push(n);
            }
        }
        out
    }

    fn user(text: &str) -> OutboundMessage {
        OutboundMessage::User(text.to_string())
    }

    #[tokio::test]
    async fn test_read_file_reprompts_with_original_query() {
        let mut ws = workspace().await;
        let notes = ws
            .create_node("notes.md", NodeKind::File, None, Some("alpha beta"))
            .await
            .unwrap();
        let (mut session, source) = session(
            ws,
            vec![
                Reply::text(&format!("Let me look. [MK_FS_READ_FILE_CONTENT::{notes}]")),
                Reply::text("It says alpha beta."),
            ],
        )
        .await;
        let mut rx = session.subscribe();

        let outcome = session
            .submit(user("What is in my notes?"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, TurnStatus::Completed);
        let requests = source.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1]
            .prompt
            .starts_with("Original User Query: What is in my notes?\n"));
        assert!(requests[1]
            .prompt
            .contains("--- REQUESTED FILE CONTENT START (notes.md) ---\nalpha beta\n"));

        let users = session
            .conversation()
            .messages()
            .iter()
            .filter(|m| m.participant == Participant::User)
            .count();
        assert_eq!(users, 1);
        assert!(notifications(&mut rx)
            .iter()
            .any(|n| n.text == "Markie is reading \"notes.md\" to answer your query."));
    }

    #[tokio::test]
    async fn test_read_deleted_file_errors_without_reprompt() {
        let mut ws = workspace().await;
        let doomed = ws
            .create_node("old.md", NodeKind::File, None, None)
            .await
            .unwrap();
        ws.delete_node(&doomed).await;
        let (mut session, source) = session(
            ws,
            vec![Reply::text(&format!("[MK_FS_READ_FILE_CONTENT::{doomed}]"))],
        )
        .await;
        let mut rx = session.subscribe();

        session
            .submit(user("read it"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source.requests().len(), 1);
        let notes = notifications(&mut rx);
        let error = notes
            .iter()
            .find(|n| n.kind == NotificationKind::Error)
            .unwrap();
        assert_eq!(
            error.text,
            format!("Error: Markie tried to read \"{doomed}\", but it's not a valid file or couldn't be found.")
        );
    }

    #[tokio::test]
    async fn test_stopped_read_request_is_not_announced() {
        let ws = workspace().await;
        let welcome = ws.active_file_id().unwrap().to_string();
        let (mut session, source) = session(
            ws,
            vec![Reply::Hang(vec![StreamChunk::text(&format!(
                "Checking. [MK_FS_READ_FILE_CONTENT::{welcome}]"
            ))])],
        )
        .await;
        let mut rx = session.subscribe();
        let mut events = session.subscribe();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();

        let watcher = async move {
            while let Ok(event) = events.recv().await {
                if matches!(event, ConversationEvent::Chunk(_)) {
                    canceller.cancel();
                    break;
                }
            }
        };
        let (outcome, _) = tokio::join!(session.submit(user("read welcome"), &cancel), watcher);

        assert_eq!(outcome.unwrap().status, TurnStatus::Stopped);
        assert_eq!(source.requests().len(), 1);
        assert!(!notifications(&mut rx)
            .iter()
            .any(|n| n.text.starts_with("Markie is reading")));
    }

    #[tokio::test]
    async fn test_unreadable_workspace_raises_startup_notice() {
        let store = Arc::new(MemoryWorkspaceStore::with_raw(serde_json::json!("not a workspace")));
        let session = EditorSession::load(
            store,
            Arc::new(MemoryPreferencesStore::default()),
            None,
        )
        .await;

        assert_eq!(session.workspace().active_file().unwrap().name, "Welcome.md");
        assert_eq!(
            session.startup_notices(),
            &[Notification::new(
                NotificationKind::Error,
                "Error loading file system. Using default."
            )]
        );

        let clean = EditorSession::load(
            Arc::new(MemoryWorkspaceStore::default()),
            Arc::new(MemoryPreferencesStore::default()),
            None,
        )
        .await;
        assert!(clean.startup_notices().is_empty());
    }

    #[tokio::test]
    async fn test_reprompt_chain_is_bounded() {
        let ws = workspace().await;
        let welcome = ws.active_file_id().unwrap().to_string();
        let tag = format!("[MK_FS_READ_FILE_CONTENT::{welcome}]");
        let replies = (0..6).map(|_| Reply::text(&tag)).collect();
        let (mut session, source) = session(ws, replies).await;

        session
            .submit(user("loop"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(source.requests().len(), 1 + MAX_READ_REPROMPTS);
    }

    #[tokio::test]
    async fn test_apply_proposal_then_undo() {
        let ws = workspace().await;
        let original = ws.active_content().to_string();
        let reply = format!("Tightened it. {EDIT_START_MARKER}\n# Short\n{EDIT_END_MARKER}");
        let (mut session, _) = session(ws, vec![Reply::text(&reply)]).await;

        let outcome = session
            .submit(user("shorten"), &CancellationToken::new())
            .await
            .unwrap();
        let message_id = outcome.message_id.unwrap();
        assert!(session.conversation().message(&message_id).unwrap().is_edit_proposal);

        assert!(session.apply_proposal(&message_id).await);
        assert_eq!(session.workspace().active_content(), "# Short");
        assert!(!session.apply_proposal(&message_id).await);

        assert!(session.undo().await);
        assert_eq!(session.workspace().active_content(), original);
        assert!(!session.undo().await);
    }

    #[tokio::test]
    async fn test_apply_proposal_without_active_file() {
        let mut ws = workspace().await;
        let root = ws.map().root_ids()[0].clone();
        ws.delete_node(&root).await;
        let reply = format!("{EDIT_START_MARKER}\nX\n{EDIT_END_MARKER}");
        let (mut session, _) = session(ws, vec![Reply::text(&reply)]).await;
        let outcome = session
            .submit(user("edit"), &CancellationToken::new())
            .await
            .unwrap();
        let mut rx = session.subscribe();
        let message_id = outcome.message_id.unwrap();

        assert!(!session.apply_proposal(&message_id).await);
        assert_eq!(
            notifications(&mut rx)[0].text,
            "No active file to apply changes to."
        );
        // Still open for a later attempt.
        assert!(session.conversation().message(&message_id).unwrap().is_edit_proposal);
    }

    #[tokio::test]
    async fn test_discard_proposal_adds_note() {
        let ws = workspace().await;
        let reply = format!("{EDIT_START_MARKER}\nX\n{EDIT_END_MARKER}");
        let (mut session, _) = session(ws, vec![Reply::text(&reply)]).await;
        let outcome = session
            .submit(user("edit"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(session.discard_proposal(outcome.message_id.as_deref().unwrap()));
        let last = session.conversation().messages().last().unwrap();
        assert_eq!(last.text, DISCARD_NOTE);
    }

    #[tokio::test]
    async fn test_delete_proposal_waits_for_confirmation() {
        let ws = workspace().await;
        let welcome = ws.active_file_id().unwrap().to_string();
        let (mut session, _) = session(
            ws,
            vec![Reply::text(&format!(
                "Shall I? [MK_FS_PROPOSE_DELETE::{welcome}::Welcome.md]"
            ))],
        )
        .await;

        session
            .submit(user("delete welcome"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(session.workspace().map().contains(&welcome));
        assert_eq!(session.pending_delete().unwrap().node_id, welcome);

        let removed = session.confirm_delete().await.unwrap();
        assert_eq!(removed, vec![welcome.clone()]);
        assert!(!session.workspace().map().contains(&welcome));
        assert!(session.pending_delete().is_none());
        assert!(session.conversation().is_stale());
    }

    #[tokio::test]
    async fn test_cancel_delete_keeps_node() {
        let ws = workspace().await;
        let welcome = ws.active_file_id().unwrap().to_string();
        let (mut session, _) = session(
            ws,
            vec![Reply::text(&format!("[MK_FS_PROPOSE_DELETE::{welcome}::Welcome.md]"))],
        )
        .await;
        session
            .submit(user("delete"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session.cancel_delete().unwrap().node_name, "Welcome.md");
        assert!(session.confirm_delete().await.is_none());
        assert!(session.workspace().map().contains(&welcome));
    }

    #[tokio::test]
    async fn test_assistant_create_marks_conversation_stale() {
        let ws = workspace().await;
        let (mut session, source) = session(
            ws,
            vec![
                Reply::text("Done. [MK_FS_CREATE_FOLDER::null::Drafts]"),
                Reply::text("Ok."),
            ],
        )
        .await;
        let cancel = CancellationToken::new();

        session.submit(user("make Drafts"), &cancel).await.unwrap();
        assert!(session.conversation().is_stale());

        session.submit(user("thanks"), &cancel).await.unwrap();
        assert!(!session.conversation().is_stale());
        assert!(source.requests()[1].prompt.contains("Drafts (folder, empty) [ID: "));
    }

    #[tokio::test]
    async fn test_clear_document_and_undo() {
        let ws = workspace().await;
        let original = ws.active_content().to_string();
        let (mut session, _) = session(ws, vec![]).await;
        let mut rx = session.subscribe();

        assert!(session.clear_document().await);
        assert_eq!(session.workspace().active_content(), "");
        assert_eq!(
            notifications(&mut rx)[0].text,
            "Content of \"Welcome.md\" cleared. You can undo."
        );

        assert!(session.undo().await);
        assert_eq!(session.workspace().active_content(), original);
    }

    #[tokio::test]
    async fn test_user_rename_notifies() {
        let ws = workspace().await;
        let welcome = ws.active_file_id().unwrap().to_string();
        let (mut session, _) = session(ws, vec![]).await;
        let mut rx = session.subscribe();

        assert!(session.rename_node(&welcome, " Intro.md ").await.unwrap());
        assert_eq!(notifications(&mut rx)[0].text, "Renamed to \"Intro.md\".");
        assert!(!session.rename_node(&welcome, "Intro.md").await.unwrap());
    }
}
