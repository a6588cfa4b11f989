//! The conversation controller: one turn at a time against a streaming
//! text source.
//!
//! A turn goes `Idle → Sending → Streaming → Finalizing → Idle`, or
//! `Streaming → Aborted → Idle` when the caller cancels. Chunks are only
//! appended while streaming; action tags are parsed once, against the full
//! accumulated text, by [`Conversation::finalize`], which both completion
//! and cancellation go through.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ConversationError;
use crate::events::{ChunkData, ConversationEvent};
use crate::fs_store::FileSystemMap;
use crate::preferences::{PreferencesStore, RememberedFacts, UserPreferences};
use crate::prompts::{document_prompt, system_instruction, welcome_message, SelectionAction};
use crate::protocol::interpret_response;
use crate::providers::{ChatRequest, TextSource};
use crate::tree_listing::render_tree_listing;
use crate::types::*;

const WELCOME_ID: &str = "welcome-message";
const STOPPED_SUFFIX: &str = " (Stopped by user)";

/// What the caller wants to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Typed by the user; wrapped with the document and file tree.
    User(String),
    /// Context-menu action on a highlighted passage; sent verbatim.
    Selection {
        action: SelectionAction,
        text: String,
    },
    /// Follow-up generated by the application; adds no visible message.
    InternalReprompt(String),
}

/// Editor state a normal user message is wrapped with.
pub struct TurnContext<'a> {
    pub document: &'a str,
    pub map: &'a FileSystemMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    /// The assistant (or error) message of this turn, if one was kept.
    pub message_id: Option<String>,
    pub actions: Vec<FsAction>,
    pub proposal: Option<String>,
    pub facts_changed: bool,
}

/// Provider-side chat session: instruction plus the turns it has seen.
#[derive(Debug, Clone, Default)]
struct Session {
    system_instruction: String,
    history: Vec<HistoryEntry>,
}

pub struct Conversation {
    source: Option<Arc<dyn TextSource>>,
    prefs: Arc<dyn PreferencesStore>,
    facts: RememberedFacts,
    session: Session,
    stale: bool,
    state: TurnState,
    messages: Vec<ChatMessage>,
    last_user_query: Option<String>,
    pub event_tx: broadcast::Sender<ConversationEvent>,
}

impl Conversation {
    /// Load remembered facts and open a session. A missing source leaves the
    /// conversation permanently unavailable.
    pub async fn load(
        source: Option<Arc<dyn TextSource>>,
        prefs: Arc<dyn PreferencesStore>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let facts = prefs.load().await.remembered_facts;

        let mut conversation = Self {
            source,
            prefs,
            facts,
            session: Session::default(),
            stale: false,
            state: TurnState::Idle,
            messages: Vec::new(),
            last_user_query: None,
            event_tx,
        };
        conversation.reinitialize();
        conversation.show_greeting();
        conversation
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_available(&self) -> bool {
        self.source.is_some()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn message(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn facts(&self) -> &RememberedFacts {
        &self.facts
    }

    /// Most recent user-visible query, kept for read-file re-prompts.
    pub fn last_user_query(&self) -> Option<&str> {
        self.last_user_query.as_deref()
    }

    /// The file tree changed; rebuild the session before the next send.
    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub(crate) fn broadcast(&self, event: ConversationEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_state(&mut self, state: TurnState) {
        self.state = state;
        self.broadcast(ConversationEvent::State(state));
    }

    pub fn notify(&self, kind: NotificationKind, text: impl Into<String>) {
        self.broadcast(ConversationEvent::Notification(Notification::new(kind, text)));
    }

    // ── Session ──

    /// Rebuild the system instruction from current facts and replay the
    /// visible conversation as history.
    fn reinitialize(&mut self) {
        let history: Vec<HistoryEntry> = self
            .messages
            .iter()
            .filter(|m| m.id != WELCOME_ID && !m.is_streaming && !m.text.trim().is_empty())
            .filter_map(|m| {
                let role = match m.participant {
                    Participant::User => Role::User,
                    Participant::Assistant => Role::Model,
                    Participant::Error => return None,
                };
                Some(HistoryEntry {
                    role,
                    text: m.text.clone(),
                })
            })
            .collect();

        self.session = Session {
            system_instruction: system_instruction(&self.facts),
            history,
        };
        self.stale = false;
        info!(
            "Session initialized ({} fact(s), {} history turn(s))",
            self.facts.len(),
            self.session.history.len()
        );
    }

    fn show_greeting(&mut self) {
        let mut message = if self.is_available() {
            ChatMessage::new(
                Participant::Assistant,
                &welcome_message(!self.facts.is_empty()),
                false,
            )
        } else {
            ChatMessage::new(
                Participant::Error,
                "Markie is unavailable: no API key is configured.",
                false,
            )
        };
        message.id = WELCOME_ID.to_string();
        self.messages.push(message.clone());
        self.broadcast(ConversationEvent::MessageFinalized(message));
    }

    fn push_message(&mut self, message: ChatMessage) {
        self.messages.push(message.clone());
        if message.is_streaming {
            self.broadcast(ConversationEvent::MessageStarted(message));
        } else {
            self.broadcast(ConversationEvent::MessageFinalized(message));
        }
    }

    /// Append a finished assistant message (e.g. a status note).
    pub fn push_info(&mut self, text: &str) -> String {
        let message = ChatMessage::new(Participant::Assistant, text, false);
        let id = message.id.clone();
        self.push_message(message);
        id
    }

    /// Drop all messages, optionally forgetting every remembered fact, and
    /// start a fresh session.
    pub async fn clear_chat(&mut self, forget_facts: bool) {
        self.messages.clear();
        self.last_user_query = None;
        if forget_facts && !self.facts.is_empty() {
            self.facts.clear();
            if let Err(e) = self.prefs.clear().await {
                error!("Failed to clear remembered facts: {:#}", e);
            }
            self.notify(NotificationKind::Info, "Markie forgot all remembered facts.");
        }
        self.reinitialize();
        self.show_greeting();
    }

    /// Mark a proposal as handled so it cannot be applied twice. Returns the
    /// proposed document if the message still carried one.
    pub fn close_proposal(&mut self, message_id: &str) -> Option<String> {
        let message = self
            .messages
            .iter_mut()
            .find(|m| m.id == message_id && m.is_edit_proposal)?;
        message.is_edit_proposal = false;
        let document = message.proposed_doc_content.take();
        let snapshot = message.clone();
        self.broadcast(ConversationEvent::MessageFinalized(snapshot));
        document
    }

    // ── Turns ──

    pub async fn send(
        &mut self,
        outbound: OutboundMessage,
        context: &TurnContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, ConversationError> {
        let Some(source) = self.source.clone() else {
            return Err(ConversationError::Unavailable(
                "no API key is configured".into(),
            ));
        };
        if self.state != TurnState::Idle {
            return Err(ConversationError::Busy);
        }

        self.set_state(TurnState::Sending);
        self.messages.retain(|m| m.id != WELCOME_ID);
        if self.stale {
            self.reinitialize();
        }

        let prompt = match outbound {
            OutboundMessage::User(text) => {
                let prompt = document_prompt(&text, context.document, &render_tree_listing(context.map));
                self.push_message(ChatMessage::new(Participant::User, &text, false));
                self.last_user_query = Some(text);
                prompt
            }
            OutboundMessage::Selection { action, text } => {
                let prompt = action.prompt(&text);
                self.push_message(ChatMessage::new(Participant::User, &prompt, false));
                self.last_user_query = Some(prompt.clone());
                prompt
            }
            OutboundMessage::InternalReprompt(prompt) => prompt,
        };

        let reply = ChatMessage::new(Participant::Assistant, "", true);
        let message_id = reply.id.clone();
        self.push_message(reply);

        let request = ChatRequest {
            system_instruction: self.session.system_instruction.clone(),
            history: self.session.history.clone(),
            prompt: prompt.clone(),
        };

        let mut stream = match source.stream_reply(&request).await {
            Ok(stream) => stream,
            Err(e) => return Ok(self.fail_turn(&message_id, &e)),
        };

        self.set_state(TurnState::Streaming);
        let mut raw = String::new();
        let mut sources: Vec<GroundingSource> = Vec::new();
        let mut stopped = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stopped = true;
                    break;
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    raw.push_str(&chunk.text);
                    let mut fresh = Vec::new();
                    for s in chunk.sources {
                        if !sources.iter().any(|known| known.uri == s.uri) {
                            sources.push(s.clone());
                            fresh.push(s);
                        }
                    }
                    if let Some(m) = self.messages.iter_mut().find(|m| m.id == message_id) {
                        m.text.push_str(&chunk.text);
                    }
                    self.broadcast(ConversationEvent::Chunk(ChunkData {
                        message_id: message_id.clone(),
                        text: chunk.text,
                        sources: fresh,
                    }));
                }
                Some(Err(e)) => return Ok(self.fail_turn(&message_id, &e)),
                None => break,
            }
        }

        if stopped {
            info!("Reply stopped by user after {} chars", raw.len());
            self.set_state(TurnState::Aborted);
        } else {
            self.set_state(TurnState::Finalizing);
        }
        self.session.history.push(HistoryEntry {
            role: Role::User,
            text: prompt,
        });
        self.session.history.push(HistoryEntry {
            role: Role::Model,
            text: raw.clone(),
        });

        let outcome = self.finalize(&message_id, &raw, sources, stopped, context.map).await;
        self.set_state(TurnState::Idle);
        Ok(outcome)
    }

    /// Shared end of every streamed turn, stopped or not: parse tags against
    /// the accumulated text, fill in the message and apply fact changes.
    async fn finalize(
        &mut self,
        message_id: &str,
        raw: &str,
        sources: Vec<GroundingSource>,
        stopped: bool,
        map: &FileSystemMap,
    ) -> TurnOutcome {
        let parsed = interpret_response(raw, &self.facts);

        let mut feedback: Vec<String> = parsed
            .memory_feedback
            .iter()
            .map(|f| format!("Memory: {}", f.text))
            .collect();
        feedback.extend(parsed.actions.iter().map(|a| action_feedback(a, map)));

        let mut text = parsed.display_text.clone();
        if stopped {
            text.push_str(STOPPED_SUFFIX);
        }

        let mut snapshot = None;
        if let Some(m) = self.messages.iter_mut().find(|m| m.id == message_id) {
            m.text = text;
            m.is_streaming = false;
            m.grounding_sources = sources;
            m.suggestions = parsed.suggestions.clone();
            m.is_edit_proposal = parsed.proposal.is_some();
            m.proposed_doc_content = parsed.proposal.clone();
            m.system_action_feedback = feedback;
            snapshot = Some(m.clone());
        }
        if let Some(m) = snapshot {
            self.broadcast(ConversationEvent::MessageFinalized(m));
        }

        for f in &parsed.memory_feedback {
            self.broadcast(ConversationEvent::Notification(f.clone()));
        }

        if parsed.facts_changed {
            self.facts = parsed.facts.clone();
            let prefs = UserPreferences {
                remembered_facts: self.facts.clone(),
            };
            if let Err(e) = self.prefs.save(&prefs).await {
                error!("Failed to save remembered facts: {:#}", e);
            }
            self.reinitialize();
        }

        TurnOutcome {
            status: if stopped {
                TurnStatus::Stopped
            } else {
                TurnStatus::Completed
            },
            message_id: Some(message_id.to_string()),
            actions: parsed.actions,
            proposal: parsed.proposal,
            facts_changed: parsed.facts_changed,
        }
    }

    /// Turn the in-progress message into an error message. An error
    /// identical to the previous one is not shown twice.
    fn fail_turn(&mut self, message_id: &str, err: &anyhow::Error) -> TurnOutcome {
        let text = format!("Markie couldn't respond: {err}");
        warn!("{}", text);

        let duplicate = self
            .messages
            .iter()
            .rev()
            .find(|m| m.id != message_id)
            .is_some_and(|m| m.participant == Participant::Error && m.text == text);

        let kept = if duplicate {
            self.messages.retain(|m| m.id != message_id);
            None
        } else {
            let mut snapshot = None;
            if let Some(m) = self.messages.iter_mut().find(|m| m.id == message_id) {
                m.participant = Participant::Error;
                m.text = text;
                m.is_streaming = false;
                snapshot = Some(m.clone());
            }
            if let Some(m) = snapshot {
                self.broadcast(ConversationEvent::MessageFinalized(m));
            }
            Some(message_id.to_string())
        };

        self.set_state(TurnState::Idle);
        TurnOutcome {
            status: TurnStatus::Failed,
            message_id: kept,
            actions: Vec::new(),
            proposal: None,
            facts_changed: false,
        }
    }
}

/// Line shown under an assistant message for each file-system action.
pub fn action_feedback(action: &FsAction, map: &FileSystemMap) -> String {
    match action {
        FsAction::CreateFile { file_name, .. } => {
            format!("File System: Will attempt to create file '{file_name}'.")
        }
        FsAction::CreateFolder { folder_name, .. } => {
            format!("File System: Will attempt to create folder '{folder_name}'.")
        }
        FsAction::ProposeDelete { node_name, .. } => {
            format!("File System: Will propose deletion of '{node_name}'.")
        }
        FsAction::NavigateToFile { file_id } => {
            format!("File System: Will attempt to open file (ID: {file_id}).")
        }
        FsAction::ReadFileContent { file_id } => {
            let name = map.get(file_id).map(|n| n.name.as_str()).unwrap_or(file_id);
            format!("File System: Will attempt to read file '{name}'.")
        }
    }
}
