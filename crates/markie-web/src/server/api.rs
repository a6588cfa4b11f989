//! REST API endpoints. Assistant turns run in the background; their progress
//! reaches clients over the WebSocket.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use markie_core::conversation::OutboundMessage;
use markie_core::error::ConversationError;
use markie_core::prompts::SelectionAction;
use markie_core::session::EditorSession;
use markie_core::types::NodeKind;

use super::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/workspace", get(get_workspace))
        .route("/api/nodes", post(create_node))
        .route("/api/nodes/{id}", axum::routing::delete(delete_node))
        .route("/api/nodes/{id}/rename", post(rename_node))
        .route("/api/nodes/{id}/toggle", post(toggle_folder))
        .route("/api/nodes/{id}/open", post(open_file))
        .route("/api/document", put(put_document))
        .route("/api/document/clear", post(clear_document))
        .route("/api/undo", post(undo))
        .route("/api/messages", get(get_messages))
        .route("/api/chat", post(post_chat))
        .route("/api/chat/clear", post(clear_chat))
        .route("/api/selection", post(post_selection))
        .route("/api/stop", post(stop))
        .route("/api/proposals/{message_id}/apply", post(apply_proposal))
        .route("/api/proposals/{message_id}/discard", post(discard_proposal))
        .route("/api/delete/confirm", post(confirm_delete))
        .route("/api/delete/cancel", post(cancel_delete))
        .route("/api/preferences", get(get_preferences))
}

fn workspace_view(session: &EditorSession) -> Value {
    let ws = session.workspace();
    json!({
        "fsMap": ws.map(),
        "rootIds": ws.map().root_ids(),
        "activeFileId": ws.active_file_id(),
        "document": ws.active_content(),
        "pendingDelete": session.pending_delete(),
        "canUndo": session.can_undo(),
        "startupNotices": session.startup_notices(),
    })
}

fn fail(error: impl std::fmt::Display) -> Json<Value> {
    Json(json!({"ok": false, "error": error.to_string()}))
}

// --- Workspace ---

async fn get_workspace(State(state): State<Arc<AppState>>) -> Json<Value> {
    let session = state.session.lock().await;
    Json(workspace_view(&session))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody {
    name: String,
    kind: NodeKind,
    parent_id: Option<String>,
}

async fn create_node(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateBody>,
) -> Json<Value> {
    let mut session = state.session.lock().await;
    match session
        .create_node(&body.name, body.kind, body.parent_id.as_deref())
        .await
    {
        Ok(id) => Json(json!({"ok": true, "id": id, "workspace": workspace_view(&session)})),
        Err(e) => fail(e),
    }
}

#[derive(Deserialize)]
struct RenameBody {
    name: String,
}

async fn rename_node(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> Json<Value> {
    let mut session = state.session.lock().await;
    match session.rename_node(&id, &body.name).await {
        Ok(changed) => Json(json!({"ok": true, "changed": changed})),
        Err(e) => fail(e),
    }
}

async fn delete_node(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Json<Value> {
    let mut session = state.session.lock().await;
    match session.delete_node(&id).await {
        Ok(removed) => Json(json!({"ok": true, "removed": removed})),
        Err(e) => fail(e),
    }
}

async fn toggle_folder(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Json<Value> {
    let mut session = state.session.lock().await;
    session.toggle_folder(&id).await;
    Json(json!({"ok": true}))
}

async fn open_file(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Json<Value> {
    let mut session = state.session.lock().await;
    match session.open_file(&id).await {
        Ok(()) => Json(json!({"ok": true, "document": session.workspace().active_content()})),
        Err(e) => fail(e),
    }
}

// --- Document ---

#[derive(Deserialize)]
struct DocumentBody {
    content: String,
}

async fn put_document(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DocumentBody>,
) -> Json<Value> {
    let mut session = state.session.lock().await;
    if session.update_document(&body.content).await {
        Json(json!({"ok": true}))
    } else {
        fail("no active file")
    }
}

async fn clear_document(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut session = state.session.lock().await;
    Json(json!({"ok": session.clear_document().await}))
}

async fn undo(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut session = state.session.lock().await;
    Json(json!({"ok": session.undo().await}))
}

// --- Conversation ---

async fn get_messages(State(state): State<Arc<AppState>>) -> Json<Value> {
    let session = state.session.lock().await;
    let conversation = session.conversation();
    Json(json!({
        "available": conversation.is_available(),
        "state": conversation.state(),
        "messages": conversation.messages(),
    }))
}

/// Start a turn in the background. Rejected while another turn holds the
/// session.
async fn start_turn(state: Arc<AppState>, outbound: OutboundMessage) -> Json<Value> {
    let Ok(mut session) = Arc::clone(&state.session).try_lock_owned() else {
        return fail(ConversationError::Busy);
    };
    if !session.conversation().is_available() {
        return fail(ConversationError::Unavailable("no API key is configured".into()));
    }

    let cancel = CancellationToken::new();
    *state.active_turn.lock().await = Some(cancel.clone());

    tokio::spawn(async move {
        if let Err(e) = session.submit(outbound, &cancel).await {
            warn!("Turn rejected: {}", e);
        }
        // Clear the handle before releasing the session to the next turn.
        state.active_turn.lock().await.take();
        drop(session);
    });

    Json(json!({"ok": true}))
}

#[derive(Deserialize)]
struct ChatBody {
    text: Option<String>,
}

async fn post_chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> Json<Value> {
    let text = match body.text.as_deref().map(|s| s.trim()) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => return fail("empty message"),
    };
    start_turn(state, OutboundMessage::User(text)).await
}

#[derive(Deserialize)]
struct SelectionBody {
    action: SelectionAction,
    text: String,
}

async fn post_selection(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SelectionBody>,
) -> Json<Value> {
    if body.text.trim().is_empty() {
        return fail("empty selection");
    }
    start_turn(
        state,
        OutboundMessage::Selection {
            action: body.action,
            text: body.text,
        },
    )
    .await
}

async fn stop(State(state): State<Arc<AppState>>) -> Json<Value> {
    match state.active_turn.lock().await.as_ref() {
        Some(token) => {
            info!("Stop requested");
            token.cancel();
            Json(json!({"ok": true}))
        }
        None => fail("nothing to stop"),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearChatBody {
    #[serde(default)]
    forget_facts: bool,
}

async fn clear_chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClearChatBody>,
) -> Json<Value> {
    let mut session = state.session.lock().await;
    session.clear_chat(body.forget_facts).await;
    Json(json!({"ok": true}))
}

// --- Proposals ---

async fn apply_proposal(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
) -> Json<Value> {
    let mut session = state.session.lock().await;
    let ok = session.apply_proposal(&message_id).await;
    Json(json!({"ok": ok, "document": session.workspace().active_content()}))
}

async fn discard_proposal(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
) -> Json<Value> {
    let mut session = state.session.lock().await;
    Json(json!({"ok": session.discard_proposal(&message_id)}))
}

async fn confirm_delete(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut session = state.session.lock().await;
    match session.confirm_delete().await {
        Some(removed) => Json(json!({"ok": true, "removed": removed})),
        None => fail("no deletion pending"),
    }
}

async fn cancel_delete(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut session = state.session.lock().await;
    Json(json!({"ok": session.cancel_delete().is_some()}))
}

// --- Preferences ---

async fn get_preferences(State(state): State<Arc<AppState>>) -> Json<Value> {
    let session = state.session.lock().await;
    Json(json!({"rememberedFacts": session.conversation().facts()}))
}
