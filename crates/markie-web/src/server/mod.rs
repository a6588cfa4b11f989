//! Web server — Axum router + shared state.

pub mod api;
pub mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};

use markie_core::events::ConversationEvent;
use markie_core::session::EditorSession;

/// Shared application state. The session lock is held for the length of an
/// assistant turn; `events` lets WebSocket clients subscribe without it.
pub struct AppState {
    pub session: Arc<Mutex<EditorSession>>,
    pub events: broadcast::Sender<ConversationEvent>,
    /// Cancellation handle of the turn in progress, if any.
    pub active_turn: Mutex<Option<CancellationToken>>,
    pub project_root: PathBuf,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::very_permissive();

    let mut app = Router::new()
        .merge(api::routes())
        .merge(ws::routes())
        .layer(cors)
        .with_state(state.clone());

    // Serve a built client if one is present
    let frontend_dist = state.project_root.join("frontend/dist");
    if frontend_dist.is_dir() {
        let index_html = frontend_dist.join("index.html");
        app = app.fallback_service(
            ServeDir::new(&frontend_dist).not_found_service(ServeFile::new(index_html)),
        );
    }

    app
}
