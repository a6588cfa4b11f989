//! markie-web — Axum server for the Markie editor.
//! Loads config, opens the workspace and conversation, serves the API.

mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;
use tracing::{info, warn};

use markie_core::config::Config;
use markie_core::persistence::JsonWorkspaceStore;
use markie_core::preferences::JsonPreferencesStore;
use markie_core::providers;
use markie_core::session::EditorSession;

use server::AppState;

fn load_config(project_root: &std::path::Path) -> Config {
    let mut config = match Config::load_from_dir(project_root) {
        Ok(config) => config,
        Err(e) => {
            info!("No usable config.yaml ({:#}), using defaults and env", e);
            Config::from_env().unwrap_or_else(|e| {
                warn!("Invalid environment configuration: {:#}", e);
                Config::default()
            })
        }
    };
    if config.project_root.as_os_str().is_empty() {
        config.project_root = project_root.to_path_buf();
    }
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let project_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config = load_config(&project_root);
    let data_dir = config.data_path();
    info!(
        "Provider {} / model {}, data in {}",
        config.provider,
        config.model,
        data_dir.display()
    );

    let session = EditorSession::load(
        Arc::new(JsonWorkspaceStore::new(&data_dir)),
        Arc::new(JsonPreferencesStore::new(&data_dir)),
        providers::from_config(&config),
    )
    .await;
    if !session.conversation().is_available() {
        eprintln!("\n  No API key configured: the editor works, Markie stays silent.");
        eprintln!("  Set OPENAI_API_KEY (or OPENROUTER_API_KEY with provider: openrouter).\n");
    }

    let state = Arc::new(AppState {
        events: session.conversation().event_tx.clone(),
        session: Arc::new(Mutex::new(session)),
        active_turn: Mutex::new(None),
        project_root: project_root.clone(),
    });
    let state_for_shutdown = Arc::clone(&state);
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    eprintln!("  Open http://{} to start writing\n", config.bind_addr);

    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Shutdown signal received, stopping any reply in progress...");
        if let Some(token) = state_for_shutdown.active_turn.lock().await.take() {
            token.cancel();
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    info!("Server stopped.");
    Ok(())
}
