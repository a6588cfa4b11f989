//! markie-core — Pure domain logic, no UI.
//!
//! This crate contains the virtual file system, the action-tag protocol
//! engine, prompt templating, the streaming model client and the
//! conversation/session orchestration for the Markie Markdown assistant.
//! It is completely UI-agnostic; frontends subscribe to events via
//! tokio::broadcast.

pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod fs_store;
pub mod persistence;
pub mod preferences;
pub mod prompts;
pub mod protocol;
pub mod providers;
pub mod session;
pub mod tree_listing;
pub mod types;
pub mod workspace;
