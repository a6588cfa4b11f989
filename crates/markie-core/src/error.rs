//! Typed domain errors. I/O and network edges use `anyhow` instead.

use thiserror::Error;

use crate::types::{NodeId, NodeKind};

/// Validation failures from the file-system store. The map is never
/// partially mutated when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("Name cannot be empty.")]
    EmptyName,

    #[error("Name cannot contain line breaks or control characters.")]
    InvalidName,

    #[error("A {kind} named \"{name}\" already exists in this location.")]
    NameConflict { name: String, kind: NodeKind },

    #[error("Node not found.")]
    NotFound(NodeId),

    #[error("Parent folder {0} not found.")]
    ParentNotFound(NodeId),

    #[error("Parent {0} is not a folder.")]
    ParentNotFolder(NodeId),
}

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("A reply is already in progress.")]
    Busy,

    #[error("Markie is unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_names_kind() {
        let err = FsError::NameConflict {
            name: "a.md".into(),
            kind: NodeKind::File,
        };
        assert_eq!(
            err.to_string(),
            "A file named \"a.md\" already exists in this location."
        );
    }
}
