//! Workspace persistence: the node table plus the last active file.
//!
//! Loading is tolerant. Nodes that fail to decode are skipped and the rest
//! are passed through [`FileSystemMap::repair`], so a partly damaged file
//! still yields a usable tree.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::fs_store::FileSystemMap;
use crate::types::{Node, NodeId};

const WORKSPACE_FILENAME: &str = "workspace.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedWorkspace {
    pub fs_map: FileSystemMap,
    #[serde(default)]
    pub last_active_file_id: Option<NodeId>,
}

#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet, an error when saved data
    /// exists but cannot be read.
    async fn load(&self) -> Result<Option<PersistedWorkspace>>;
    async fn save(&self, workspace: &PersistedWorkspace) -> Result<()>;
}

/// Write `value` as pretty JSON via a temp file and rename.
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Decode a saved workspace, dropping nodes that do not parse.
pub fn decode_workspace(value: &serde_json::Value) -> Option<PersistedWorkspace> {
    let entries = value.get("fsMap")?.as_object()?;

    let mut nodes = Vec::with_capacity(entries.len());
    for (key, raw) in entries {
        match serde_json::from_value::<Node>(raw.clone()) {
            Ok(mut node) => {
                node.id = key.clone();
                nodes.push(node);
            }
            Err(e) => warn!("Skipping unreadable node {}: {}", key, e),
        }
    }

    let fs_map = FileSystemMap::from_nodes(nodes).repair();
    let last_active_file_id = value
        .get("lastActiveFileId")
        .and_then(|v| v.as_str())
        .map(String::from);

    Some(PersistedWorkspace {
        fs_map,
        last_active_file_id,
    })
}

/// `workspace.json` under the data directory.
pub struct JsonWorkspaceStore {
    path: PathBuf,
}

impl JsonWorkspaceStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(WORKSPACE_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl WorkspaceStore for JsonWorkspaceStore {
    async fn load(&self) -> Result<Option<PersistedWorkspace>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        let value: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("corrupt workspace file {}", self.path.display()))?;
        let workspace = decode_workspace(&value)
            .ok_or_else(|| anyhow!("{} has no fsMap record", self.path.display()))?;
        info!("Loaded workspace with {} node(s)", workspace.fs_map.len());
        Ok(Some(workspace))
    }

    async fn save(&self, workspace: &PersistedWorkspace) -> Result<()> {
        write_json_atomic(&self.path, workspace).await
    }
}

/// In-process store for tests and embedding.
#[derive(Default)]
pub struct MemoryWorkspaceStore {
    saved: Mutex<Option<PersistedWorkspace>>,
    /// Raw record decoded on the next load, as a file-backed store would.
    raw: Mutex<Option<serde_json::Value>>,
    saves: Mutex<usize>,
}

impl MemoryWorkspaceStore {
    pub fn with_workspace(workspace: PersistedWorkspace) -> Self {
        Self {
            saved: Mutex::new(Some(workspace)),
            ..Self::default()
        }
    }

    pub fn with_raw(value: serde_json::Value) -> Self {
        Self {
            raw: Mutex::new(Some(value)),
            ..Self::default()
        }
    }

    pub async fn snapshot(&self) -> Option<PersistedWorkspace> {
        self.saved.lock().await.clone()
    }

    pub async fn save_count(&self) -> usize {
        *self.saves.lock().await
    }
}

#[async_trait]
impl WorkspaceStore for MemoryWorkspaceStore {
    async fn load(&self) -> Result<Option<PersistedWorkspace>> {
        if let Some(raw) = self.raw.lock().await.as_ref() {
            return decode_workspace(raw)
                .map(Some)
                .ok_or_else(|| anyhow!("unreadable workspace record"));
        }
        Ok(self.saved.lock().await.clone())
    }

    async fn save(&self, workspace: &PersistedWorkspace) -> Result<()> {
        *self.raw.lock().await = None;
        *self.saved.lock().await = Some(workspace.clone());
        *self.saves.lock().await += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_store::default_workspace;
    use serde_json::json;

    #[tokio::test]
    async fn test_json_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonWorkspaceStore::new(dir.path());
        assert!(store.load().await.unwrap().is_none());

        let (map, welcome) = default_workspace();
        let saved = PersistedWorkspace {
            fs_map: map,
            last_active_file_id: Some(welcome),
        };
        store.save(&saved).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert!(!dir.path().join("workspace.json.tmp").exists());
    }

    #[test]
    fn test_saved_shape_uses_camel_case() {
        let (map, welcome) = default_workspace();
        let value = serde_json::to_value(PersistedWorkspace {
            fs_map: map,
            last_active_file_id: Some(welcome.clone()),
        })
        .unwrap();
        assert_eq!(value["lastActiveFileId"], welcome.as_str());
        assert_eq!(value["fsMap"][&welcome]["type"], "FILE");
        assert!(value["fsMap"][&welcome]["parentId"].is_string());
    }

    #[test]
    fn test_decode_skips_bad_nodes_and_repairs() {
        let value = json!({
            "fsMap": {
                "f1": {"id": "f1", "name": "Docs", "type": "FOLDER", "parentId": null,
                       "childrenIds": ["a", "ghost"], "isExpanded": true},
                "a": {"id": "a", "name": "a.md", "type": "FILE", "parentId": "f1", "content": "x"},
                "b": {"id": "b", "name": "b.md", "type": "FILE", "parentId": "missing", "content": ""},
                "bad": {"name": 42}
            },
            "lastActiveFileId": "a"
        });
        let ws = decode_workspace(&value).unwrap();

        assert_eq!(ws.fs_map.len(), 3);
        assert!(ws.fs_map.check_integrity().is_empty());
        assert_eq!(ws.fs_map.get("b").unwrap().parent_id, None);
        assert_eq!(ws.last_active_file_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_decode_resolves_name_clash_after_rerooting() {
        let value = json!({
            "fsMap": {
                "r": {"id": "r", "name": "Welcome.md", "type": "FILE", "parentId": null, "content": ""},
                "o": {"id": "o", "name": "welcome.md", "type": "FILE", "parentId": "missing", "content": ""}
            }
        });
        let ws = decode_workspace(&value).unwrap();

        assert!(ws.fs_map.check_integrity().is_empty());
        // First by id keeps its name.
        assert_eq!(ws.fs_map.get("o").unwrap().name, "welcome.md");
        assert_eq!(ws.fs_map.get("r").unwrap().name, "Welcome (2).md");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("workspace.json"), "{not json").unwrap();
        let store = JsonWorkspaceStore::new(dir.path());
        assert!(store.load().await.is_err());

        std::fs::write(dir.path().join("workspace.json"), r#"{"nodes": []}"#).unwrap();
        assert!(store.load().await.is_err());
    }
}
