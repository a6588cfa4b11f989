//! Remembered facts: a small persisted key/value table the assistant
//! maintains through memory tags. Unbounded; nothing is ever evicted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::persistence::write_json_atomic;

const PREFERENCES_FILENAME: &str = "preferences.json";

/// snake_case key → free-text value.
pub type RememberedFacts = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferences {
    pub remembered_facts: RememberedFacts,
}

impl UserPreferences {
    /// Validate a raw JSON value. Anything that isn't
    /// `{"rememberedFacts": {..}}` becomes an empty table; non-string values
    /// inside the table are dropped.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let Some(table) = value.get("rememberedFacts").and_then(|v| v.as_object()) else {
            warn!("Preferences have unexpected shape, using empty facts");
            return Self::default();
        };
        let remembered_facts = table
            .iter()
            .filter_map(|(k, v)| match v.as_str() {
                Some(s) => Some((k.clone(), s.to_string())),
                None => {
                    warn!("Dropping non-text remembered fact '{}'", k);
                    None
                }
            })
            .collect();
        Self { remembered_facts }
    }
}

/// Insert or overwrite `key`, or remove it when `value` is `None`.
pub fn update_fact(facts: &RememberedFacts, key: &str, value: Option<&str>) -> RememberedFacts {
    let mut next = facts.clone();
    match value {
        Some(v) => {
            next.insert(key.to_string(), v.to_string());
        }
        None => {
            next.remove(key);
        }
    }
    next
}

/// `project_code_name` → `project code name`.
pub fn display_key(key: &str) -> String {
    key.replace('_', " ")
}

// ── Storage port ──

#[async_trait]
pub trait PreferencesStore: Send + Sync {
    /// Never fails: missing or malformed data yields empty preferences.
    async fn load(&self) -> UserPreferences;
    async fn save(&self, prefs: &UserPreferences) -> Result<()>;

    async fn clear(&self) -> Result<()> {
        self.save(&UserPreferences::default()).await
    }
}

/// `preferences.json` under the data directory.
pub struct JsonPreferencesStore {
    path: PathBuf,
}

impl JsonPreferencesStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(PREFERENCES_FILENAME),
        }
    }
}

#[async_trait]
impl PreferencesStore for JsonPreferencesStore {
    async fn load(&self) -> UserPreferences {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return UserPreferences::default(),
            Err(e) => {
                warn!("Failed to read {}: {}", self.path.display(), e);
                return UserPreferences::default();
            }
        };
        match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(value) => {
                let prefs = UserPreferences::from_value(&value);
                info!("Loaded {} remembered fact(s)", prefs.remembered_facts.len());
                prefs
            }
            Err(e) => {
                warn!("Corrupt preferences file, using empty facts: {}", e);
                UserPreferences::default()
            }
        }
    }

    async fn save(&self, prefs: &UserPreferences) -> Result<()> {
        write_json_atomic(&self.path, prefs).await
    }
}

/// In-process store for tests and embedding.
#[derive(Default)]
pub struct MemoryPreferencesStore {
    prefs: Mutex<UserPreferences>,
    saves: Mutex<usize>,
}

impl MemoryPreferencesStore {
    pub fn with_facts(facts: RememberedFacts) -> Self {
        Self {
            prefs: Mutex::new(UserPreferences {
                remembered_facts: facts,
            }),
            saves: Mutex::new(0),
        }
    }

    pub async fn save_count(&self) -> usize {
        *self.saves.lock().await
    }
}

#[async_trait]
impl PreferencesStore for MemoryPreferencesStore {
    async fn load(&self) -> UserPreferences {
        self.prefs.lock().await.clone()
    }

    async fn save(&self, prefs: &UserPreferences) -> Result<()> {
        *self.prefs.lock().await = prefs.clone();
        *self.saves.lock().await += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_fact_insert_and_remove() {
        let facts = RememberedFacts::new();
        let facts = update_fact(&facts, "favorite_color", Some("sky blue"));
        assert_eq!(facts.get("favorite_color").map(String::as_str), Some("sky blue"));

        let cleared = update_fact(&facts, "favorite_color", None);
        assert!(cleared.is_empty());
        // Input untouched.
        assert_eq!(facts.len(), 1);
    }

    #[test]
    fn test_from_value_validates_shape() {
        let ok = serde_json::json!({"rememberedFacts": {"a": "1", "b": 2}});
        let prefs = UserPreferences::from_value(&ok);
        assert_eq!(prefs.remembered_facts.len(), 1);

        let wrong = serde_json::json!({"facts": {"a": "1"}});
        assert!(UserPreferences::from_value(&wrong).remembered_facts.is_empty());

        let null = serde_json::json!({"rememberedFacts": null});
        assert!(UserPreferences::from_value(&null).remembered_facts.is_empty());
    }

    #[tokio::test]
    async fn test_json_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonPreferencesStore::new(dir.path());
        assert!(store.load().await.remembered_facts.is_empty());

        let mut prefs = UserPreferences::default();
        prefs
            .remembered_facts
            .insert("project_name".into(), "Atlas".into());
        store.save(&prefs).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join(PREFERENCES_FILENAME)).unwrap();
        assert!(raw.contains("\"rememberedFacts\""));
        assert_eq!(store.load().await, prefs);

        store.clear().await.unwrap();
        assert!(store.load().await.remembered_facts.is_empty());
    }

    #[tokio::test]
    async fn test_json_store_corrupt_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PREFERENCES_FILENAME), "{not json").unwrap();
        let store = JsonPreferencesStore::new(dir.path());
        assert!(store.load().await.remembered_facts.is_empty());
    }
}
