//! Configuration — YAML config + env var overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Known provider presets
const PROVIDER_PRESETS: &[(&str, Option<&str>)] = &[
    ("openai", None),
    ("openrouter", Some("https://openrouter.ai/api/v1")),
];

/// Provider-specific API key env vars (checked before OPENAI_API_KEY fallback)
const PROVIDER_KEY_ENV_VARS: &[(&str, &str)] = &[("openrouter", "OPENROUTER_API_KEY")];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// "openai" | "openrouter" | "custom"
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Chat model name
    #[serde(default = "default_model")]
    pub model: String,

    /// API key (set here or via env var)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Base URL for Chat Completions API (auto-set for known providers)
    #[serde(default)]
    pub base_url: Option<String>,

    /// Ask the provider for web-grounded answers with citations
    #[serde(default = "default_web_search")]
    pub web_search: bool,

    /// Max output tokens per reply
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Whole-request timeout for a streamed reply
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Where workspace.json and preferences.json live
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Address the web host binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Resolved project root (set at load time, not serialized from YAML)
    #[serde(skip)]
    pub project_root: PathBuf,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4.1-mini".into()
}
fn default_web_search() -> bool {
    true
}
fn default_max_output_tokens() -> u32 {
    4096
}
fn default_request_timeout() -> u64 {
    120
}
fn default_data_dir() -> String {
    ".markie".into()
}
fn default_bind_addr() -> String {
    "127.0.0.1:3000".into()
}

impl Config {
    /// Load config from a YAML file with env var overrides.
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config: {}", config_path.display()))?;

        let mut config: Config =
            serde_yaml::from_str(&content).context("Failed to parse config.yaml")?;

        config.project_root = config_path
            .parent()
            .unwrap_or(Path::new("."))
            .to_path_buf();

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load config from the default location (project_root/config.yaml)
    pub fn load_from_dir(project_root: &Path) -> Result<Self> {
        Self::load(&project_root.join("config.yaml"))
    }

    /// Defaults plus env overrides, for running without a config file.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(p) = std::env::var("MARKIE_PROVIDER") {
            self.provider = p;
        }

        // Base URL: env var > config > provider preset
        if let Ok(url) = std::env::var("MARKIE_BASE_URL") {
            self.base_url = Some(url);
        } else if self.base_url.is_none() {
            self.base_url = PROVIDER_PRESETS
                .iter()
                .find(|(p, _)| *p == self.provider)
                .and_then(|(_, url)| url.map(String::from));
        }

        // API key: provider-specific env var > OPENAI_API_KEY > config
        let provider_key_var = PROVIDER_KEY_ENV_VARS
            .iter()
            .find(|(p, _)| *p == self.provider)
            .map(|(_, var)| *var);

        if let Some(var) = provider_key_var {
            if let Ok(key) = std::env::var(var) {
                self.api_key = Some(key);
            }
        }
        if self.api_key.is_none() {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                self.api_key = Some(key);
            }
        }

        if let Ok(m) = std::env::var("MARKIE_MODEL") {
            self.model = m;
        }
        if let Ok(dir) = std::env::var("MARKIE_DATA_DIR") {
            self.data_dir = dir;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.provider == "custom" && self.base_url.is_none() {
            anyhow::bail!(
                "Provider 'custom' requires base_url in config.yaml or MARKIE_BASE_URL env var"
            );
        }
        Ok(())
    }

    /// Data directory, resolved against the project root when relative.
    pub fn data_path(&self) -> PathBuf {
        let p = Path::new(&self.data_dir);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.project_root.join(p)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            base_url: None,
            web_search: default_web_search(),
            max_output_tokens: default_max_output_tokens(),
            request_timeout_secs: default_request_timeout(),
            data_dir: default_data_dir(),
            bind_addr: default_bind_addr(),
            project_root: PathBuf::new(),
        }
    }
}
