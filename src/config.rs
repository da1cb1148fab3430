//! TOML configuration parsing and validation.
//!
//! Secrets (the database API key and the storage token) never live in the
//! file itself. The config names the environment variables that hold them,
//! and they are resolved when a client is built.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_key_env")]
    pub key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Memory backend only: JSON file the tables are loaded from and saved to.
    #[serde(default)]
    pub data_file: Option<PathBuf>,
}

fn default_kind() -> String {
    "rest".to_string()
}
fn default_key_env() -> String {
    "KB_SERVICE_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub api_url: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_root_folder")]
    pub root_folder: String,
    #[serde(default)]
    pub public_base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            token_env: default_token_env(),
            root_folder: default_root_folder(),
            public_base_url: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_token_env() -> String {
    "KB_STORAGE_TOKEN".to_string()
}
fn default_root_folder() -> String {
    "kb-media".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}
fn default_max_upload_bytes() -> usize {
    25 * 1024 * 1024
}

impl BackendConfig {
    pub fn is_memory(&self) -> bool {
        self.kind == "memory"
    }
}

impl StorageConfig {
    pub fn is_configured(&self) -> bool {
        !self.api_url.trim().is_empty()
    }
}

impl Config {
    /// A config with an empty in-memory backend and no storage.
    pub fn minimal() -> Self {
        Self {
            backend: BackendConfig {
                kind: "memory".to_string(),
                url: String::new(),
                key_env: default_key_env(),
                timeout_secs: default_timeout_secs(),
                data_file: None,
            },
            storage: StorageConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    match config.backend.kind.as_str() {
        "rest" => {
            if config.backend.url.trim().is_empty() {
                anyhow::bail!("backend.url must be set when backend.kind is 'rest'");
            }
        }
        "memory" => {}
        other => anyhow::bail!(
            "Unknown backend kind: '{}'. Must be rest or memory.",
            other
        ),
    }

    if config.backend.timeout_secs == 0 {
        anyhow::bail!("backend.timeout_secs must be > 0");
    }

    if config.storage.is_configured() {
        if config.storage.public_base_url.trim().is_empty() {
            anyhow::bail!("storage.public_base_url must be set when storage.api_url is set");
        }
        if config.storage.root_folder.trim_matches('/').is_empty() {
            anyhow::bail!("storage.root_folder must not be empty");
        }
        if config.storage.timeout_secs == 0 {
            anyhow::bail!("storage.timeout_secs must be > 0");
        }
    }

    if config.server.max_upload_bytes == 0 {
        anyhow::bail!("server.max_upload_bytes must be > 0");
    }

    Ok(())
}
