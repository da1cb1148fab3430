//! Cloud storage client and the upload relay.
//!
//! Talks to a disk-style REST API:
//!
//! | Step | Request | Success |
//! |------|---------|---------|
//! | create folder | `PUT {api}/resources?path=<p>` | `201`, or `409` when it already exists |
//! | upload link | `GET {api}/resources/upload?path=<p>&overwrite=true` | `{ "href", "method" }` |
//! | upload | `PUT <href>` with the raw bytes | any `2xx` |
//!
//! [`StorageClient::relay_upload`] runs those steps in order for
//! `<root>/<id>/<filename>` and returns the public URL of the stored file.
//! The first failing step aborts the upload; nothing is retried.
//!
//! # Environment Variables
//!
//! - the variable named by `[storage].token_env` (default `KB_STORAGE_TOKEN`)
//!   holds the OAuth token sent as `Authorization: OAuth <token>`.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::backend;
use crate::config::{Config, StorageConfig};
use crate::crud::CrudService;
use crate::models::{id_value, Entity, Record};

/// Upload target returned by the storage API.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadLink {
    pub href: String,
    #[serde(default = "default_method")]
    pub method: String,
}

fn default_method() -> String {
    "PUT".to_string()
}

pub struct StorageClient {
    client: reqwest::Client,
    api_url: String,
    token: String,
    root: String,
    public_base_url: String,
}

impl StorageClient {
    pub fn new(
        api_url: &str,
        token: &str,
        root: &str,
        public_base_url: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            root: root.trim_matches('/').to_string(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        if !config.is_configured() {
            bail!("storage is disabled: set [storage].api_url in config");
        }
        let token = std::env::var(&config.token_env)
            .with_context(|| format!("{} environment variable not set", config.token_env))?;
        Self::new(
            &config.api_url,
            &token,
            &config.root_folder,
            &config.public_base_url,
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("OAuth {}", self.token))
    }

    /// Create a folder; an existing folder counts as success.
    pub async fn create_folder(&self, path: &str) -> Result<()> {
        let resp = self
            .auth(self.client.put(format!("{}/resources", self.api_url)))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| anyhow!("Failed to create folder {}: {}", path, e))?;

        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            tracing::debug!(path, %status, "folder ready");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        bail!(
            "storage folder creation failed (HTTP {}) for '{}': {}",
            status,
            path,
            body.chars().take(500).collect::<String>()
        )
    }

    /// Ask the API where to send the bytes for `path`.
    pub async fn upload_url(&self, path: &str) -> Result<UploadLink> {
        let resp = self
            .auth(self.client.get(format!("{}/resources/upload", self.api_url)))
            .query(&[("path", path), ("overwrite", "true")])
            .send()
            .await
            .map_err(|e| anyhow!("Failed to get upload URL for {}: {}", path, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "storage upload URL request failed (HTTP {}) for '{}': {}",
                status,
                path,
                body.chars().take(500).collect::<String>()
            );
        }
        resp.json::<UploadLink>()
            .await
            .with_context(|| format!("Failed to decode upload URL response for {}", path))
    }

    /// Send the file body to a link returned by [`upload_url`](Self::upload_url).
    pub async fn put_bytes(&self, link: &UploadLink, bytes: Vec<u8>) -> Result<()> {
        let method = reqwest::Method::from_bytes(link.method.to_ascii_uppercase().as_bytes())
            .with_context(|| format!("invalid upload method: {}", link.method))?;
        let size = bytes.len();
        let resp = self
            .client
            .request(method, &link.href)
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to upload file: {}", e))?;

        if !resp.status().is_success() {
            bail!("storage upload failed (HTTP {})", resp.status());
        }
        tracing::debug!(size, "bytes uploaded");
        Ok(())
    }

    /// Store `bytes` as `<root>/<id>/<filename>` and return its public URL.
    pub async fn relay_upload(&self, id: &str, filename: &str, bytes: Vec<u8>) -> Result<String> {
        let id = sanitize_segment(id);
        let filename = sanitize_segment(filename);
        if id.is_empty() {
            bail!("invalid upload: id must not be empty");
        }
        if filename.is_empty() {
            bail!("invalid upload: filename must not be empty");
        }

        let folder = format!("{}/{}", self.root, id);
        let path = format!("{}/{}", folder, filename);

        self.create_folder(&self.root).await?;
        self.create_folder(&folder).await?;
        let link = self.upload_url(&path).await?;
        self.put_bytes(&link, bytes).await?;

        let url = public_url(&self.public_base_url, &path);
        tracing::info!(path, url, "upload relayed");
        Ok(url)
    }
}

/// Make a single path segment safe: separators, control characters and
/// `..` are replaced with `_`, surrounding whitespace is dropped.
pub fn sanitize_segment(s: &str) -> String {
    let cleaned: String = s
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Public URL of a stored path with each segment percent-encoded.
pub fn public_url(base: &str, path: &str) -> String {
    let encoded = path
        .split('/')
        .map(uri_encode)
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/{}", base.trim_end_matches('/'), encoded)
}

/// Percent-encode everything except RFC 3986 unreserved characters.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

// ============ CLI entry point ============

/// Upload a local file for `id`; with `attach`, also add it to that entry's
/// media list.
pub async fn run_upload(config: &Config, id: &str, file: &Path, attach: bool) -> Result<()> {
    let storage = StorageClient::from_config(&config.storage)?;
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("invalid upload: no file name in {}", file.display()))?
        .to_string();
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let url = storage.relay_upload(id, &filename, bytes).await?;
    println!("url: {}", url);

    if attach {
        let backend: Arc<dyn backend::Backend> = backend::connect(config)?;
        let media = CrudService::new(backend, Entity::Media);
        let mut fields = Record::new();
        fields.set("entry_id", id_value(id));
        fields.set("name", filename);
        fields.set("url", url);
        let created = media.create(fields).await?;
        println!("media: {}", created.id().unwrap_or_default());
    }
    Ok(())
}
