//! Durable object storage for stabilized media.

use crate::config::{expand_tilde, StorageConfig};
use crate::types::MessageKind;
use async_trait::async_trait;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{multipart, Client, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

const KEY_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct StorageError(pub String);

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self(err.to_string())
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        Self(err.to_string())
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` under `key` and returns the public url. Overwrites an existing object.
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<String, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    fn url_for(&self, key: &str) -> String;

    /// True for urls this store handed out.
    fn is_durable_url(&self, url: &str) -> bool;
}

/// `{instance}/{external_id}.{ext}`. Both segments are percent-encoded so distinct ids
/// never collide on disk or in a bucket.
pub fn media_key(instance: &str, external_id: &str, kind: MessageKind, mime: Option<&str>) -> String {
    format!(
        "{}/{}.{}",
        utf8_percent_encode(instance, KEY_SEGMENT),
        utf8_percent_encode(external_id, KEY_SEGMENT),
        extension_for(kind, mime)
    )
}

pub fn extension_for(kind: MessageKind, mime: Option<&str>) -> &'static str {
    let essence = mime
        .and_then(|m| m.split(';').next())
        .map(|m| m.trim().to_ascii_lowercase());
    match essence.as_deref() {
        Some("image/jpeg") | Some("image/jpg") => "jpg",
        Some("image/png") => "png",
        Some("image/webp") => "webp",
        Some("image/gif") => "gif",
        Some("video/mp4") => "mp4",
        Some("video/3gpp") => "3gp",
        Some("audio/ogg") => "ogg",
        Some("audio/mpeg") => "mp3",
        Some("audio/mp4") | Some("audio/aac") => "m4a",
        Some("application/pdf") => "pdf",
        _ => match kind {
            MessageKind::Image => "jpg",
            MessageKind::Video => "mp4",
            MessageKind::Audio => "ogg",
            MessageKind::Sticker => "webp",
            _ => "bin",
        },
    }
}

pub fn content_type_for_extension(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "3gp" => "video/3gpp",
        "ogg" => "audio/ogg",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn public_url(base: &str, key: &str) -> String {
    // Keys are already percent-encoded; only the escape character needs escaping again.
    format!("{}/{}", base.trim_end_matches('/'), key.replace('%', "%25"))
}

fn is_under(base: &str, url: &str) -> bool {
    let base = base.trim_end_matches('/');
    !base.is_empty() && url.starts_with(base) && url[base.len()..].starts_with('/')
}

/// Writes objects below a local directory served under `public_base_url`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a key to a path under the root, rejecting traversal.
    pub fn path_for(&self, key: &str) -> Option<PathBuf> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
                return None;
            }
            path.push(segment);
        }
        Some(path)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Bytes, _content_type: &str) -> Result<String, StorageError> {
        let path = self
            .path_for(key)
            .ok_or_else(|| StorageError(format!("invalid object key {key}")))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so a reader never sees a partial object.
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(self.url_for(key))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.path_for(key) {
            Some(path) => Ok(tokio::fs::try_exists(path).await?),
            None => Ok(false),
        }
    }

    fn url_for(&self, key: &str) -> String {
        public_url(&self.public_base_url, key)
    }

    fn is_durable_url(&self, url: &str) -> bool {
        is_under(&self.public_base_url, url)
    }
}

/// Uploads objects to a remote media service with a multipart POST.
#[derive(Clone)]
pub struct HttpObjectStore {
    client: Client,
    upload_url: String,
    public_base_url: String,
    api_token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(
        client: Client,
        upload_url: impl Into<String>,
        public_base_url: impl Into<String>,
        api_token: Option<String>,
    ) -> Self {
        Self {
            client,
            upload_url: upload_url.into(),
            public_base_url: public_base_url.into(),
            api_token,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<String, StorageError> {
        let file_name = key.rsplit('/').next().unwrap_or(key).to_string();
        let part = multipart::Part::bytes(bytes.to_vec())
            .file_name(file_name)
            .mime_str(content_type)?;
        let form = multipart::Form::new()
            .text("key", key.to_string())
            .part("file", part);

        let mut req = self.client.post(&self.upload_url).multipart(form);
        if let Some(token) = self.api_token.as_ref() {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError(format!("upload failed with {status}: {body}")));
        }

        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        Ok(body
            .get("url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.url_for(key)))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let resp = self.client.head(self.url_for(key)).send().await?;
        match resp.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Ok(false),
            status => Err(StorageError(format!("existence check failed with {status}"))),
        }
    }

    fn url_for(&self, key: &str) -> String {
        public_url(&self.public_base_url, key)
    }

    fn is_durable_url(&self, url: &str) -> bool {
        is_under(&self.public_base_url, url)
    }
}

pub fn build_object_store(cfg: &StorageConfig, client: Client) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match cfg.backend.as_str() {
        "fs" => Ok(Arc::new(FsObjectStore::new(
            expand_tilde(&cfg.root_dir),
            cfg.public_base_url.clone(),
        ))),
        "http" => {
            let upload_url = cfg
                .upload_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("storage.upload_url is required for the http backend"))?;
            Ok(Arc::new(HttpObjectStore::new(
                client,
                upload_url,
                cfg.public_base_url.clone(),
                cfg.api_token.clone(),
            )))
        }
        other => anyhow::bail!("unknown storage backend {other}"),
    }
}
