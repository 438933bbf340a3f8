use crate::db::MessageRecord;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Credentials attached to gateway-hosted media requests.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("media not found")]
    NotFound,
    #[error("media url expired")]
    Expired,
    #[error("{0}")]
    Undecryptable(String),
    #[error("{0}")]
    Failed(String),
}

/// Where a message's media lives upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaSource<'a> {
    pub instance: &'a str,
    pub external_id: &'a str,
    pub url: Option<&'a str>,
    pub direct_path: Option<&'a str>,
    pub media_key: Option<&'a str>,
    pub mime: Option<&'a str>,
}

impl<'a> MediaSource<'a> {
    pub fn from_record(record: &'a MessageRecord) -> Self {
        Self {
            instance: &record.instance,
            external_id: &record.external_id,
            url: record.media_url.as_deref(),
            direct_path: record.media_direct_path.as_deref(),
            media_key: record.media_key.as_deref(),
            mime: record.media_mime.as_deref(),
        }
    }

    /// WhatsApp CDN media is end-to-end encrypted; the media key is what unlocks it.
    pub fn is_encrypted(&self) -> bool {
        self.media_key.is_some()
    }
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Returns the plaintext bytes of the media.
    async fn fetch(&self, source: &MediaSource<'_>, auth: &AuthContext) -> Result<Bytes, FetchError>;
}

#[derive(Debug, Deserialize)]
struct DecryptedMedia {
    base64: String,
}

/// Plain urls are downloaded as-is. Encrypted media is requested already decrypted from
/// the gateway's `chat/getBase64FromMediaMessage` endpoint, by message id.
#[derive(Clone)]
pub struct HttpMediaFetcher {
    client: Client,
    gateway_base_url: Option<String>,
}

impl HttpMediaFetcher {
    pub fn new(client: Client, gateway_base_url: Option<String>) -> Self {
        Self {
            client,
            gateway_base_url: gateway_base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    fn is_gateway_url(&self, url: &str) -> bool {
        self.gateway_base_url
            .as_deref()
            .map(|base| url.starts_with(base))
            .unwrap_or(false)
    }

    fn with_api_key(req: RequestBuilder, auth: &AuthContext) -> RequestBuilder {
        match auth.api_key.as_ref() {
            Some(key) => req.header("apikey", key),
            None => req,
        }
    }

    async fn fetch_plain(&self, url: &str, auth: &AuthContext) -> Result<Bytes, FetchError> {
        let mut req = self.client.get(url);
        if self.is_gateway_url(url) {
            req = Self::with_api_key(req, auth);
        }
        let resp = send(req).await?;
        resp.bytes()
            .await
            .map_err(|err| FetchError::Failed(err.to_string()))
    }

    async fn fetch_decrypted(
        &self,
        source: &MediaSource<'_>,
        auth: &AuthContext,
    ) -> Result<Bytes, FetchError> {
        let base = self.gateway_base_url.as_deref().ok_or_else(|| {
            FetchError::Undecryptable("encrypted media needs gateway.base_url".to_string())
        })?;
        let url = format!(
            "{base}/chat/getBase64FromMediaMessage/{}",
            utf8_percent_encode(source.instance, NON_ALPHANUMERIC)
        );
        let req = self.client.post(url).json(&json!({
            "message": {"key": {"id": source.external_id}},
            "convertToMp4": false,
        }));
        let resp = send(Self::with_api_key(req, auth)).await?;
        let body: DecryptedMedia = resp
            .json()
            .await
            .map_err(|err| FetchError::Failed(format!("unreadable gateway media response: {err}")))?;
        decode_base64_payload(&body.base64).map(Bytes::from)
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, source: &MediaSource<'_>, auth: &AuthContext) -> Result<Bytes, FetchError> {
        if source.is_encrypted() {
            return self.fetch_decrypted(source, auth).await;
        }
        match source.url {
            Some(url) => self.fetch_plain(url, auth).await,
            None => Err(FetchError::NotFound),
        }
    }
}

async fn send(req: RequestBuilder) -> Result<Response, FetchError> {
    let resp = req
        .send()
        .await
        .map_err(|err| FetchError::Failed(err.to_string()))?;
    match resp.status() {
        // The gateway answers 400 for a message id it no longer holds.
        StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => Err(FetchError::NotFound),
        // The CDN answers 403/410 once a signed media url has lapsed.
        StatusCode::GONE | StatusCode::FORBIDDEN => Err(FetchError::Expired),
        status if !status.is_success() => {
            let body = resp.text().await.unwrap_or_default();
            Err(FetchError::Failed(format!("upstream returned {status}: {body}")))
        }
        _ => Ok(resp),
    }
}

/// Accepts bare base64 or a `data:<mime>;base64,` url.
fn decode_base64_payload(payload: &str) -> Result<Vec<u8>, FetchError> {
    let data = match payload.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => payload,
    };
    STANDARD
        .decode(data.trim())
        .map_err(|err| FetchError::Failed(format!("invalid base64 media: {err}")))
}
