//! Moves gateway-hosted media into durable storage and repoints the message at it.

use crate::backfill::compute_backoff;
use crate::config::MediaConfig;
use crate::db::{ConversationStore, MediaState, MessageRecord};
use crate::error::StabilizationError;
use crate::media::fetch::{AuthContext, FetchError, MediaFetcher, MediaSource};
use crate::media::storage::{media_key, ObjectStore};
use crate::media::transform::{normalize_media, TransformLimits};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct StabilizerSettings {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
    pub deadline: Duration,
    pub limits: TransformLimits,
}

impl From<&MediaConfig> for StabilizerSettings {
    fn from(cfg: &MediaConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_backoff: Duration::from_millis(cfg.base_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            attempt_timeout: Duration::from_secs(cfg.attempt_timeout_secs),
            deadline: Duration::from_secs(cfg.deadline_secs),
            limits: TransformLimits {
                max_image_dimension: cfg.max_image_dimension,
                max_sticker_dimension: cfg.max_sticker_dimension,
            },
        }
    }
}

impl Default for StabilizerSettings {
    fn default() -> Self {
        Self::from(&MediaConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StabilizedMedia {
    pub url: String,
    /// Object key written by this call; `None` when nothing was uploaded.
    pub key: Option<String>,
    pub already_stable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StabilizationOutcome {
    Stabilized(StabilizedMedia),
    Failed {
        error: StabilizationError,
        attempts: u32,
    },
}

impl StabilizationOutcome {
    pub fn is_stabilized(&self) -> bool {
        matches!(self, Self::Stabilized(_))
    }
}

pub struct MediaStabilizer {
    store: Arc<dyn ConversationStore>,
    fetcher: Arc<dyn MediaFetcher>,
    objects: Arc<dyn ObjectStore>,
    auth: AuthContext,
    settings: StabilizerSettings,
}

impl MediaStabilizer {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        fetcher: Arc<dyn MediaFetcher>,
        objects: Arc<dyn ObjectStore>,
        auth: AuthContext,
        settings: StabilizerSettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            objects,
            auth,
            settings,
        }
    }

    pub fn settings(&self) -> &StabilizerSettings {
        &self.settings
    }

    /// One attempt. Safe to repeat: the stored record is reread, durable urls are left
    /// alone and an object already present under the message key is reused.
    pub async fn stabilize(&self, message: &MessageRecord) -> Result<StabilizedMedia, StabilizationError> {
        if !message.kind.carries_media() {
            return Err(StabilizationError::UnsupportedMediaKind(
                message.kind.as_str().to_string(),
            ));
        }

        let current = self
            .store
            .get_message(&message.id)
            .await
            .map_err(|err| StabilizationError::Persistence(err.to_string()))?
            .ok_or_else(|| StabilizationError::Persistence(format!("message {} is gone", message.id)))?;
        if current.media_url.is_none() && current.media_direct_path.is_none() {
            return Err(StabilizationError::UnsupportedMediaKind(format!(
                "{} without media reference",
                current.kind.as_str()
            )));
        }

        if let Some(url) = current.media_url.clone() {
            if current.media_state == MediaState::Stabilized || self.objects.is_durable_url(&url) {
                if current.media_state != MediaState::Stabilized {
                    self.repoint(&current, &url).await?;
                }
                return Ok(StabilizedMedia {
                    url,
                    key: None,
                    already_stable: true,
                });
            }
        }

        let key = media_key(
            &current.instance,
            &current.external_id,
            current.kind,
            current.media_mime.as_deref(),
        );
        let exists = self
            .objects
            .exists(&key)
            .await
            .map_err(|err| StabilizationError::StorageFailed(err.to_string()))?;
        if exists {
            let durable = self.objects.url_for(&key);
            self.repoint(&current, &durable).await?;
            debug!(message_id = %current.id, key = %key, "reusing stored media object");
            return Ok(StabilizedMedia {
                url: durable,
                key: None,
                already_stable: true,
            });
        }

        let bytes = self
            .fetcher
            .fetch(&MediaSource::from_record(&current), &self.auth)
            .await
            .map_err(|err| match err {
                FetchError::NotFound | FetchError::Expired => {
                    StabilizationError::FetchExpired(err.to_string())
                }
                FetchError::Undecryptable(reason) => StabilizationError::Undecryptable(reason),
                FetchError::Failed(reason) => StabilizationError::FetchFailed(reason),
            })?;

        let transformed = normalize_media(
            current.kind,
            bytes,
            current.media_mime.as_deref(),
            &self.settings.limits,
        )?;
        let durable = self
            .objects
            .put(&key, transformed.bytes, &transformed.content_type)
            .await
            .map_err(|err| StabilizationError::StorageFailed(err.to_string()))?;
        self.repoint(&current, &durable).await?;

        info!(
            message_id = %current.id,
            key = %key,
            animated = transformed.animated,
            reencoded = transformed.reencoded,
            "media stabilized"
        );
        Ok(StabilizedMedia {
            url: durable,
            key: Some(key),
            already_stable: false,
        })
    }

    /// Retries transient failures with exponential backoff, each attempt bounded by the
    /// attempt timeout and all of them by the overall deadline. Failures are recorded on
    /// the message and never returned as errors.
    pub async fn stabilize_with_retry(&self, message: &MessageRecord) -> StabilizationOutcome {
        let deadline = Instant::now() + self.settings.deadline;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let attempt_deadline = (Instant::now() + self.settings.attempt_timeout).min(deadline);
            let result = match timeout_at(attempt_deadline, self.stabilize(message)).await {
                Ok(result) => result,
                Err(_) => Err(StabilizationError::FetchFailed("attempt timed out".to_string())),
            };

            let err = match result {
                Ok(media) => return StabilizationOutcome::Stabilized(media),
                Err(err) => err,
            };

            if err.is_retryable() && attempt < self.settings.max_attempts {
                let delay = compute_backoff(attempt, self.settings.base_backoff, self.settings.max_backoff);
                if Instant::now() + delay < deadline {
                    debug!(message_id = %message.id, attempt, ?delay, "media stabilization retry: {err}");
                    sleep(delay).await;
                    continue;
                }
            }

            return self.give_up(message, err, attempt).await;
        }
    }

    /// Runs [`Self::stabilize_with_retry`] on its own task. Aborting the handle cancels it.
    pub fn spawn(self: &Arc<Self>, message: MessageRecord) -> JoinHandle<StabilizationOutcome> {
        let stabilizer = Arc::clone(self);
        tokio::spawn(async move { stabilizer.stabilize_with_retry(&message).await })
    }

    async fn repoint(&self, message: &MessageRecord, url: &str) -> Result<(), StabilizationError> {
        self.store
            .update_message_media(&message.id, url)
            .await
            .map_err(|err| StabilizationError::Persistence(err.to_string()))
    }

    async fn give_up(
        &self,
        message: &MessageRecord,
        error: StabilizationError,
        attempts: u32,
    ) -> StabilizationOutcome {
        warn!(
            message_id = %message.id,
            external_id = %message.external_id,
            attempts,
            retryable = error.is_retryable(),
            "media stabilization failed, keeping gateway url: {error}"
        );
        if let Err(err) = self
            .store
            .record_media_failure(&message.id, i64::from(attempts), &error.to_string())
            .await
        {
            error!(message_id = %message.id, "could not record media failure: {err}");
        }
        StabilizationOutcome::Failed { error, attempts }
    }
}
