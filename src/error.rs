use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("unsupported event kind: {0}")]
    UnsupportedEventKind(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Non-fatal: the resolver fell back to the raw address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("identity resolution fell back to raw address {address}: {reason}")]
pub struct ResolutionAmbiguity {
    pub address: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Raised when a concurrent writer invalidated what this one read.
    #[error("persistence conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StabilizationError {
    #[error("media url expired or gone: {0}")]
    FetchExpired(String),
    #[error("media fetch failed: {0}")]
    FetchFailed(String),
    /// Encrypted CDN media with no gateway able to decrypt it.
    #[error("media cannot be decrypted: {0}")]
    Undecryptable(String),
    #[error("object storage failed: {0}")]
    StorageFailed(String),
    #[error("unsupported media kind: {0}")]
    UnsupportedMediaKind(String),
    #[error("message update failed: {0}")]
    Persistence(String),
}

impl StabilizationError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FetchFailed(_) | Self::StorageFailed(_) | Self::Persistence(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("reconcile gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}
