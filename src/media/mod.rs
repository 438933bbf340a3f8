pub mod fetch;
pub mod stabilizer;
pub mod storage;
pub mod transform;

pub use fetch::{AuthContext, FetchError, HttpMediaFetcher, MediaFetcher, MediaSource};
pub use stabilizer::{MediaStabilizer, StabilizationOutcome, StabilizedMedia, StabilizerSettings};
pub use storage::{media_key, FsObjectStore, HttpObjectStore, ObjectStore, StorageError};
