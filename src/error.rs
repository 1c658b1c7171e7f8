use crate::{
    database::StoreError,
    ingest::{cache::CacheError, source::SourceError}
};
use thiserror::Error;

/// Failures that stop a whole `ingest` or `recompute` run
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("cache unavailable: {0}")]
    CacheUnavailable(#[source] CacheError),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The new snapshot set could not be committed; the previous set is still in place
    #[error("snapshot commit failed: {0}")]
    CommitFailed(#[source] StoreError),

    /// The HTTP client for the results service could not be built
    #[error("results source: {0}")]
    Source(#[from] SourceError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError)
}
