use crate::ingest::{
    cache::{CacheError, TwoTierCache},
    rate_limiter::RateLimiter,
    source::{ResultsSource, SourceError}
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Cache(#[from] CacheError)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrigin {
    Cache,
    Network
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPayload {
    pub tournament_id: i64,
    pub bytes: Vec<u8>,
    pub origin: FetchOrigin
}

/// Returns the raw payload for one tournament, going to the network only when the raw
/// cache has no entry. Fresh payloads are cached before they are returned, so an
/// interrupted run never has to fetch them again.
pub async fn fetch_tournament<S: ResultsSource>(
    source: &S,
    limiter: &RateLimiter,
    cache: &TwoTierCache,
    tournament_id: i64
) -> Result<FetchedPayload, FetchError> {
    if let Some(bytes) = cache.get_raw(tournament_id).await? {
        debug!(tournament_id, "Raw cache hit");
        return Ok(FetchedPayload {
            tournament_id,
            bytes,
            origin: FetchOrigin::Cache
        });
    }

    let bytes = limiter
        .call(|| source.tournament_payload(tournament_id))
        .await
        .inspect_err(|e| warn!(tournament_id, "Failed to fetch tournament: {}", e))?;

    cache.put_raw(tournament_id, &bytes).await?;

    Ok(FetchedPayload {
        tournament_id,
        bytes,
        origin: FetchOrigin::Network
    })
}
