pub mod cache;
pub mod discovery;
pub mod fetcher;
pub mod rate_limiter;
pub mod source;

use crate::{
    database::RatingStore,
    error::ProcessorError,
    model::normalizer::{
        normalize_payload, ExcludedTournament, MatchRejection, NormalizeError, Normalized, NormalizedTournament
    },
    utils::progress_utils::progress_span
};
use cache::{NormalizedCorpus, TwoTierCache};
use chrono::Utc;
use discovery::discover_venue;
use fetcher::fetch_tournament;
use itertools::Itertools;
use rate_limiter::RateLimiter;
use serde::{Deserialize, Serialize};
use source::{default_venues, ResultsSource, SourceSettings, VenueConfig};
use std::{
    collections::BTreeSet,
    sync::atomic::{AtomicBool, Ordering}
};
use strum_macros::{AsRefStr, Display};
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

#[derive(Debug, Clone, PartialEq)]
pub struct IngestSettings {
    pub venues: Vec<VenueConfig>,
    pub source: SourceSettings,
    /// Drop the normalized tier first so everything is discovered and normalized again
    pub refresh: bool
}

impl Default for IngestSettings {
    fn default() -> Self {
        IngestSettings {
            venues: default_venues(),
            source: SourceSettings::default(),
            refresh: false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum IssueKind {
    Discovery,
    Fetch,
    MalformedPayload,
    MalformedMatch,
    Integrity,
    Store
}

/// A problem with one venue, tournament or match. Never stops the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestIssue {
    pub kind: IssueKind,
    pub tournament_id: Option<i64>,
    pub match_id: Option<i64>,
    pub message: String
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IngestReport {
    pub new_tournaments: usize,
    pub new_games: u64,
    /// Tournaments skipped because of their discipline
    pub excluded: usize,
    pub from_cache: bool,
    pub cancelled: bool,
    pub errors: Vec<IngestIssue>
}

impl IngestReport {
    fn issue(&mut self, kind: IssueKind, tournament_id: Option<i64>, match_id: Option<i64>, message: String) {
        self.errors.push(IngestIssue {
            kind,
            tournament_id,
            match_id,
            message
        });
    }

    fn record_rejection(&mut self, tournament_id: i64, rejection: &MatchRejection) {
        let kind = match rejection {
            MatchRejection::Malformed { .. } => IssueKind::MalformedMatch,
            MatchRejection::Integrity(_) => IssueKind::Integrity
        };

        self.issue(kind, Some(tournament_id), rejection.match_id(), rejection.to_string());
    }
}

type PendingNormalization = (i64, JoinHandle<Result<Normalized, NormalizeError>>);

#[derive(Default)]
struct Collected {
    tournaments: Vec<NormalizedTournament>,
    excluded: Vec<ExcludedTournament>,
    fetch_failed: bool
}

/// Pulls new results from the source into the store.
///
/// 1. Both the cache and the store must be reachable, otherwise nothing is written.
/// 2. A normalized cache hit skips discovery, fetching and normalization.
/// 3. Otherwise venues are crawled, every id is fetched (raw cache first) and normalized.
///    Normalizing one payload overlaps with fetching the next.
/// 4. Tournaments are persisted oldest first. Games already stored are ignored.
///
/// The run can be cancelled between tournament ids through `cancel`. Per-item failures end
/// up in the report; only an unreachable cache or store is an error.
pub async fn ingest<S: ResultsSource, R: RatingStore>(
    source: &S,
    cache: &TwoTierCache,
    store: &R,
    settings: &IngestSettings,
    cancel: &AtomicBool
) -> Result<IngestReport, ProcessorError> {
    cache.health_check().await.map_err(ProcessorError::CacheUnavailable)?;
    store.health_check().await.map_err(ProcessorError::StoreUnavailable)?;

    if settings.refresh {
        cache.clear_normalized().await?;
    }

    let mut report = IngestReport::default();

    if let Some(corpus) = cache.get_normalized().await? {
        info!(
            "Using normalized cache from {} ({} tournaments)",
            corpus.created_at,
            corpus.tournaments.len()
        );
        report.from_cache = true;
        report.excluded = corpus.excluded.len();
        persist_all(store, &corpus.tournaments, &mut report).await;

        return Ok(report);
    }

    let listing_limiter = RateLimiter::new(
        settings.source.listing_base.clone(),
        settings.source.request_interval,
        settings.source.backoff.clone()
    );
    let api_limiter = RateLimiter::new(
        settings.source.api_base.clone(),
        settings.source.request_interval,
        settings.source.backoff.clone()
    );

    let mut ids = BTreeSet::new();
    for venue in &settings.venues {
        if cancel.load(Ordering::SeqCst) {
            report.cancelled = true;
            break;
        }

        let listing = discover_venue(source, &listing_limiter, venue, settings.source.max_pages).await;
        if let Some(e) = &listing.error {
            report.issue(IssueKind::Discovery, None, None, format!("venue {}: {}", venue.id, e));
        }
        ids.extend(listing.ids);
    }

    info!("Discovered {} tournaments across {} venues", ids.len(), settings.venues.len());

    let total = ids.len() as u64;
    let collected = fetch_all(source, &api_limiter, cache, ids, cancel, &mut report)
        .instrument(progress_span(total, "Fetching tournaments"))
        .await?;
    let Collected {
        tournaments,
        excluded,
        fetch_failed
    } = collected;

    report.excluded = excluded.len();
    persist_all(store, &tournaments, &mut report).await;

    // A partial corpus would hide the missing tournaments from every later run
    let complete = !report.cancelled && !fetch_failed && !report.errors.iter().any(|e| e.kind == IssueKind::Discovery);
    if complete {
        let corpus = NormalizedCorpus {
            created_at: Utc::now(),
            tournaments,
            excluded
        };
        cache.put_normalized(&corpus).await?;
    } else {
        warn!("Run incomplete, normalized cache not updated");
    }

    info!(
        new_tournaments = report.new_tournaments,
        new_games = report.new_games,
        excluded = report.excluded,
        issues = report.errors.len(),
        "Ingest complete"
    );

    Ok(report)
}

/// Fetches every id in ascending order, one network call at a time, keeping at most one
/// normalization running alongside.
async fn fetch_all<S: ResultsSource>(
    source: &S,
    api_limiter: &RateLimiter,
    cache: &TwoTierCache,
    ids: BTreeSet<i64>,
    cancel: &AtomicBool,
    report: &mut IngestReport
) -> Result<Collected, ProcessorError> {
    let mut collected = Collected::default();
    let mut pending: Option<PendingNormalization> = None;

    for id in ids {
        if report.cancelled || cancel.load(Ordering::SeqCst) {
            warn!("Ingest cancelled before tournament {}", id);
            report.cancelled = true;
            break;
        }

        let fetched = fetch_tournament(source, api_limiter, cache, id).await;

        if let Some(previous) = pending.take() {
            collect(previous, &mut collected, report).await?;
        }

        match fetched {
            Ok(payload) => {
                let handle = tokio::task::spawn_blocking(move || normalize_payload(&payload.bytes));
                pending = Some((id, handle));
            }
            Err(e) => {
                collected.fetch_failed = true;
                report.issue(IssueKind::Fetch, Some(id), None, e.to_string());
            }
        }

        Span::current().pb_inc(1);
    }

    if let Some(previous) = pending.take() {
        collect(previous, &mut collected, report).await?;
    }

    Ok(collected)
}

async fn collect(
    (id, handle): PendingNormalization,
    collected: &mut Collected,
    report: &mut IngestReport
) -> Result<(), ProcessorError> {
    match handle.await? {
        Ok(Normalized::Tournament(t)) => {
            for rejection in &t.rejected {
                report.record_rejection(t.tournament.external_id, rejection);
            }
            collected.tournaments.push(t);
        }
        Ok(Normalized::Excluded(e)) => collected.excluded.push(e),
        Err(e) => {
            warn!(tournament_id = id, "Unusable payload: {}", e);
            report.issue(IssueKind::MalformedPayload, Some(id), None, e.to_string());
        }
    }

    Ok(())
}

/// Stores tournaments in (start date, id) order. A failure only affects its own tournament.
async fn persist_all<R: RatingStore>(store: &R, tournaments: &[NormalizedTournament], report: &mut IngestReport) {
    let ordered = tournaments
        .iter()
        .sorted_by_key(|t| (t.tournament.start_date, t.tournament.external_id))
        .collect_vec();

    for t in ordered {
        match store.store_tournament(&t.players, &t.tournament, &t.games).await {
            Ok((is_new, inserted)) => {
                if is_new {
                    report.new_tournaments += 1;
                }
                report.new_games += inserted;
            }
            Err(e) => {
                warn!(tournament_id = t.tournament.external_id, "Failed to store tournament: {}", e);
                report.issue(IssueKind::Store, Some(t.tournament.external_id), None, e.to_string());
            }
        }
    }
}
