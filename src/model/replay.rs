use crate::{
    database::{
        db_structs::{Game, Player, Rating, RatingSnapshot},
        RatingStore
    },
    error::ProcessorError,
    model::{
        bradley_terry::{solve, SolverSettings},
        confidence::{component_ml_ratings, rate, unrated, BlendSettings, BlendedRating},
        constants::ALGORITHM_VERSION,
        graph::ComparisonGraph
    },
    utils::progress_utils::progress_span
};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

#[derive(Debug, Clone, PartialEq)]
pub struct ReplaySettings {
    pub solver: SolverSettings,
    pub blend: BlendSettings,
    pub algorithm_version: String
}

impl Default for ReplaySettings {
    fn default() -> Self {
        ReplaySettings {
            solver: SolverSettings::default(),
            blend: BlendSettings::default(),
            algorithm_version: ALGORITHM_VERSION.to_owned()
        }
    }
}

/// A checkpoint whose solve hit the iteration cap. Its ratings are still published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceWarning {
    pub checkpoint: NaiveDate,
    pub iterations: usize,
    pub max_delta: f64
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerResult {
    pub player_id: i64,
    pub rating: BlendedRating,
    pub total_wins: i32,
    pub total_losses: i32
}

/// Ratings of every player with at least one game as of one checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointResult {
    pub checkpoint: NaiveDate,
    pub players: Vec<PlayerResult>,
    pub iterations: usize,
    pub converged: bool,
    pub max_delta: f64,
    /// Undefeated or winless players, rated at the edge of the scale
    pub saturated_players: usize
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplayOutput {
    pub checkpoints: Vec<NaiveDate>,
    pub snapshots: Vec<RatingSnapshot>,
    pub ratings: Vec<Rating>,
    pub convergence_warnings: Vec<ConvergenceWarning>
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecomputeReport {
    pub players_rated: usize,
    pub checkpoints_written: usize,
    pub snapshots_written: usize,
    pub convergence_warnings: Vec<ConvergenceWarning>
}

pub fn sunday_on_or_after(date: NaiveDate) -> NaiveDate {
    let days_until_sunday = (7 - date.weekday().num_days_from_sunday() as i64) % 7;

    date + Duration::days(days_until_sunday)
}

/// Last instant that still belongs to `date`
pub fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(23, 59, 59)
        .map(|dt| dt.and_utc())
        .unwrap_or_else(|| date.and_time(Default::default()).and_utc())
}

/// Every Sunday from the first Sunday on or after `first` to the first Sunday on or after `last`
pub fn weekly_checkpoints(first: NaiveDate, last: NaiveDate) -> Vec<NaiveDate> {
    let end = sunday_on_or_after(last);

    std::iter::successors(Some(sunday_on_or_after(first)), |d| Some(*d + Duration::weeks(1)))
        .take_while(|d| *d <= end)
        .collect()
}

/// Rates everyone who played on or before the end of `checkpoint`. Pure: depends only on
/// `games` and `settings`.
pub fn rate_checkpoint(games: &[Game], checkpoint: NaiveDate, settings: &ReplaySettings) -> CheckpointResult {
    let graph = ComparisonGraph::build(games, end_of_day(checkpoint));
    let solution = solve(&graph.comparisons, &graph.wins, graph.len(), &settings.solver);
    let ml_ratings = component_ml_ratings(
        &solution.log_strengths,
        &graph.components(),
        &solution.saturation,
        &settings.blend
    );

    let players = graph
        .player_ids()
        .enumerate()
        .map(|(i, player_id)| PlayerResult {
            player_id,
            rating: rate(ml_ratings[i], graph.games_played[i], &settings.blend),
            total_wins: graph.total_wins[i],
            total_losses: graph.total_losses[i]
        })
        .collect();

    CheckpointResult {
        checkpoint,
        players,
        iterations: solution.iterations,
        converged: solution.converged,
        max_delta: solution.max_delta,
        saturated_players: solution.saturated_count()
    }
}

/// Replays the whole game history week by week.
///
/// Checkpoints are independent of each other and solved in parallel, then published in
/// ascending order. The current ratings come from the final checkpoint; `known_players`
/// without any game get the unrated starter row.
pub fn replay(
    games: &[Game],
    known_players: &[Player],
    computed_at: DateTime<Utc>,
    settings: &ReplaySettings
) -> ReplayOutput {
    let games = games
        .iter()
        .cloned()
        .sorted_by_key(|g| (g.played_at, g.source_match_id, g.ordinal))
        .collect_vec();

    let (Some(first), Some(last)) = (games.first(), games.last()) else {
        return ReplayOutput::default();
    };

    let checkpoints = weekly_checkpoints(first.played_at.date_naive(), last.played_at.date_naive());
    info!(
        "Replaying {} games over {} weekly checkpoints ({} to {})",
        games.len(),
        checkpoints.len(),
        checkpoints.first().map(|d| d.to_string()).unwrap_or_default(),
        checkpoints.last().map(|d| d.to_string()).unwrap_or_default()
    );

    let span = progress_span(checkpoints.len() as u64, "Replaying checkpoints");
    let _enter = span.enter();

    let results: Vec<CheckpointResult> = checkpoints
        .par_iter()
        .map(|checkpoint| {
            let cutoff = end_of_day(*checkpoint);
            let included = games.partition_point(|g| g.played_at <= cutoff);
            let result = rate_checkpoint(&games[..included], *checkpoint, settings);

            span.pb_inc(1);
            result
        })
        .collect();

    let mut snapshots = Vec::new();
    let mut convergence_warnings = Vec::new();
    // Highest rating per player and the first checkpoint it was reached on
    let mut best: HashMap<i64, (f64, NaiveDate)> = HashMap::new();

    for result in &results {
        if result.saturated_players > 0 {
            debug!(
                checkpoint = %result.checkpoint,
                saturated = result.saturated_players,
                "Undefeated or winless players pinned at the strength bounds"
            );
        }

        if !result.converged {
            warn!(
                checkpoint = %result.checkpoint,
                iterations = result.iterations,
                max_delta = result.max_delta,
                "Solver hit the iteration cap"
            );
            convergence_warnings.push(ConvergenceWarning {
                checkpoint: result.checkpoint,
                iterations: result.iterations,
                max_delta: result.max_delta
            });
        }

        for p in &result.players {
            snapshots.push(RatingSnapshot {
                player_id: p.player_id,
                checkpoint: result.checkpoint,
                rating: p.rating.rating,
                games_played: p.rating.games_played,
                confidence: p.rating.confidence,
                algorithm_version: settings.algorithm_version.clone()
            });

            let entry = best.entry(p.player_id).or_insert((p.rating.rating, result.checkpoint));
            if p.rating.rating > entry.0 {
                *entry = (p.rating.rating, result.checkpoint);
            }
        }
    }

    let mut ratings: BTreeMap<i64, Rating> = BTreeMap::new();
    if let Some(latest) = results.last() {
        for p in &latest.players {
            let best = best.get(&p.player_id);
            ratings.insert(
                p.player_id,
                Rating {
                    player_id: p.player_id,
                    rating: p.rating.rating,
                    games_played: p.rating.games_played,
                    total_wins: p.total_wins,
                    total_losses: p.total_losses,
                    confidence: p.rating.confidence,
                    best_rating: best.map(|b| b.0),
                    best_rating_date: best.map(|b| b.1),
                    algorithm_version: settings.algorithm_version.clone(),
                    computed_at
                }
            );
        }
    }

    let sentinel = unrated(&settings.blend);
    for player in known_players {
        ratings.entry(player.external_id).or_insert_with(|| Rating {
            player_id: player.external_id,
            rating: sentinel.rating,
            games_played: 0,
            total_wins: 0,
            total_losses: 0,
            confidence: sentinel.confidence,
            best_rating: None,
            best_rating_date: None,
            algorithm_version: settings.algorithm_version.clone(),
            computed_at
        });
    }

    ReplayOutput {
        checkpoints,
        snapshots,
        ratings: ratings.into_values().collect(),
        convergence_warnings
    }
}

/// Rebuilds the full snapshot history and the current ratings from the stored games.
///
/// Games after `as_of` (end of day) are ignored. The snapshot set is swapped in one
/// transaction; if that fails the previous history stays in place and current ratings
/// are not touched.
pub async fn recompute<S: RatingStore>(
    store: &S,
    as_of: Option<NaiveDate>,
    settings: &ReplaySettings
) -> Result<RecomputeReport, ProcessorError> {
    store.health_check().await.map_err(ProcessorError::StoreUnavailable)?;

    let games = store.load_games(as_of.map(end_of_day)).await?;
    if games.is_empty() {
        warn!("No games to rate, keeping the existing snapshot set");
        return Ok(RecomputeReport::default());
    }

    let players = store.load_players().await?;
    let computed_at = Utc::now();
    let replay_settings = settings.clone();
    let output =
        tokio::task::spawn_blocking(move || replay(&games, &players, computed_at, &replay_settings)).await?;

    store
        .replace_snapshots(&output.snapshots)
        .await
        .map_err(ProcessorError::CommitFailed)?;
    store.upsert_ratings(&output.ratings).await?;

    let report = RecomputeReport {
        players_rated: output.ratings.iter().filter(|r| r.games_played > 0).count(),
        checkpoints_written: output.checkpoints.len(),
        snapshots_written: output.snapshots.len(),
        convergence_warnings: output.convergence_warnings
    };

    info!(
        players_rated = report.players_rated,
        checkpoints = report.checkpoints_written,
        snapshots = report.snapshots_written,
        warnings = report.convergence_warnings.len(),
        "Recompute complete ({})",
        settings.algorithm_version
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use crate::{
        database::db_structs::Player,
        model::{
            bradley_terry::SolverSettings,
            replay::{
                end_of_day, rate_checkpoint, replay, sunday_on_or_after, weekly_checkpoints, CheckpointResult,
                ReplaySettings
            },
            structures::confidence_tier::ConfidenceTier
        },
        utils::test_utils::{generate_match_games, generate_season}
    };
    use approx::assert_abs_diff_eq;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_sunday_on_or_after() {
        // 2024-03-15 is a Friday
        assert_eq!(sunday_on_or_after(date(2024, 3, 15)), date(2024, 3, 17));
        assert_eq!(sunday_on_or_after(date(2024, 3, 17)), date(2024, 3, 17));
        assert_eq!(sunday_on_or_after(date(2024, 3, 18)), date(2024, 3, 24));
    }

    #[test]
    fn test_weekly_checkpoints_cover_history() {
        let checkpoints = weekly_checkpoints(date(2024, 3, 15), date(2024, 4, 2));

        assert_eq!(
            checkpoints,
            vec![date(2024, 3, 17), date(2024, 3, 24), date(2024, 3, 31), date(2024, 4, 7)]
        );
    }

    #[test]
    fn test_checkpoint_excludes_later_games() {
        let mut games = generate_match_games(1, 10, 100, 200, 3, 1, Utc.with_ymd_and_hms(2024, 3, 16, 20, 0, 0).unwrap());
        games.extend(generate_match_games(1, 11, 100, 300, 2, 2, Utc.with_ymd_and_hms(2024, 3, 18, 20, 0, 0).unwrap()));

        let result = rate_checkpoint(&games, date(2024, 3, 17), &ReplaySettings::default());

        assert_eq!(result.players.iter().map(|p| p.player_id).collect::<Vec<_>>(), vec![100, 200]);
        assert_eq!(result.players[0].rating.games_played, 4);
        assert!(result.players[0].rating.rating > 500.0);
        assert!(result.players[1].rating.rating < 500.0);
    }

    #[test]
    fn test_undefeated_newcomer_does_not_move_uninvolved_players() {
        let evening = Utc.with_ymd_and_hms(2024, 3, 15, 19, 0, 0).unwrap();
        let mut games = generate_match_games(1, 10, 100, 200, 5, 5, evening);
        games.extend(generate_match_games(1, 11, 200, 300, 5, 5, evening));
        games.extend(generate_match_games(1, 12, 100, 300, 5, 5, evening));
        let before = rate_checkpoint(&games, date(2024, 3, 17), &ReplaySettings::default());

        games.extend(generate_match_games(1, 13, 400, 100, 1, 0, evening));
        let after = rate_checkpoint(&games, date(2024, 3, 17), &ReplaySettings::default());

        let rating_of = |result: &CheckpointResult, id| {
            result.players.iter().find(|p| p.player_id == id).unwrap().rating.rating
        };
        assert!(before.converged);
        assert!(after.converged);
        assert_eq!(after.saturated_players, 1);
        assert_abs_diff_eq!(rating_of(&after, 200), 500.0, epsilon = 1e-6);
        assert_abs_diff_eq!(rating_of(&after, 300), 500.0, epsilon = 1e-6);
        assert_abs_diff_eq!(rating_of(&after, 200), rating_of(&before, 200), epsilon = 1e-6);
        assert!(rating_of(&after, 400) > 500.0);
    }

    #[test]
    fn test_replay_snapshots_and_current_ratings() {
        let games = generate_season(12, 30, Utc.with_ymd_and_hms(2024, 1, 3, 19, 0, 0).unwrap());
        let players = vec![Player {
            external_id: 999_999,
            name: "Never Played".to_owned()
        }];

        let output = replay(&games, &players, Utc::now(), &ReplaySettings::default());

        assert!(!output.checkpoints.is_empty());
        assert!(output.snapshots.iter().all(|s| s.algorithm_version == "bt-mm-v1"));
        assert!(output.snapshots.iter().all(|s| s.rating >= 0.0 && s.rating <= 2000.0));
        assert!(output.snapshots.iter().all(|s| s.games_played > 0));
        assert!(output.snapshots.iter().all(|s| s.player_id != 999_999));

        let last = *output.checkpoints.last().unwrap();
        let latest = output.snapshots.iter().filter(|s| s.checkpoint == last).count();
        assert_eq!(latest, output.ratings.len() - 1);

        let idle = output.ratings.iter().find(|r| r.player_id == 999_999).unwrap();
        assert_eq!(idle.rating, 500.0);
        assert_eq!(idle.confidence, ConfidenceTier::Unranked);
        assert_eq!(idle.games_played, 0);

        for rating in output.ratings.iter().filter(|r| r.games_played > 0) {
            assert_eq!(rating.total_wins + rating.total_losses, rating.games_played);
            assert!(rating.best_rating.unwrap() >= rating.rating);
            assert!(rating.best_rating_date.unwrap() <= last);
        }
    }

    #[test]
    fn test_replay_is_deterministic() {
        let games = generate_season(10, 20, Utc.with_ymd_and_hms(2023, 6, 1, 19, 0, 0).unwrap());
        let computed_at = Utc::now();
        let mut shuffled = games.clone();
        shuffled.reverse();

        let first = replay(&games, &[], computed_at, &ReplaySettings::default());
        let second = replay(&shuffled, &[], computed_at, &ReplaySettings::default());

        assert_eq!(first, second);
    }

    #[test]
    fn test_capped_solves_are_reported() {
        let games = generate_season(8, 10, Utc.with_ymd_and_hms(2024, 1, 3, 19, 0, 0).unwrap());
        let settings = ReplaySettings {
            solver: SolverSettings {
                max_iterations: 1,
                ..SolverSettings::default()
            },
            ..ReplaySettings::default()
        };

        let output = replay(&games, &[], Utc::now(), &settings);

        assert!(!output.convergence_warnings.is_empty());
        assert!(output.convergence_warnings.iter().all(|w| w.iterations == 1));
        assert!(!output.snapshots.is_empty());
    }

    #[test]
    fn test_empty_history() {
        let output = replay(&[], &[], Utc::now(), &ReplaySettings::default());

        assert!(output.checkpoints.is_empty());
        assert!(output.snapshots.is_empty());
        assert!(output.ratings.is_empty());
    }

    #[test]
    fn test_end_of_day() {
        assert_eq!(
            end_of_day(date(2024, 3, 17)),
            Utc.with_ymd_and_hms(2024, 3, 17, 23, 59, 59).unwrap()
        );
    }
}
