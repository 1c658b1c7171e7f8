//! Fixtures and in-process stand-ins for the results service and the database, so the
//! pipeline can run end to end in tests and benchmarks.

use crate::{
    database::{
        db_structs::{Game, Player, Rating, RatingSnapshot, Tournament},
        RatingStore, StoreError
    },
    ingest::source::{ResultsSource, SourceError, VenueConfig},
    model::confidence::win_probability
};
use chrono::{DateTime, Duration, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex, MutexGuard
    }
};

pub fn generate_game(
    tournament_id: i64,
    source_match_id: i64,
    ordinal: i32,
    player_a: i64,
    player_b: i64,
    winner: i64,
    played_at: DateTime<Utc>
) -> Game {
    Game {
        tournament_id,
        source_match_id,
        ordinal,
        player_a,
        player_b,
        winner,
        played_at
    }
}

/// The games of one match: `score_a` won by `player_a` followed by `score_b` won by `player_b`
pub fn generate_match_games(
    tournament_id: i64,
    source_match_id: i64,
    player_a: i64,
    player_b: i64,
    score_a: i32,
    score_b: i32,
    played_at: DateTime<Utc>
) -> Vec<Game> {
    (0..score_a + score_b)
        .map(|ordinal| {
            let winner = if ordinal < score_a { player_a } else { player_b };
            generate_game(tournament_id, source_match_id, ordinal, player_a, player_b, winner, played_at)
        })
        .collect()
}

/// One weekly tournament per week in which every player plays one race-to-5 match.
/// Player `1000 + i` is `i * 40` points stronger than player `1000`. Seeded, so the
/// same arguments always produce the same games.
pub fn generate_season(n_players: i64, n_weeks: i64, start: DateTime<Utc>) -> Vec<Game> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut games = Vec::new();
    let mut match_id = 0;

    for week in 0..n_weeks {
        let tournament_id = week + 1;

        for i in 0..n_players {
            let mut j = rng.random_range(0..n_players);
            if j == i {
                j = (i + 1) % n_players;
            }

            let (a, b) = (1000 + i, 1000 + j);
            let p_a = win_probability(i as f64 * 40.0, j as f64 * 40.0);
            let (mut score_a, mut score_b) = (0, 0);
            while score_a < 5 && score_b < 5 {
                if rng.random_bool(p_a) {
                    score_a += 1;
                } else {
                    score_b += 1;
                }
            }

            match_id += 1;
            let played_at = start + Duration::weeks(week) + Duration::minutes(i * 15);
            games.extend(generate_match_games(tournament_id, match_id, a, b, score_a, score_b, played_at));
        }
    }

    games
}

pub fn match_json(
    match_id: i64,
    player_a: (i64, &str),
    player_b: (i64, &str),
    score_a: i64,
    score_b: i64,
    starttime: &str
) -> Value {
    json!({
        "matchId": match_id,
        "playerA": {"playerId": player_a.0, "name": player_a.1},
        "playerB": {"playerId": player_b.0, "name": player_b.1},
        "scoreA": score_a,
        "scoreB": score_b,
        "starttime": starttime
    })
}

pub fn tournament_json(tournament_id: i64, discipline: &str, matches: Vec<Value>) -> Value {
    json!({
        "tournamentId": tournament_id,
        "name": format!("Tournament {}", tournament_id),
        "discipline": discipline,
        "starttime": "2024-03-15 18:00:00",
        "stoptime": "2024-03-15 23:30:00",
        "venues": [{"venueId": 57050170, "name": "Shooters"}],
        "matches": matches
    })
}

pub fn listing_html(tournament_ids: &[i64], has_next: bool) -> String {
    let mut html = String::from("<html><body><ul>");
    for id in tournament_ids {
        html.push_str(&format!(r#"<li><a href="/tournament/Weekly+{id}/{id}">Weekly {id}</a></li>"#));
    }
    html.push_str("</ul>");
    if has_next {
        html.push_str(r#"<a class="next" href="?page=next">Next &raquo;</a>"#);
    }
    html.push_str("</body></html>");

    html
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Serves scripted listing pages and payloads. Anything not scripted is a 404.
#[derive(Default)]
pub struct ScriptedSource {
    listings: HashMap<(i64, u32), String>,
    payloads: HashMap<i64, Vec<u8>>,
    transient_failures: Mutex<HashMap<i64, u32>>,
    payload_calls: Mutex<HashMap<i64, u32>>,
    listing_calls: AtomicU32
}

impl ScriptedSource {
    pub fn with_listing(mut self, venue_id: i64, page: u32, html: String) -> Self {
        self.listings.insert((venue_id, page), html);
        self
    }

    pub fn with_payload(mut self, tournament_id: i64, bytes: Vec<u8>) -> Self {
        self.payloads.insert(tournament_id, bytes);
        self
    }

    /// The next `count` requests for this tournament fail with a transient error
    pub fn with_transient_failures(self, tournament_id: i64, count: u32) -> Self {
        lock(&self.transient_failures).insert(tournament_id, count);
        self
    }

    pub fn payload_calls(&self, tournament_id: i64) -> u32 {
        lock(&self.payload_calls).get(&tournament_id).copied().unwrap_or(0)
    }

    pub fn total_payload_calls(&self) -> u32 {
        lock(&self.payload_calls).values().sum()
    }

    pub fn listing_calls(&self) -> u32 {
        self.listing_calls.load(Ordering::SeqCst)
    }

    fn not_found(what: String) -> SourceError {
        SourceError::Permanent {
            status: Some(404),
            message: what
        }
    }
}

impl ResultsSource for ScriptedSource {
    async fn listing_page(&self, venue: &VenueConfig, page: u32) -> Result<String, SourceError> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);

        self.listings
            .get(&(venue.id, page))
            .cloned()
            .ok_or_else(|| Self::not_found(format!("venue {} page {}", venue.id, page)))
    }

    async fn tournament_payload(&self, tournament_id: i64) -> Result<Vec<u8>, SourceError> {
        *lock(&self.payload_calls).entry(tournament_id).or_insert(0) += 1;

        if let Some(remaining) = lock(&self.transient_failures).get_mut(&tournament_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SourceError::Transient(format!("tournament {}: 503", tournament_id)));
            }
        }

        self.payloads
            .get(&tournament_id)
            .cloned()
            .ok_or_else(|| Self::not_found(format!("tournament {}", tournament_id)))
    }
}

#[derive(Default)]
struct MemoryState {
    players: BTreeMap<i64, Player>,
    tournaments: BTreeMap<i64, Tournament>,
    games: BTreeMap<(i64, i32), Game>,
    snapshots: Vec<RatingSnapshot>,
    ratings: BTreeMap<i64, Rating>
}

/// `RatingStore` kept in memory, with switches to simulate outages
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    fail_snapshot_commit: AtomicBool,
    fail_game_append: AtomicBool
}

impl MemoryStore {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_fail_snapshot_commit(&self, fail: bool) {
        self.fail_snapshot_commit.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_game_append(&self, fail: bool) {
        self.fail_game_append.store(fail, Ordering::SeqCst);
    }

    pub fn players(&self) -> Vec<Player> {
        lock(&self.state).players.values().cloned().collect()
    }

    pub fn tournaments(&self) -> Vec<Tournament> {
        lock(&self.state).tournaments.values().cloned().collect()
    }

    pub fn games(&self) -> Vec<Game> {
        lock(&self.state).games.values().cloned().collect()
    }

    pub fn snapshots(&self) -> Vec<RatingSnapshot> {
        lock(&self.state).snapshots.clone()
    }

    pub fn ratings(&self) -> Vec<Rating> {
        lock(&self.state).ratings.values().cloned().collect()
    }

    /// Stores `games` and a placeholder player for every participant, bypassing the
    /// outage switches
    pub fn seed_games(&self, games: &[Game]) {
        let mut state = lock(&self.state);
        for game in games {
            for id in [game.player_a, game.player_b] {
                state.players.entry(id).or_insert_with(|| Player {
                    external_id: id,
                    name: format!("Player {}", id)
                });
            }
            state.games.insert((game.source_match_id, game.ordinal), game.clone());
        }
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_owned()));
        }

        Ok(())
    }
}

impl RatingStore for MemoryStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn upsert_players(&self, players: &[Player]) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = lock(&self.state);
        for p in players {
            state.players.insert(p.external_id, p.clone());
        }

        Ok(())
    }

    async fn upsert_tournament(&self, tournament: &Tournament) -> Result<bool, StoreError> {
        self.check_available()?;

        Ok(lock(&self.state)
            .tournaments
            .insert(tournament.external_id, tournament.clone())
            .is_none())
    }

    async fn append_games(&self, games: &[Game]) -> Result<u64, StoreError> {
        self.check_available()?;
        for game in games {
            game.validate()?;
        }

        let mut state = lock(&self.state);
        let mut inserted = 0;
        for game in games {
            let key = (game.source_match_id, game.ordinal);
            if !state.games.contains_key(&key) {
                state.games.insert(key, game.clone());
                inserted += 1;
            }
        }

        Ok(inserted)
    }

    async fn store_tournament(
        &self,
        players: &[Player],
        tournament: &Tournament,
        games: &[Game]
    ) -> Result<(bool, u64), StoreError> {
        self.check_available()?;
        for game in games {
            game.validate()?;
        }
        // Fails before anything is written, like a rolled back transaction
        if self.fail_game_append.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated game insert failure".to_owned()));
        }

        self.upsert_players(players).await?;
        let is_new = self.upsert_tournament(tournament).await?;
        let inserted = self.append_games(games).await?;

        Ok((is_new, inserted))
    }

    async fn load_games(&self, as_of: Option<DateTime<Utc>>) -> Result<Vec<Game>, StoreError> {
        self.check_available()?;
        let mut games: Vec<Game> = lock(&self.state)
            .games
            .values()
            .filter(|g| as_of.map_or(true, |cutoff| g.played_at <= cutoff))
            .cloned()
            .collect();
        games.sort_by_key(|g| (g.played_at, g.source_match_id, g.ordinal));

        Ok(games)
    }

    async fn load_players(&self) -> Result<Vec<Player>, StoreError> {
        self.check_available()?;

        Ok(self.players())
    }

    async fn replace_snapshots(&self, snapshots: &[RatingSnapshot]) -> Result<(), StoreError> {
        self.check_available()?;
        if self.fail_snapshot_commit.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated commit failure".to_owned()));
        }

        lock(&self.state).snapshots = snapshots.to_vec();
        Ok(())
    }

    async fn upsert_ratings(&self, ratings: &[Rating]) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = lock(&self.state);
        for r in ratings {
            state.ratings.insert(r.player_id, r.clone());
        }

        Ok(())
    }
}
