pub mod db;
pub mod db_structs;

use chrono::{DateTime, Utc};
use db_structs::{Game, IntegrityViolation, Player, Rating, RatingSnapshot, Tournament};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Integrity(#[from] IntegrityViolation),

    #[error("unexpected value in column {column}: {value}")]
    InvalidValue { column: &'static str, value: String },

    #[error("store unavailable: {0}")]
    Unavailable(String)
}

/// Everything the pipeline needs from persistent storage.
///
/// Players and tournaments are upserted by external id. Games are append-only and keyed
/// by (source match id, ordinal), so appending a game that already exists is a no-op.
/// Snapshots are only ever replaced as a whole set.
#[allow(async_fn_in_trait)]
pub trait RatingStore {
    async fn health_check(&self) -> Result<(), StoreError>;

    async fn upsert_players(&self, players: &[Player]) -> Result<(), StoreError>;

    /// Returns true if the tournament was not stored before
    async fn upsert_tournament(&self, tournament: &Tournament) -> Result<bool, StoreError>;

    /// Returns the number of games that were actually inserted
    async fn append_games(&self, games: &[Game]) -> Result<u64, StoreError>;

    /// Upserts the players and the tournament and appends its games as one unit: either
    /// all of it is stored or none of it. Returns whether the tournament is new and the
    /// number of games inserted.
    async fn store_tournament(
        &self,
        players: &[Player],
        tournament: &Tournament,
        games: &[Game]
    ) -> Result<(bool, u64), StoreError>;

    /// All games played at or before `as_of`, ordered by (played_at, match, ordinal)
    async fn load_games(&self, as_of: Option<DateTime<Utc>>) -> Result<Vec<Game>, StoreError>;

    async fn load_players(&self) -> Result<Vec<Player>, StoreError>;

    /// Atomically swaps the stored snapshot set for `snapshots`. On error the previous
    /// set is left untouched.
    async fn replace_snapshots(&self, snapshots: &[RatingSnapshot]) -> Result<(), StoreError>;

    async fn upsert_ratings(&self, ratings: &[Rating]) -> Result<(), StoreError>;
}
