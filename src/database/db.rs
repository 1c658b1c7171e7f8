use super::{
    db_structs::{Game, Player, Rating, RatingSnapshot, Tournament},
    RatingStore, StoreError
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use itertools::Itertools;
use postgres_types::ToSql;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::{Client, GenericClient, NoTls, Row};
use tracing::{debug, error, info};

/// Rows per multi-row INSERT. Keeps every statement well below the bind parameter limit.
const BATCH_SIZE: usize = 1000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS players (
    external_id BIGINT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS tournaments (
    external_id BIGINT PRIMARY KEY,
    name TEXT NOT NULL,
    venue_id BIGINT,
    start_date DATE,
    end_date DATE,
    discipline TEXT
);

CREATE TABLE IF NOT EXISTS games (
    id BIGSERIAL PRIMARY KEY,
    tournament_id BIGINT NOT NULL REFERENCES tournaments (external_id),
    source_match_id BIGINT NOT NULL,
    ordinal INTEGER NOT NULL,
    player_a BIGINT NOT NULL REFERENCES players (external_id),
    player_b BIGINT NOT NULL REFERENCES players (external_id),
    winner BIGINT NOT NULL,
    played_at TIMESTAMPTZ NOT NULL,
    UNIQUE (source_match_id, ordinal),
    CHECK (player_a <> player_b),
    CHECK (winner = player_a OR winner = player_b)
);

CREATE INDEX IF NOT EXISTS games_played_at_idx ON games (played_at);

CREATE TABLE IF NOT EXISTS ratings (
    player_id BIGINT PRIMARY KEY REFERENCES players (external_id),
    rating DOUBLE PRECISION NOT NULL CHECK (rating >= 0 AND rating <= 2000),
    games_played INTEGER NOT NULL,
    total_wins INTEGER NOT NULL,
    total_losses INTEGER NOT NULL,
    confidence TEXT NOT NULL,
    best_rating DOUBLE PRECISION,
    best_rating_date DATE,
    algorithm_version TEXT NOT NULL,
    computed_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS rating_snapshots (
    player_id BIGINT NOT NULL REFERENCES players (external_id),
    checkpoint DATE NOT NULL,
    rating DOUBLE PRECISION NOT NULL CHECK (rating >= 0 AND rating <= 2000),
    games_played INTEGER NOT NULL,
    confidence TEXT NOT NULL,
    algorithm_version TEXT NOT NULL,
    PRIMARY KEY (player_id, checkpoint)
);
";

#[derive(Clone)]
pub struct DbClient {
    // Behind a mutex so a transaction can hold the connection exclusively
    client: Arc<Mutex<Client>>
}

impl DbClient {
    // Connect to the database and return a DbClient instance
    pub async fn connect(connection_str: &str) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(connection_str, NoTls).await?;

        // Spawn the connection object to run in the background
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("connection error: {}", e);
            }
        });

        Ok(DbClient {
            client: Arc::new(Mutex::new(client))
        })
    }

    /// Creates any missing tables. Safe to run against an existing database.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.client.lock().await.batch_execute(SCHEMA).await?;

        info!("Database schema is up to date");
        Ok(())
    }

    async fn truncate_table<C: GenericClient>(client: &C, table: &str) -> Result<(), StoreError> {
        client.execute(format!("DELETE FROM {}", table).as_str(), &[]).await?;

        debug!("Cleared the {} table", table);
        Ok(())
    }

    fn game_from_row(row: &Row) -> Game {
        Game {
            tournament_id: row.get("tournament_id"),
            source_match_id: row.get("source_match_id"),
            ordinal: row.get("ordinal"),
            player_a: row.get("player_a"),
            player_b: row.get("player_b"),
            winner: row.get("winner"),
            played_at: row.get("played_at")
        }
    }

    fn player_from_row(row: &Row) -> Player {
        Player {
            external_id: row.get("external_id"),
            name: row.get("name")
        }
    }

    async fn insert_players<C: GenericClient>(client: &C, players: &[Player]) -> Result<(), StoreError> {
        // One statement may not touch the same row twice, so keep the last name per id
        let unique: IndexMap<i64, &Player> = players.iter().map(|p| (p.external_id, p)).collect();
        let unique = unique.into_values().collect_vec();

        for chunk in unique.chunks(BATCH_SIZE) {
            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * 2);
            for p in chunk {
                params.push(&p.external_id);
                params.push(&p.name);
            }

            let query = format!(
                "INSERT INTO players (external_id, name) VALUES {} \
                ON CONFLICT (external_id) DO UPDATE SET name = EXCLUDED.name, updated_at = now()",
                values_placeholders(chunk.len(), 2)
            );

            client.execute(query.as_str(), &params).await?;
        }

        Ok(())
    }

    async fn insert_tournament<C: GenericClient>(client: &C, tournament: &Tournament) -> Result<bool, StoreError> {
        // xmax is 0 only for a freshly inserted row
        let row = client
            .query_one(
                "INSERT INTO tournaments (external_id, name, venue_id, start_date, end_date, discipline) \
                VALUES ($1, $2, $3, $4, $5, $6) \
                ON CONFLICT (external_id) DO UPDATE SET name = EXCLUDED.name, venue_id = EXCLUDED.venue_id, \
                start_date = EXCLUDED.start_date, end_date = EXCLUDED.end_date, discipline = EXCLUDED.discipline \
                RETURNING (xmax = 0) AS inserted",
                &[
                    &tournament.external_id,
                    &tournament.name,
                    &tournament.venue_id,
                    &tournament.start_date,
                    &tournament.end_date,
                    &tournament.discipline
                ]
            )
            .await?;

        Ok(row.get("inserted"))
    }

    async fn insert_games<C: GenericClient>(client: &C, games: &[Game]) -> Result<u64, StoreError> {
        let mut inserted = 0;

        for chunk in games.chunks(BATCH_SIZE) {
            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * 7);
            for g in chunk {
                params.push(&g.tournament_id);
                params.push(&g.source_match_id);
                params.push(&g.ordinal);
                params.push(&g.player_a);
                params.push(&g.player_b);
                params.push(&g.winner);
                params.push(&g.played_at);
            }

            let query = format!(
                "INSERT INTO games (tournament_id, source_match_id, ordinal, player_a, player_b, winner, played_at) \
                VALUES {} ON CONFLICT (source_match_id, ordinal) DO NOTHING",
                values_placeholders(chunk.len(), 7)
            );

            inserted += client.execute(query.as_str(), &params).await?;
        }

        Ok(inserted)
    }

    async fn insert_snapshots<C: GenericClient>(client: &C, snapshots: &[RatingSnapshot]) -> Result<(), StoreError> {
        for chunk in snapshots.chunks(BATCH_SIZE) {
            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * 6);
            for s in chunk {
                params.push(&s.player_id);
                params.push(&s.checkpoint);
                params.push(&s.rating);
                params.push(&s.games_played);
                params.push(&s.confidence);
                params.push(&s.algorithm_version);
            }

            let query = format!(
                "INSERT INTO rating_snapshots (player_id, checkpoint, rating, games_played, confidence, \
                algorithm_version) VALUES {}",
                values_placeholders(chunk.len(), 6)
            );

            client.execute(query.as_str(), &params).await?;
        }

        Ok(())
    }
}

impl RatingStore for DbClient {
    async fn health_check(&self) -> Result<(), StoreError> {
        self.client.lock().await.simple_query("SELECT 1").await?;

        Ok(())
    }

    async fn upsert_players(&self, players: &[Player]) -> Result<(), StoreError> {
        Self::insert_players(&*self.client.lock().await, players).await
    }

    async fn upsert_tournament(&self, tournament: &Tournament) -> Result<bool, StoreError> {
        Self::insert_tournament(&*self.client.lock().await, tournament).await
    }

    async fn append_games(&self, games: &[Game]) -> Result<u64, StoreError> {
        for game in games {
            game.validate()?;
        }

        Self::insert_games(&*self.client.lock().await, games).await
    }

    async fn store_tournament(
        &self,
        players: &[Player],
        tournament: &Tournament,
        games: &[Game]
    ) -> Result<(bool, u64), StoreError> {
        for game in games {
            game.validate()?;
        }

        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;

        Self::insert_players(&transaction, players).await?;
        let is_new = Self::insert_tournament(&transaction, tournament).await?;
        let inserted = Self::insert_games(&transaction, games).await?;

        transaction.commit().await?;

        debug!(tournament_id = tournament.external_id, inserted, "Stored tournament");
        Ok((is_new, inserted))
    }

    async fn load_games(&self, as_of: Option<DateTime<Utc>>) -> Result<Vec<Game>, StoreError> {
        info!("Fetching games...");
        let rows = self
            .client
            .lock()
            .await
            .query(
                "SELECT tournament_id, source_match_id, ordinal, player_a, player_b, winner, played_at \
                FROM games WHERE $1::TIMESTAMPTZ IS NULL OR played_at <= $1 \
                ORDER BY played_at, source_match_id, ordinal",
                &[&as_of]
            )
            .await?;

        let games = rows.iter().map(Self::game_from_row).collect_vec();

        info!("Fetched {} games", games.len());
        Ok(games)
    }

    async fn load_players(&self) -> Result<Vec<Player>, StoreError> {
        let rows = self
            .client
            .lock()
            .await
            .query("SELECT external_id, name FROM players ORDER BY external_id", &[])
            .await?;

        Ok(rows.iter().map(Self::player_from_row).collect())
    }

    async fn replace_snapshots(&self, snapshots: &[RatingSnapshot]) -> Result<(), StoreError> {
        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;

        Self::truncate_table(&transaction, "rating_snapshots").await?;
        Self::insert_snapshots(&transaction, snapshots).await?;

        // Dropping the transaction without commit rolls it back
        transaction.commit().await?;

        info!("Replaced rating snapshots ({} rows)", snapshots.len());
        Ok(())
    }

    async fn upsert_ratings(&self, ratings: &[Rating]) -> Result<(), StoreError> {
        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;

        for chunk in ratings.chunks(BATCH_SIZE) {
            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * 10);
            for r in chunk {
                params.push(&r.player_id);
                params.push(&r.rating);
                params.push(&r.games_played);
                params.push(&r.total_wins);
                params.push(&r.total_losses);
                params.push(&r.confidence);
                params.push(&r.best_rating);
                params.push(&r.best_rating_date);
                params.push(&r.algorithm_version);
                params.push(&r.computed_at);
            }

            let query = format!(
                "INSERT INTO ratings (player_id, rating, games_played, total_wins, total_losses, confidence, \
                best_rating, best_rating_date, algorithm_version, computed_at) VALUES {} \
                ON CONFLICT (player_id) DO UPDATE SET rating = EXCLUDED.rating, games_played = EXCLUDED.games_played, \
                total_wins = EXCLUDED.total_wins, total_losses = EXCLUDED.total_losses, \
                confidence = EXCLUDED.confidence, best_rating = EXCLUDED.best_rating, \
                best_rating_date = EXCLUDED.best_rating_date, algorithm_version = EXCLUDED.algorithm_version, \
                computed_at = EXCLUDED.computed_at",
                values_placeholders(chunk.len(), 10)
            );

            transaction.execute(query.as_str(), &params).await?;
        }

        transaction.commit().await?;

        info!("Saved {} current ratings", ratings.len());
        Ok(())
    }
}

/// `($1, $2), ($3, $4), ...` for `rows` rows of `columns` values each
fn values_placeholders(rows: usize, columns: usize) -> String {
    (0..rows)
        .map(|r| format!("({})", (1..=columns).map(|c| format!("${}", r * columns + c)).join(", ")))
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::values_placeholders;

    #[test]
    fn test_values_placeholders() {
        assert_eq!(values_placeholders(2, 3), "($1, $2, $3), ($4, $5, $6)");
        assert_eq!(values_placeholders(1, 1), "($1)");
        assert_eq!(values_placeholders(0, 4), "");
    }
}
