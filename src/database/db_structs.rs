use crate::model::structures::confidence_tier::ConfidenceTier;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, Utc};
use postgres_types::{accepts, to_sql_checked, FromSql, IsNull, ToSql, Type};
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use thiserror::Error;

/// A record that would break a relational invariant. Only the offending record is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrityViolation {
    #[error("winner {winner} of match {match_id} is neither {player_a} nor {player_b}")]
    WinnerNotParticipant {
        match_id: i64,
        player_a: i64,
        player_b: i64,
        winner: i64
    },

    #[error("match {match_id} pairs player {player_id} against themselves")]
    SelfPairing { match_id: i64, player_id: i64 },

    #[error("match {match_id} appears twice with conflicting content")]
    ConflictingDuplicate { match_id: i64 }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// Id assigned by the results service
    pub external_id: i64,
    pub name: String
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tournament {
    pub external_id: i64,
    pub name: String,
    pub venue_id: Option<i64>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub discipline: Option<String>
}

/// One rack. Matches are decomposed into these before they reach the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub tournament_id: i64,
    pub source_match_id: i64,
    /// Position within the source match, used together with `source_match_id`
    /// as the idempotency key on re-import
    pub ordinal: i32,
    pub player_a: i64,
    pub player_b: i64,
    pub winner: i64,
    pub played_at: DateTime<Utc>
}

impl Game {
    pub fn new(
        tournament_id: i64,
        source_match_id: i64,
        ordinal: i32,
        player_a: i64,
        player_b: i64,
        winner: i64,
        played_at: DateTime<Utc>
    ) -> Result<Game, IntegrityViolation> {
        let game = Game {
            tournament_id,
            source_match_id,
            ordinal,
            player_a,
            player_b,
            winner,
            played_at
        };

        game.validate()?;
        Ok(game)
    }

    pub fn validate(&self) -> Result<(), IntegrityViolation> {
        if self.player_a == self.player_b {
            return Err(IntegrityViolation::SelfPairing {
                match_id: self.source_match_id,
                player_id: self.player_a
            });
        }

        if self.winner != self.player_a && self.winner != self.player_b {
            return Err(IntegrityViolation::WinnerNotParticipant {
                match_id: self.source_match_id,
                player_a: self.player_a,
                player_b: self.player_b,
                winner: self.winner
            });
        }

        Ok(())
    }

    pub fn loser(&self) -> i64 {
        if self.winner == self.player_a {
            self.player_b
        } else {
            self.player_a
        }
    }
}

/// The current rating of a player. One row per player, owned by the replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub player_id: i64,
    pub rating: f64,
    pub games_played: i32,
    pub total_wins: i32,
    pub total_losses: i32,
    pub confidence: ConfidenceTier,
    /// Highest snapshot rating and the checkpoint it was first reached on
    pub best_rating: Option<f64>,
    pub best_rating_date: Option<NaiveDate>,
    pub algorithm_version: String,
    pub computed_at: DateTime<Utc>
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingSnapshot {
    pub player_id: i64,
    pub checkpoint: NaiveDate,
    pub rating: f64,
    pub games_played: i32,
    pub confidence: ConfidenceTier,
    pub algorithm_version: String
}

// Tiers are stored by their lowercase name
impl ToSql for ConfidenceTier {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        self.as_ref().to_sql(ty, out)
    }

    accepts!(TEXT, VARCHAR);
    to_sql_checked!();
}

impl<'a> FromSql<'a> for ConfidenceTier {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        let text = <&str as FromSql>::from_sql(ty, raw)?;

        Ok(ConfidenceTier::try_from(text)?)
    }

    accepts!(TEXT, VARCHAR);
}
