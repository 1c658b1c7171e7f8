use crate::model::constants::{EMERGING_GAMES, ESTABLISHED_GAMES, PROVISIONAL_GAMES};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// Reliability class of a rating, derived purely from the number of games played.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConfidenceTier {
    Unranked,
    Provisional,
    Emerging,
    Established
}

impl ConfidenceTier {
    pub fn from_games_played(games_played: i32) -> ConfidenceTier {
        if games_played < PROVISIONAL_GAMES {
            ConfidenceTier::Unranked
        } else if games_played < EMERGING_GAMES {
            ConfidenceTier::Provisional
        } else if games_played < ESTABLISHED_GAMES {
            ConfidenceTier::Emerging
        } else {
            ConfidenceTier::Established
        }
    }

    pub fn is_ranked(&self) -> bool {
        *self != ConfidenceTier::Unranked
    }
}
