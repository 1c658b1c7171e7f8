//! Shapes of the per-tournament document served by the results service.
//!
//! The service is inconsistent about types: ids and scores arrive as numbers or as
//! numeric strings, and unplayed slots come back as `null`, `0` or an empty object.
//! Everything is therefore optional here and validated by the normalizer.

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentPayload {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub tournament_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub discipline: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub starttime: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub stoptime: Option<String>,
    #[serde(default)]
    pub venues: Option<Vec<VenuePayload>>,
    /// Kept undecoded so one broken match does not take the whole tournament down
    #[serde(default)]
    pub matches: Option<Vec<serde_json::Value>>
}

impl TournamentPayload {
    pub fn venue_id(&self) -> Option<i64> {
        self.venues.as_ref().and_then(|v| v.first()).and_then(|v| v.venue_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenuePayload {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub venue_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchPayload {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub match_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient_player")]
    pub player_a: Option<PlayerPayload>,
    #[serde(default, deserialize_with = "lenient_player")]
    pub player_b: Option<PlayerPayload>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub score_a: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub score_b: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub starttime: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub stoptime: Option<String>
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerPayload {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub player_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>
}

impl PlayerPayload {
    /// Id of a drawn participant. `0` marks an empty slot.
    pub fn id(&self) -> Option<i64> {
        self.player_id.filter(|id| *id > 0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Slot {
    Player(PlayerPayload),
    Other(serde_json::Value)
}

/// Anything that is not an object (`0`, `""`, `false`) is an empty slot
fn lenient_player<'de, D>(deserializer: D) -> Result<Option<PlayerPayload>, D::Error>
where
    D: Deserializer<'de>
{
    let value: Option<Slot> = Option::deserialize(deserializer)?;

    Ok(match value {
        Some(Slot::Player(p)) => Some(p),
        _ => None
    })
}

fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>
{
    let value: Option<Scalar> = Option::deserialize(deserializer)?;

    Ok(match value {
        Some(Scalar::Int(v)) => Some(v),
        Some(Scalar::Float(v)) if v.is_finite() && v.fract() == 0.0 => Some(v as i64),
        Some(Scalar::Text(s)) => s.trim().parse().ok(),
        _ => None
    })
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>
{
    let value: Option<Scalar> = Option::deserialize(deserializer)?;

    Ok(match value {
        Some(Scalar::Text(s)) if !s.trim().is_empty() => Some(s),
        Some(Scalar::Int(v)) => Some(v.to_string()),
        _ => None
    })
}
