use crate::model::{
    bradley_terry::Saturation,
    constants::{ESTABLISHED_GAMES, POINTS_PER_DOUBLING, RATING_CEILING, RATING_FLOOR, STARTER_RATING},
    structures::confidence_tier::ConfidenceTier
};
use std::f64::consts::LN_2;

#[derive(Debug, Clone, PartialEq)]
pub struct BlendSettings {
    pub starter_rating: f64,
    /// Games after which the maximum-likelihood rating is used unblended
    pub full_weight_games: i32,
    pub floor: f64,
    pub ceiling: f64
}

impl Default for BlendSettings {
    fn default() -> Self {
        BlendSettings {
            starter_rating: STARTER_RATING,
            full_weight_games: ESTABLISHED_GAMES,
            floor: RATING_FLOOR,
            ceiling: RATING_CEILING
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendedRating {
    pub rating: f64,
    pub games_played: i32,
    pub confidence: ConfidenceTier
}

/// Public-scale rating for a log-strength that is already centered on its component.
pub fn ml_rating(log_strength: f64, settings: &BlendSettings) -> f64 {
    settings.starter_rating + POINTS_PER_DOUBLING * log_strength / LN_2
}

/// Maps solver output to public ratings, centering every connected component on the
/// starter rating independently. `components` holds one label per player. Saturated
/// players sit at the solver's strength bounds and are left out of the centering mean;
/// their ratings end up at the edge of the public range.
pub fn component_ml_ratings(
    log_strengths: &[f64],
    components: &[usize],
    saturation: &[Saturation],
    settings: &BlendSettings
) -> Vec<f64> {
    let n_components = components.iter().max().map_or(0, |m| m + 1);
    let mut sums = vec![0.0; n_components];
    let mut sizes = vec![0usize; n_components];

    for ((ls, &label), sat) in log_strengths.iter().zip(components).zip(saturation) {
        if !sat.is_saturated() {
            sums[label] += ls;
            sizes[label] += 1;
        }
    }

    log_strengths
        .iter()
        .zip(components)
        .map(|(ls, &label)| {
            let mean = if sizes[label] == 0 { 0.0 } else { sums[label] / sizes[label] as f64 };

            ml_rating(ls - mean, settings).clamp(settings.floor, settings.ceiling)
        })
        .collect()
}

/// Pulls under-observed ratings towards the starter rating, then clamps to the public range.
pub fn blend(ml_rating: f64, games_played: i32, settings: &BlendSettings) -> f64 {
    if games_played <= 0 {
        return settings.starter_rating.clamp(settings.floor, settings.ceiling);
    }

    let blended = if games_played >= settings.full_weight_games {
        ml_rating
    } else {
        let full = settings.full_weight_games as f64;
        let g = games_played as f64;

        ((full - g) / full) * settings.starter_rating + (g / full) * ml_rating
    };

    blended.clamp(settings.floor, settings.ceiling)
}

pub fn rate(ml_rating: f64, games_played: i32, settings: &BlendSettings) -> BlendedRating {
    BlendedRating {
        rating: blend(ml_rating, games_played, settings),
        games_played,
        confidence: ConfidenceTier::from_games_played(games_played)
    }
}

/// Rating assigned to a known player who has no games in the corpus.
pub fn unrated(settings: &BlendSettings) -> BlendedRating {
    rate(settings.starter_rating, 0, settings)
}

/// Probability that a player rated `rating_a` beats one rated `rating_b`.
/// A gap of one doubling step on the scale means 2:1 odds.
pub fn win_probability(rating_a: f64, rating_b: f64) -> f64 {
    1.0 / (1.0 + 2f64.powf((rating_b - rating_a) / POINTS_PER_DOUBLING))
}
