use crate::model::constants::HALF_LIFE_DAYS;
use chrono::{DateTime, Utc};
use std::f64::consts::LN_2;

/// Weight of a game played at `played_at` when observed from `reference`.
///
/// # How this works
/// - Age is counted in whole days between the game and the reference time.
/// - A game from the future (age < 0) counts as age 0, so the weight never exceeds 1.
/// - Every `HALF_LIFE_DAYS` of age halves the weight.
pub fn decay_weight(played_at: DateTime<Utc>, reference: DateTime<Utc>) -> f64 {
    let age_days = (reference - played_at).num_days().max(0);

    weight_for_age(age_days)
}

pub fn weight_for_age(age_days: i64) -> f64 {
    let age = age_days.max(0) as f64;

    (-LN_2 / HALF_LIFE_DAYS * age).exp()
}

#[cfg(test)]
mod tests {
    use crate::model::decay::{decay_weight, weight_for_age};
    use approx::assert_abs_diff_eq;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_weight_at_zero_age() {
        assert_eq!(weight_for_age(0), 1.0);
    }

    #[test]
    fn test_weight_halves_every_half_life() {
        assert_abs_diff_eq!(weight_for_age(1095), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(weight_for_age(2190), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_weight_strictly_decreasing_and_bounded() {
        let mut previous = weight_for_age(0);
        for age in 1..5000 {
            let w = weight_for_age(age);

            assert!(w < previous);
            assert!(w > 0.0 && w <= 1.0);
            previous = w;
        }
    }

    #[test]
    fn test_future_games_have_full_weight() {
        let reference = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let played_at = reference + Duration::days(30);

        assert_eq!(decay_weight(played_at, reference), 1.0);
    }

    #[test]
    fn test_partial_days_truncate() {
        let played_at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let reference = Utc.with_ymd_and_hms(2024, 1, 2, 11, 59, 59).unwrap();

        assert_eq!(decay_weight(played_at, reference), 1.0);
    }
}
