use crate::model::{
    constants::{CONVERGENCE_TOLERANCE, INITIAL_STRENGTH, MAX_ITERATIONS, STRENGTH_FLOOR},
    graph::SparseRows
};
use rayon::prelude::*;

#[derive(Debug, Clone, PartialEq)]
pub struct SolverSettings {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub strength_floor: f64,
    /// Virtual drawn games each player plays against a unit-strength anchor.
    /// Zero disables the prior.
    pub prior_weight: f64
}

impl Default for SolverSettings {
    fn default() -> Self {
        SolverSettings {
            tolerance: CONVERGENCE_TOLERANCE,
            max_iterations: MAX_ITERATIONS,
            strength_floor: STRENGTH_FLOOR,
            prior_weight: 0.0
        }
    }
}

/// Whether a player's maximum-likelihood strength exists. Undefeated and winless players
/// have none: their likelihood keeps improving as the strength runs off to infinity or zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Saturation {
    Unsaturated,
    /// Games played, none lost
    Undefeated,
    /// Games played, none won
    Winless
}

impl Saturation {
    pub fn is_saturated(&self) -> bool {
        *self != Saturation::Unsaturated
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub log_strengths: Vec<f64>,
    pub saturation: Vec<Saturation>,
    pub iterations: usize,
    pub converged: bool,
    /// Largest change in log-strength among unsaturated players during the final iteration
    pub max_delta: f64
}

impl Solution {
    pub fn saturated_count(&self) -> usize {
        self.saturation.iter().filter(|s| s.is_saturated()).count()
    }
}

/// Maximum-likelihood Bradley-Terry strengths by minorization-maximization.
///
/// `comparisons[i][j]` is the weighted number of games between i and j (symmetric) and
/// `wins[i][j]` the weighted number of those i won. Every iteration applies
///
/// `s_i <- W_i / sum_j(c_ij / (s_i + s_j))`
///
/// to all players at once, using only stored edges. Without a prior, each connected
/// component is rescaled to a geometric mean of 1 over its unsaturated players afterwards,
/// which leaves the likelihood unchanged and keeps disconnected components from drifting
/// apart numerically.
///
/// Undefeated players are pinned at `1 / strength_floor` and winless players at
/// `strength_floor` for the whole solve. Their games then contribute almost nothing to
/// anyone else's update, which is the limit the likelihood approaches, so the result does
/// not depend on the iteration cap. Convergence is measured over unsaturated players only.
///
/// Rows with no comparisons keep their initial strength; callers are expected to leave
/// players without games out of the matrix entirely.
pub fn solve(comparisons: &SparseRows, wins: &SparseRows, n: usize, settings: &SolverSettings) -> Solution {
    if n == 0 {
        return Solution {
            log_strengths: Vec::new(),
            saturation: Vec::new(),
            iterations: 0,
            converged: true,
            max_delta: 0.0
        };
    }

    let prior = settings.prior_weight.max(0.0);
    let labels = comparisons.connected_components();
    let n_components = labels.iter().max().map_or(0, |m| m + 1);
    let total_wins: Vec<f64> = (0..n).map(|i| wins.row_sum(i) + 0.5 * prior).collect();
    let saturation: Vec<Saturation> = (0..n)
        .map(|i| if prior > 0.0 { Saturation::Unsaturated } else { saturation_of(comparisons, wins, i) })
        .collect();

    let mut strengths: Vec<f64> = saturation
        .iter()
        .map(|s| match s {
            Saturation::Unsaturated => INITIAL_STRENGTH,
            Saturation::Undefeated => 1.0 / settings.strength_floor,
            Saturation::Winless => settings.strength_floor
        })
        .collect();
    let mut iterations = 0;
    let mut max_delta = f64::INFINITY;

    while iterations < settings.max_iterations {
        iterations += 1;

        let mut updated: Vec<f64> = (0..n)
            .into_par_iter()
            .map(|i| {
                let s_i = strengths[i];
                if saturation[i].is_saturated() {
                    return s_i;
                }

                let mut denominator: f64 = comparisons.row(i).map(|(j, c)| c / (s_i + strengths[j])).sum();
                denominator += prior / (s_i + 1.0);

                if denominator <= 0.0 {
                    return s_i;
                }

                (total_wins[i] / denominator).max(settings.strength_floor)
            })
            .collect();

        if prior == 0.0 {
            normalize_components(&mut updated, &labels, &saturation, n_components, settings.strength_floor);
        }

        max_delta = updated
            .iter()
            .zip(&strengths)
            .zip(&saturation)
            .filter(|(_, s)| !s.is_saturated())
            .map(|((new, old), _)| (new.ln() - old.ln()).abs())
            .fold(0.0, f64::max);

        strengths = updated;

        if max_delta < settings.tolerance {
            break;
        }
    }

    Solution {
        log_strengths: strengths.iter().map(|s| s.ln()).collect(),
        saturation,
        iterations,
        converged: max_delta < settings.tolerance,
        max_delta
    }
}

fn saturation_of(comparisons: &SparseRows, wins: &SparseRows, i: usize) -> Saturation {
    let played = comparisons.row_sum(i);
    if played <= 0.0 {
        return Saturation::Unsaturated;
    }

    // Both sums are built from the same weights in the same order, so an undefeated
    // player's losses come out as exactly zero
    let losses: f64 = comparisons.row(i).map(|(j, c)| c - wins.get(i, j)).sum();

    if wins.row_sum(i) <= 0.0 {
        Saturation::Winless
    } else if losses <= 0.0 {
        Saturation::Undefeated
    } else {
        Saturation::Unsaturated
    }
}

fn normalize_components(
    strengths: &mut [f64],
    labels: &[usize],
    saturation: &[Saturation],
    n_components: usize,
    floor: f64
) {
    let mut log_sums = vec![0.0; n_components];
    let mut sizes = vec![0usize; n_components];

    for ((s, &label), sat) in strengths.iter().zip(labels).zip(saturation) {
        if !sat.is_saturated() {
            log_sums[label] += s.ln();
            sizes[label] += 1;
        }
    }

    for ((s, &label), sat) in strengths.iter_mut().zip(labels).zip(saturation) {
        if sat.is_saturated() || sizes[label] == 0 {
            continue;
        }

        let mean = log_sums[label] / sizes[label] as f64;
        *s = (s.ln() - mean).exp().max(floor);
    }
}

#[cfg(test)]
mod tests {
    use crate::model::{
        bradley_terry::{solve, Saturation, SolverSettings},
        graph::SparseRows
    };
    use approx::assert_abs_diff_eq;
    use std::collections::BTreeMap;

    /// Builds symmetric comparison and win matrices from (winner, loser, count) triples
    fn matrices(n: usize, results: &[(usize, usize, f64)]) -> (SparseRows, SparseRows) {
        let mut comparisons = vec![BTreeMap::new(); n];
        let mut wins = vec![BTreeMap::new(); n];

        for &(w, l, count) in results {
            *comparisons[w].entry(l).or_insert(0.0) += count;
            *comparisons[l].entry(w).or_insert(0.0) += count;
            *wins[w].entry(l).or_insert(0.0) += count;
        }

        (SparseRows::from_rows(comparisons), SparseRows::from_rows(wins))
    }

    #[test]
    fn test_two_players_match_win_ratio() {
        let (comparisons, wins) = matrices(2, &[(0, 1, 60.0), (1, 0, 40.0)]);

        let solution = solve(&comparisons, &wins, 2, &SolverSettings::default());

        assert!(solution.converged);
        assert_abs_diff_eq!(
            solution.log_strengths[0] - solution.log_strengths[1],
            (60.0f64 / 40.0).ln(),
            epsilon = 1e-5
        );
        assert_abs_diff_eq!(solution.log_strengths[0] + solution.log_strengths[1], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_three_player_ordering() {
        let (comparisons, wins) = matrices(
            3,
            &[(0, 1, 8.0), (1, 0, 2.0), (1, 2, 7.0), (2, 1, 3.0), (0, 2, 9.0), (2, 0, 1.0)]
        );

        let solution = solve(&comparisons, &wins, 3, &SolverSettings::default());

        assert!(solution.converged);
        assert!(solution.log_strengths[0] > solution.log_strengths[1]);
        assert!(solution.log_strengths[1] > solution.log_strengths[2]);
    }

    #[test]
    fn test_disconnected_components_stay_finite() {
        let (comparisons, wins) = matrices(4, &[(0, 1, 3.0), (1, 0, 1.0), (3, 2, 2.0), (2, 3, 2.0)]);

        let solution = solve(&comparisons, &wins, 4, &SolverSettings::default());

        assert!(solution.log_strengths.iter().all(|ls| ls.is_finite()));
        assert_abs_diff_eq!(solution.log_strengths[0] + solution.log_strengths[1], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(solution.log_strengths[2], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(solution.log_strengths[3], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_undefeated_player_stays_finite() {
        let (comparisons, wins) = matrices(2, &[(0, 1, 5.0)]);

        let solution = solve(&comparisons, &wins, 2, &SolverSettings::default());

        assert!(solution.log_strengths.iter().all(|ls| ls.is_finite()));
        assert!(solution.log_strengths[0] > solution.log_strengths[1]);
        assert_eq!(solution.saturation, vec![Saturation::Undefeated, Saturation::Winless]);
        assert!(solution.converged);
    }

    #[test]
    fn test_undefeated_newcomer_leaves_others_unchanged() {
        let even = [(0, 1, 5.0), (1, 0, 5.0), (1, 2, 5.0), (2, 1, 5.0), (0, 2, 5.0), (2, 0, 5.0)];
        let (comparisons, wins) = matrices(3, &even);
        let before = solve(&comparisons, &wins, 3, &SolverSettings::default());

        let mut with_newcomer = even.to_vec();
        with_newcomer.push((3, 0, 1.0));
        let (comparisons, wins) = matrices(4, &with_newcomer);
        let after = solve(&comparisons, &wins, 4, &SolverSettings::default());

        assert!(before.converged);
        assert!(after.converged);
        assert_eq!(after.saturated_count(), 1);
        assert_eq!(after.saturation[3], Saturation::Undefeated);
        for i in 0..3 {
            assert_abs_diff_eq!(after.log_strengths[i], before.log_strengths[i], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_saturated_result_ignores_iteration_cap() {
        let (comparisons, wins) = matrices(
            4,
            &[(0, 1, 3.0), (1, 0, 2.0), (1, 2, 4.0), (2, 1, 1.0), (3, 1, 1.0), (2, 0, 2.0), (0, 2, 2.0)]
        );
        let capped = |max_iterations| SolverSettings {
            max_iterations,
            ..SolverSettings::default()
        };

        let short = solve(&comparisons, &wins, 4, &capped(200));
        let long = solve(&comparisons, &wins, 4, &capped(5000));

        assert!(short.converged);
        for i in 0..4 {
            assert_abs_diff_eq!(short.log_strengths[i], long.log_strengths[i], epsilon = 1e-5);
        }
    }

    #[test]
    fn test_iteration_cap_is_reported() {
        let (comparisons, wins) = matrices(3, &[(0, 1, 9.0), (1, 0, 1.0), (1, 2, 9.0), (2, 1, 1.0)]);
        let settings = SolverSettings {
            max_iterations: 1,
            ..SolverSettings::default()
        };

        let solution = solve(&comparisons, &wins, 3, &settings);

        assert_eq!(solution.iterations, 1);
        assert!(!solution.converged);
        assert!(solution.max_delta > 0.0);
    }

    #[test]
    fn test_solve_is_deterministic() {
        let (comparisons, wins) = matrices(
            4,
            &[(0, 1, 2.5), (1, 2, 1.25), (2, 3, 0.75), (3, 0, 0.5), (0, 2, 1.0), (1, 3, 2.0)]
        );

        let first = solve(&comparisons, &wins, 4, &SolverSettings::default());
        let second = solve(&comparisons, &wins, 4, &SolverSettings::default());

        assert_eq!(first, second);
    }

    #[test]
    fn test_prior_shrinks_towards_anchor() {
        let (comparisons, wins) = matrices(2, &[(0, 1, 5.0)]);
        let settings = SolverSettings {
            prior_weight: 2.0,
            ..SolverSettings::default()
        };

        let solution = solve(&comparisons, &wins, 2, &settings);

        assert!(solution.converged);
        assert!(solution.log_strengths[0] > 0.0);
        assert!(solution.log_strengths[1] < 0.0);
        assert!(solution.log_strengths[0] < 5.0);
    }

    #[test]
    fn test_empty_input() {
        let solution = solve(&SparseRows::default(), &SparseRows::default(), 0, &SolverSettings::default());

        assert!(solution.log_strengths.is_empty());
        assert!(solution.converged);
    }
}
