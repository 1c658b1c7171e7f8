use crate::{database::db_structs::Game, model::decay::decay_weight};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Row-compressed sparse matrix. Columns within a row are sorted, so iterating a row
/// always visits entries in the same order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SparseRows {
    offsets: Vec<usize>,
    columns: Vec<usize>,
    values: Vec<f64>
}

impl SparseRows {
    pub fn from_rows(rows: Vec<BTreeMap<usize, f64>>) -> SparseRows {
        let mut offsets = Vec::with_capacity(rows.len() + 1);
        let mut columns = Vec::new();
        let mut values = Vec::new();

        offsets.push(0);
        for row in rows {
            for (column, value) in row {
                columns.push(column);
                values.push(value);
            }
            offsets.push(columns.len());
        }

        SparseRows {
            offsets,
            columns,
            values
        }
    }

    pub fn n_rows(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Number of stored entries
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn row(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let (start, end) = (self.offsets[i], self.offsets[i + 1]);

        self.columns[start..end]
            .iter()
            .copied()
            .zip(self.values[start..end].iter().copied())
    }

    pub fn row_sum(&self, i: usize) -> f64 {
        self.row(i).map(|(_, v)| v).sum()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        let (start, end) = (self.offsets[i], self.offsets[i + 1]);

        match self.columns[start..end].binary_search(&j) {
            Ok(pos) => self.values[start + pos],
            Err(_) => 0.0
        }
    }

    /// Labels each row with the id of its connected component. Labels are assigned
    /// in order of each component's lowest row index.
    pub fn connected_components(&self) -> Vec<usize> {
        let n = self.n_rows();
        let mut labels = vec![usize::MAX; n];
        let mut next_label = 0;
        let mut queue = VecDeque::new();

        for start in 0..n {
            if labels[start] != usize::MAX {
                continue;
            }

            labels[start] = next_label;
            queue.push_back(start);
            while let Some(i) = queue.pop_front() {
                for (j, _) in self.row(i) {
                    if labels[j] == usize::MAX {
                        labels[j] = next_label;
                        queue.push_back(j);
                    }
                }
            }

            next_label += 1;
        }

        labels
    }
}

/// Decay-weighted pairwise outcomes over dense player indices, as of one reference time.
#[derive(Debug, Clone)]
pub struct ComparisonGraph {
    pub reference: DateTime<Utc>,
    // External player id -> dense index, in ascending external id order
    index: IndexMap<i64, usize>,
    /// Symmetric: total weighted games between i and j
    pub comparisons: SparseRows,
    /// wins[i][j]: weighted games i won against j
    pub wins: SparseRows,
    pub games_played: Vec<i32>,
    pub total_wins: Vec<i32>,
    pub total_losses: Vec<i32>
}

impl ComparisonGraph {
    /// Folds every game played at or before `reference` into the graph.
    /// Games are visited in (played_at, match, ordinal) order so the weighted sums are
    /// reproducible regardless of how the input was ordered.
    pub fn build(games: &[Game], reference: DateTime<Utc>) -> ComparisonGraph {
        let included = games
            .iter()
            .filter(|g| g.played_at <= reference && g.player_a != g.player_b)
            .sorted_by_key(|g| (g.played_at, g.source_match_id, g.ordinal))
            .collect_vec();

        let index: IndexMap<i64, usize> = included
            .iter()
            .flat_map(|g| [g.player_a, g.player_b])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();

        let n = index.len();
        let mut comparisons = vec![BTreeMap::new(); n];
        let mut wins = vec![BTreeMap::new(); n];
        let mut games_played = vec![0; n];
        let mut total_wins = vec![0; n];
        let mut total_losses = vec![0; n];

        for game in included {
            let a = index[&game.player_a];
            let b = index[&game.player_b];
            let (winner, loser) = if game.winner == game.player_a { (a, b) } else { (b, a) };
            let weight = decay_weight(game.played_at, reference);

            *comparisons[a].entry(b).or_insert(0.0) += weight;
            *comparisons[b].entry(a).or_insert(0.0) += weight;
            *wins[winner].entry(loser).or_insert(0.0) += weight;

            games_played[a] += 1;
            games_played[b] += 1;
            total_wins[winner] += 1;
            total_losses[loser] += 1;
        }

        ComparisonGraph {
            reference,
            index,
            comparisons: SparseRows::from_rows(comparisons),
            wins: SparseRows::from_rows(wins),
            games_played,
            total_wins,
            total_losses
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index_of(&self, player_id: i64) -> Option<usize> {
        self.index.get(&player_id).copied()
    }

    pub fn player_id(&self, index: usize) -> Option<i64> {
        self.index.get_index(index).map(|(id, _)| *id)
    }

    /// External player ids in dense index order
    pub fn player_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.index.keys().copied()
    }

    pub fn components(&self) -> Vec<usize> {
        self.comparisons.connected_components()
    }
}
