//! Label-permutation significance test for Spearman IC.
//!
//! Realized labels are shuffled only within their group (a fold, or a
//! fold-market cell), so the null keeps the grouping structure of the data.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::rank::{average_ranks, pearson, MIN_PAIRS};

/// Result of one permutation test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermutationResult {
    pub observed: f64,
    /// Two-sided: `(1 + #{|null| >= |observed|}) / (1 + trials)`.
    pub p_value: f64,
    pub null_mean: f64,
    pub null_std: f64,
    pub trials: usize,
}

/// Paired observations of one shuffle group.
#[derive(Debug, Clone, Default)]
pub struct PairGroup {
    pub predicted: Vec<f64>,
    pub realized: Vec<f64>,
}

impl PairGroup {
    pub fn push(&mut self, predicted: f64, realized: f64) {
        self.predicted.push(predicted);
        self.realized.push(realized);
    }

    pub fn len(&self) -> usize {
        self.predicted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicted.is_empty()
    }
}

/// Run the test; `None` if the observed IC is undefined.
pub fn permutation_test(groups: &[PairGroup], trials: usize, seed: u64) -> Option<PermutationResult> {
    let predicted: Vec<f64> = groups.iter().flat_map(|g| g.predicted.iter().copied()).collect();
    let realized: Vec<f64> = groups.iter().flat_map(|g| g.realized.iter().copied()).collect();
    if predicted.len() < MIN_PAIRS {
        return None;
    }

    // Shuffling within groups only permutes positions, so ranks of the
    // concatenation can be computed once and shuffled in place.
    let pred_ranks = average_ranks(&predicted);
    let real_ranks = average_ranks(&realized);
    let observed = pearson(&pred_ranks, &real_ranks)?;

    let bounds: Vec<(usize, usize)> = groups
        .iter()
        .scan(0, |start, g| {
            let range = (*start, *start + g.len());
            *start += g.len();
            Some(range)
        })
        .collect();

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut shuffled = real_ranks.clone();
    let mut exceed = 0usize;
    let mut null = Vec::with_capacity(trials);

    for _ in 0..trials {
        shuffled.copy_from_slice(&real_ranks);
        for &(lo, hi) in &bounds {
            shuffled[lo..hi].shuffle(&mut rng);
        }
        // A constant permuted sample cannot happen when observed exists
        let ic = pearson(&pred_ranks, &shuffled).unwrap_or(0.0);
        if ic.abs() >= observed.abs() - 1e-12 {
            exceed += 1;
        }
        null.push(ic);
    }

    let null_mean = if trials > 0 {
        null.iter().sum::<f64>() / trials as f64
    } else {
        0.0
    };
    let null_std = if trials > 1 {
        (null.iter().map(|v| (v - null_mean).powi(2)).sum::<f64>() / (trials - 1) as f64).sqrt()
    } else {
        0.0
    };

    Some(PermutationResult {
        observed,
        p_value: (1 + exceed) as f64 / (1 + trials) as f64,
        null_mean,
        null_std,
        trials,
    })
}
