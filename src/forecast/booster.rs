//! Squared-loss gradient boosting over histogram regression trees.

use rand::seq::index::sample;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::tree::{BinnedMatrix, TreeBuilder, TreeConfig, TreeNode};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BoostingError {
    #[error("Training target variance {variance:e} is below {threshold:e}")]
    DegenerateTarget { variance: f64, threshold: f64 },

    #[error("No training rows")]
    EmptyTraining,

    #[error("Row {row} has {found} features, expected {expected}")]
    RaggedRows {
        row: usize,
        found: usize,
        expected: usize,
    },
}

/// Ensemble hyperparameters. The same values are used for every fold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostingConfig {
    pub n_trees: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    /// L1 penalty on leaf weights.
    pub l1: f64,
    /// L2 penalty on leaf weights.
    pub l2: f64,
    pub min_samples_leaf: usize,
    pub max_bins: usize,
    /// Fraction of training rows drawn for each tree.
    pub subsample: f64,
    /// Below this training-target variance no model is fitted.
    pub min_target_variance: f64,
    pub seed: u64,
}

impl Default for BoostingConfig {
    fn default() -> Self {
        Self {
            n_trees: 200,
            max_depth: 3,
            learning_rate: 0.05,
            l1: 0.0,
            l2: 1.0,
            min_samples_leaf: 10,
            max_bins: 32,
            subsample: 0.8,
            min_target_variance: 1e-12,
            seed: 7,
        }
    }
}

impl BoostingConfig {
    pub fn tree_config(&self) -> TreeConfig {
        TreeConfig {
            max_depth: self.max_depth,
            min_samples_leaf: self.min_samples_leaf,
            l1: self.l1,
            l2: self.l2,
            min_split_gain: 0.0,
        }
    }
}

/// Trained ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoostedTrees {
    base_score: f64,
    learning_rate: f64,
    trees: Vec<TreeNode>,
    /// Total split gain per feature, normalized to sum to 1.
    importance: Vec<f64>,
}

impl GradientBoostedTrees {
    /// Fit on rows `x` and targets `y`.
    ///
    /// `seed` drives row subsampling; pass a per-fold value for
    /// reproducible parallel runs.
    pub fn fit(
        x: &[Vec<f64>],
        y: &[f64],
        config: &BoostingConfig,
        seed: u64,
    ) -> Result<Self, BoostingError> {
        if x.is_empty() || x.len() != y.len() {
            return Err(BoostingError::EmptyTraining);
        }
        let n_features = x[0].len();
        if let Some((row, r)) = x.iter().enumerate().find(|(_, r)| r.len() != n_features) {
            return Err(BoostingError::RaggedRows {
                row,
                found: r.len(),
                expected: n_features,
            });
        }

        let n = y.len() as f64;
        let base_score = y.iter().sum::<f64>() / n;
        let variance = y.iter().map(|v| (v - base_score).powi(2)).sum::<f64>() / n;
        if !(variance >= config.min_target_variance) {
            return Err(BoostingError::DegenerateTarget {
                variance,
                threshold: config.min_target_variance,
            });
        }

        let data = BinnedMatrix::new(x, config.max_bins);
        let tree_config = config.tree_config();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut predictions = vec![base_score; y.len()];
        let mut importance = vec![0.0; n_features];
        let mut trees = Vec::with_capacity(config.n_trees);
        let hess = vec![1.0; y.len()];
        let all_rows: Vec<usize> = (0..y.len()).collect();

        for _ in 0..config.n_trees {
            let grad: Vec<f64> = predictions.iter().zip(y).map(|(p, t)| p - t).collect();

            let rows = if config.subsample < 1.0 {
                let k = ((config.subsample * n).round() as usize).clamp(1, y.len());
                let mut picked = sample(&mut rng, y.len(), k).into_vec();
                picked.sort_unstable();
                picked
            } else {
                all_rows.clone()
            };

            let tree = TreeBuilder::new(&tree_config, &data, &grad, &hess).build(&rows, &mut importance);
            for (pred, row) in predictions.iter_mut().zip(x) {
                *pred += config.learning_rate * tree.predict(row);
            }
            trees.push(tree);
        }

        let total: f64 = importance.iter().sum();
        if total > 0.0 {
            importance.iter_mut().for_each(|v| *v /= total);
        }

        Ok(Self {
            base_score,
            learning_rate: config.learning_rate,
            trees,
            importance,
        })
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        self.base_score
            + self.learning_rate * self.trees.iter().map(|t| t.predict(row)).sum::<f64>()
    }

    pub fn predict_batch(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        rows.iter().map(|r| self.predict(r)).collect()
    }

    pub fn feature_importance(&self) -> &[f64] {
        &self.importance
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn synthetic(n: usize, seed: u64) -> (Vec<Vec<f64>>, Vec<f64>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let x: Vec<Vec<f64>> = (0..n)
            .map(|_| vec![rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)])
            .collect();
        let y = x.iter().map(|r| r[0] * r[0] + 0.1 * r[0]).collect();
        (x, y)
    }

    fn mse(model: &GradientBoostedTrees, x: &[Vec<f64>], y: &[f64]) -> f64 {
        x.iter()
            .zip(y)
            .map(|(r, t)| (model.predict(r) - t).powi(2))
            .sum::<f64>()
            / y.len() as f64
    }

    #[test]
    fn test_boosting_beats_mean() {
        let (x, y) = synthetic(500, 1);
        let model = GradientBoostedTrees::fit(&x, &y, &BoostingConfig::default(), 3).unwrap();
        let mean = y.iter().sum::<f64>() / y.len() as f64;
        let baseline = y.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / y.len() as f64;

        assert_eq!(model.n_trees(), 200);
        assert!(mse(&model, &x, &y) < 0.2 * baseline);
        // Only the first feature carries signal
        assert!(model.feature_importance()[0] > model.feature_importance()[1]);
    }

    #[test]
    fn test_fit_is_reproducible() {
        let (x, y) = synthetic(200, 2);
        let config = BoostingConfig::default();
        let a = GradientBoostedTrees::fit(&x, &y, &config, 9).unwrap();
        let b = GradientBoostedTrees::fit(&x, &y, &config, 9).unwrap();
        assert_eq!(a.predict_batch(&x), b.predict_batch(&x));
    }

    #[test]
    fn test_constant_target_is_degenerate() {
        let x = vec![vec![1.0], vec![2.0], vec![3.0]];
        let result = GradientBoostedTrees::fit(&x, &[0.5; 3], &BoostingConfig::default(), 0);
        assert!(matches!(result, Err(BoostingError::DegenerateTarget { .. })));
    }

    #[test]
    fn test_empty_and_ragged_inputs() {
        let config = BoostingConfig::default();
        assert_eq!(
            GradientBoostedTrees::fit(&[], &[], &config, 0).unwrap_err(),
            BoostingError::EmptyTraining
        );
        let ragged = vec![vec![1.0, 2.0], vec![1.0]];
        assert!(matches!(
            GradientBoostedTrees::fit(&ragged, &[0.0, 1.0], &config, 0),
            Err(BoostingError::RaggedRows { row: 1, .. })
        ));
    }

    #[test]
    fn test_missing_features_are_tolerated() {
        let (mut x, y) = synthetic(300, 4);
        for row in x.iter_mut().step_by(5) {
            row[1] = f64::NAN;
        }
        let model = GradientBoostedTrees::fit(&x, &y, &BoostingConfig::default(), 1).unwrap();
        assert!(model.predict(&[0.5, f64::NAN]).is_finite());
    }
}
