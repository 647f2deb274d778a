//! Histogram-based regression tree fitted to first/second order gradients.
//!
//! Split gains and leaf weights carry L1 (soft threshold) and L2 penalties:
//!
//! ```text
//! w     = -T(G) / (H + l2)
//! score = T(G)^2 / (H + l2)
//! T(G)  = sign(G) * max(|G| - l1, 0)
//! ```
//!
//! Missing values (`NaN`) always follow the left branch.

use serde::{Deserialize, Serialize};

/// Bin index reserved for missing values.
pub const MISSING_BIN: u16 = u16::MAX;

/// Tree growth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub l1: f64,
    pub l2: f64,
    /// Minimum gain required to split a node.
    pub min_split_gain: f64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            min_samples_leaf: 10,
            l1: 0.0,
            l2: 1.0,
            min_split_gain: 0.0,
        }
    }
}

/// Tree node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TreeNode {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

impl TreeNode {
    pub fn predict(&self, row: &[f64]) -> f64 {
        match self {
            TreeNode::Leaf { value } => *value,
            TreeNode::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                let v = row[*feature];
                if v.is_nan() || v <= *threshold {
                    left.predict(row)
                } else {
                    right.predict(row)
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            TreeNode::Leaf { .. } => 0,
            TreeNode::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }
}

/// Quantile split candidates of every feature, with rows pre-binned.
#[derive(Debug, Clone)]
pub struct BinnedMatrix {
    /// `thresholds[feature]`, strictly increasing.
    pub thresholds: Vec<Vec<f64>>,
    /// `bins[row][feature]`, [`MISSING_BIN`] for `NaN`.
    pub bins: Vec<Vec<u16>>,
}

impl BinnedMatrix {
    pub fn new(x: &[Vec<f64>], max_bins: usize) -> Self {
        let n_features = x.first().map_or(0, |r| r.len());
        let thresholds: Vec<Vec<f64>> = (0..n_features)
            .map(|f| quantile_thresholds(x.iter().map(|r| r[f]), max_bins))
            .collect();
        let bins = x
            .iter()
            .map(|row| {
                row.iter()
                    .zip(&thresholds)
                    .map(|(v, t)| bin_of(*v, t))
                    .collect()
            })
            .collect();
        Self { thresholds, bins }
    }

    pub fn n_features(&self) -> usize {
        self.thresholds.len()
    }
}

/// Up to `max_bins - 1` distinct cut points between quantiles of the finite values.
fn quantile_thresholds(values: impl Iterator<Item = f64>, max_bins: usize) -> Vec<f64> {
    let mut finite: Vec<f64> = values.filter(|v| v.is_finite()).collect();
    if finite.len() < 2 {
        return Vec::new();
    }
    finite.sort_by(|a, b| a.total_cmp(b));
    let max_bins = max_bins.clamp(2, MISSING_BIN as usize);
    let n = finite.len();
    let mut cuts: Vec<f64> = (1..max_bins)
        .map(|b| finite[(b * n / max_bins).min(n - 1)])
        .collect();
    cuts.dedup();
    // A cut at the maximum would leave the right side empty
    let max = finite[n - 1];
    cuts.retain(|c| *c < max);
    cuts
}

fn bin_of(value: f64, thresholds: &[f64]) -> u16 {
    if value.is_nan() {
        return MISSING_BIN;
    }
    thresholds.partition_point(|t| *t < value) as u16
}

fn soft_threshold(g: f64, l1: f64) -> f64 {
    if g > l1 {
        g - l1
    } else if g < -l1 {
        g + l1
    } else {
        0.0
    }
}

fn leaf_score(g: f64, h: f64, config: &TreeConfig) -> f64 {
    let t = soft_threshold(g, config.l1);
    t * t / (h + config.l2).max(1e-12)
}

fn leaf_weight(g: f64, h: f64, config: &TreeConfig) -> f64 {
    -soft_threshold(g, config.l1) / (h + config.l2).max(1e-12)
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    bin: usize,
    gain: f64,
}

/// Fits one tree; accumulates split gains into `importance`.
pub struct TreeBuilder<'a> {
    config: &'a TreeConfig,
    data: &'a BinnedMatrix,
    grad: &'a [f64],
    hess: &'a [f64],
}

impl<'a> TreeBuilder<'a> {
    pub fn new(
        config: &'a TreeConfig,
        data: &'a BinnedMatrix,
        grad: &'a [f64],
        hess: &'a [f64],
    ) -> Self {
        Self {
            config,
            data,
            grad,
            hess,
        }
    }

    pub fn build(&self, rows: &[usize], importance: &mut [f64]) -> TreeNode {
        self.grow(rows, 0, importance)
    }

    fn grow(&self, rows: &[usize], depth: usize, importance: &mut [f64]) -> TreeNode {
        let g: f64 = rows.iter().map(|&r| self.grad[r]).sum();
        let h: f64 = rows.iter().map(|&r| self.hess[r]).sum();
        let leaf = TreeNode::Leaf {
            value: leaf_weight(g, h, self.config),
        };

        if depth >= self.config.max_depth || rows.len() < 2 * self.config.min_samples_leaf.max(1) {
            return leaf;
        }

        let Some(best) = self.best_split(rows, g, h) else {
            return leaf;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows.iter().partition(|&&r| {
            let b = self.data.bins[r][best.feature];
            b == MISSING_BIN || (b as usize) <= best.bin
        });

        importance[best.feature] += best.gain;
        TreeNode::Split {
            feature: best.feature,
            threshold: self.data.thresholds[best.feature][best.bin],
            left: Box::new(self.grow(&left_rows, depth + 1, importance)),
            right: Box::new(self.grow(&right_rows, depth + 1, importance)),
        }
    }

    fn best_split(&self, rows: &[usize], g: f64, h: f64) -> Option<SplitCandidate> {
        let parent = leaf_score(g, h, self.config);
        let min_leaf = self.config.min_samples_leaf.max(1);
        let mut best: Option<SplitCandidate> = None;

        for feature in 0..self.data.n_features() {
            let n_cuts = self.data.thresholds[feature].len();
            if n_cuts == 0 {
                continue;
            }

            // Histogram over value bins; missing rows start on the left
            let mut hist_g = vec![0.0; n_cuts + 1];
            let mut hist_h = vec![0.0; n_cuts + 1];
            let mut hist_n = vec![0usize; n_cuts + 1];
            let (mut gl, mut hl, mut nl) = (0.0, 0.0, 0usize);
            for &r in rows {
                let b = self.data.bins[r][feature];
                if b == MISSING_BIN {
                    gl += self.grad[r];
                    hl += self.hess[r];
                    nl += 1;
                } else {
                    let b = b as usize;
                    hist_g[b] += self.grad[r];
                    hist_h[b] += self.hess[r];
                    hist_n[b] += 1;
                }
            }

            for bin in 0..n_cuts {
                gl += hist_g[bin];
                hl += hist_h[bin];
                nl += hist_n[bin];
                let nr = rows.len() - nl;
                if nl < min_leaf || nr < min_leaf {
                    continue;
                }
                let gain = 0.5
                    * (leaf_score(gl, hl, self.config) + leaf_score(g - gl, h - hl, self.config)
                        - parent);
                if gain > self.config.min_split_gain
                    && best.map_or(true, |b| gain > b.gain + 1e-15)
                {
                    best = Some(SplitCandidate { feature, bin, gain });
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fit_single(x: &[Vec<f64>], y: &[f64], config: &TreeConfig) -> (TreeNode, Vec<f64>) {
        let data = BinnedMatrix::new(x, 16);
        // Squared loss around a zero prediction
        let grad: Vec<f64> = y.iter().map(|v| -v).collect();
        let hess = vec![1.0; y.len()];
        let rows: Vec<usize> = (0..y.len()).collect();
        let mut importance = vec![0.0; data.n_features()];
        let tree = TreeBuilder::new(config, &data, &grad, &hess).build(&rows, &mut importance);
        (tree, importance)
    }

    #[test]
    fn test_quantile_thresholds() {
        let cuts = quantile_thresholds((0..100).map(|i| i as f64), 4);
        assert_eq!(cuts, vec![25.0, 50.0, 75.0]);
        assert!(quantile_thresholds([1.0, 1.0, 1.0].into_iter(), 4).is_empty());
        assert!(quantile_thresholds([f64::NAN, 2.0].into_iter(), 4).is_empty());
    }

    #[test]
    fn test_soft_threshold() {
        assert_eq!(soft_threshold(3.0, 1.0), 2.0);
        assert_eq!(soft_threshold(-3.0, 1.0), -2.0);
        assert_eq!(soft_threshold(0.5, 1.0), 0.0);
    }

    #[test]
    fn test_tree_learns_step_function() {
        let x: Vec<Vec<f64>> = (0..100).map(|i| vec![i as f64, (i % 7) as f64]).collect();
        // Step placed on a quantile cut (50 is the 8th of 15)
        let y: Vec<f64> = (0..100).map(|i| if i <= 50 { -1.0 } else { 1.0 }).collect();
        let config = TreeConfig {
            max_depth: 1,
            min_samples_leaf: 5,
            l2: 0.0,
            ..Default::default()
        };
        let (tree, importance) = fit_single(&x, &y, &config);

        assert_eq!(tree.depth(), 1);
        assert!((tree.predict(&[10.0, 0.0]) + 1.0).abs() < 1e-9);
        assert!((tree.predict(&[90.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(importance[0] > 0.0);
        assert_eq!(importance[1], 0.0);
    }

    #[test]
    fn test_missing_values_go_left() {
        let tree = TreeNode::Split {
            feature: 0,
            threshold: 0.0,
            left: Box::new(TreeNode::Leaf { value: -1.0 }),
            right: Box::new(TreeNode::Leaf { value: 1.0 }),
        };
        assert_eq!(tree.predict(&[f64::NAN]), -1.0);
        assert_eq!(tree.predict(&[0.5]), 1.0);
    }

    #[test]
    fn test_l2_shrinks_leaves() {
        let x: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64]).collect();
        let y = vec![2.0; 20];
        let loose = TreeConfig {
            max_depth: 0,
            l2: 0.0,
            ..Default::default()
        };
        let tight = TreeConfig {
            max_depth: 0,
            l2: 20.0,
            ..Default::default()
        };
        let (a, _) = fit_single(&x, &y, &loose);
        let (b, _) = fit_single(&x, &y, &tight);
        assert!((a.predict(&[0.0]) - 2.0).abs() < 1e-12);
        assert!((b.predict(&[0.0]) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_min_samples_leaf_blocks_split() {
        let x: Vec<Vec<f64>> = (0..10).map(|i| vec![i as f64]).collect();
        let y: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let config = TreeConfig {
            min_samples_leaf: 6,
            ..Default::default()
        };
        let (tree, _) = fit_single(&x, &y, &config);
        assert_eq!(tree.depth(), 0);
    }
}
