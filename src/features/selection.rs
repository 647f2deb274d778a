//! Training-fold feature selection.
//!
//! A [`FeatureSelector`] is fitted from training rows only and is then a
//! plain value: the same retained column list is projected onto train and
//! test rows of the fold.

use serde::{Deserialize, Serialize};

use crate::forecast::booster::{BoostingConfig, GradientBoostedTrees};
use crate::validation::rank::spearman;

use super::builder::FeatureMatrix;

/// How many features survive selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetentionRule {
    /// Keep the `k` features with the largest |Spearman| against the target.
    TopKCorrelation { k: usize },
    /// Keep every feature with |Spearman| at least `min_abs`.
    CorrelationThreshold { min_abs: f64 },
    /// Keep the `k` features with the largest gain in a preliminary boosted fit.
    TopKImportance { k: usize },
}

impl Default for RetentionRule {
    fn default() -> Self {
        RetentionRule::TopKCorrelation { k: 12 }
    }
}

/// Score given to one candidate feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScore {
    pub name: String,
    pub score: f64,
}

/// Retained feature set of one fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSelector {
    pub rule: RetentionRule,
    pub retained: Vec<String>,
    pub scores: Vec<FeatureScore>,
}

impl FeatureSelector {
    /// Fit on `train` rows and their `targets`.
    ///
    /// Features with no usable score rank last. If the rule would retain
    /// nothing, the single best-scored feature is kept.
    pub fn fit(
        train: &FeatureMatrix,
        targets: &[f64],
        rule: &RetentionRule,
        boosting: &BoostingConfig,
        seed: u64,
    ) -> Self {
        let raw: Vec<f64> = match rule {
            RetentionRule::TopKCorrelation { .. } | RetentionRule::CorrelationThreshold { .. } => {
                (0..train.names.len())
                    .map(|c| {
                        spearman(&train.column(c), targets)
                            .map(f64::abs)
                            .unwrap_or(f64::NAN)
                    })
                    .collect()
            }
            RetentionRule::TopKImportance { .. } => {
                let x: Vec<Vec<f64>> = train.rows.iter().map(|r| r.values.clone()).collect();
                match GradientBoostedTrees::fit(&x, targets, boosting, seed) {
                    Ok(model) => model.feature_importance().to_vec(),
                    Err(_) => vec![f64::NAN; train.names.len()],
                }
            }
        };

        let mut scores: Vec<FeatureScore> = train
            .names
            .iter()
            .zip(raw)
            .map(|(name, score)| FeatureScore {
                name: name.clone(),
                score,
            })
            .collect();
        // Descending score, NaN last, ties by name
        scores.sort_by(|a, b| {
            let key = |s: f64| if s.is_nan() { f64::NEG_INFINITY } else { s };
            key(b.score)
                .total_cmp(&key(a.score))
                .then_with(|| a.name.cmp(&b.name))
        });

        let mut retained: Vec<String> = match rule {
            RetentionRule::TopKCorrelation { k } | RetentionRule::TopKImportance { k } => scores
                .iter()
                .filter(|s| !s.score.is_nan())
                .take(*k)
                .map(|s| s.name.clone())
                .collect(),
            RetentionRule::CorrelationThreshold { min_abs } => scores
                .iter()
                .filter(|s| s.score >= *min_abs)
                .map(|s| s.name.clone())
                .collect(),
        };
        if retained.is_empty() {
            if let Some(best) = scores.first() {
                retained.push(best.name.clone());
            }
        }

        Self {
            rule: rule.clone(),
            retained,
            scores,
        }
    }

    /// Project any matrix of the same fold onto the retained columns.
    pub fn apply(&self, matrix: &FeatureMatrix) -> FeatureMatrix {
        matrix.project(&self.retained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::builder::FeatureVector;
    use chrono::NaiveDate;

    fn matrix(columns: &[(&str, Vec<f64>)]) -> FeatureMatrix {
        let n = columns[0].1.len();
        let date = NaiveDate::from_ymd_opt(2022, 1, 1).unwrap();
        FeatureMatrix {
            names: columns.iter().map(|(n, _)| n.to_string()).collect(),
            rows: (0..n)
                .map(|i| FeatureVector {
                    date,
                    market: "DE".into(),
                    index: i,
                    values: columns.iter().map(|(_, c)| c[i]).collect(),
                    latest_source: None,
                })
                .collect(),
        }
    }

    fn sample() -> (FeatureMatrix, Vec<f64>) {
        let target: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let m = matrix(&[
            ("noise", (0..50).map(|i| ((i * 37) % 11) as f64).collect()),
            ("signal", target.iter().map(|t| t * 2.0).collect()),
            ("inverse", target.iter().map(|t| -t).collect()),
            ("half", (0..50).map(|i| if i < 25 { 0.0 } else { 1.0 }).collect()),
        ]);
        (m, target)
    }

    #[test]
    fn test_top_k_correlation_breaks_ties_by_name() {
        let (m, y) = sample();
        let selector = FeatureSelector::fit(
            &m,
            &y,
            &RetentionRule::TopKCorrelation { k: 2 },
            &BoostingConfig::default(),
            0,
        );
        // signal and inverse both score 1.0
        assert_eq!(selector.retained, vec!["inverse", "signal"]);
    }

    #[test]
    fn test_threshold_rule() {
        let (m, y) = sample();
        let selector = FeatureSelector::fit(
            &m,
            &y,
            &RetentionRule::CorrelationThreshold { min_abs: 0.8 },
            &BoostingConfig::default(),
            0,
        );
        assert!(selector.retained.contains(&"signal".to_string()));
        assert!(selector.retained.contains(&"half".to_string()));
        assert!(!selector.retained.contains(&"noise".to_string()));
    }

    #[test]
    fn test_threshold_keeps_best_when_nothing_passes() {
        let (m, y) = sample();
        let selector = FeatureSelector::fit(
            &m,
            &y,
            &RetentionRule::CorrelationThreshold { min_abs: 2.0 },
            &BoostingConfig::default(),
            0,
        );
        assert_eq!(selector.retained, vec!["inverse"]);
    }

    #[test]
    fn test_importance_rule() {
        let (m, y) = sample();
        let selector = FeatureSelector::fit(
            &m,
            &y,
            &RetentionRule::TopKImportance { k: 1 },
            &BoostingConfig::default(),
            0,
        );
        assert_eq!(selector.retained.len(), 1);
        assert_ne!(selector.retained[0], "noise");
    }

    #[test]
    fn test_all_nan_column_ranks_last() {
        let (mut m, y) = sample();
        for row in m.rows.iter_mut() {
            row.values[1] = f64::NAN;
        }
        let selector = FeatureSelector::fit(
            &m,
            &y,
            &RetentionRule::TopKCorrelation { k: 4 },
            &BoostingConfig::default(),
            0,
        );
        assert_eq!(selector.scores.last().unwrap().name, "signal");
        assert!(!selector.retained.contains(&"signal".to_string()));
    }

    #[test]
    fn test_apply_projects_columns() {
        let (m, y) = sample();
        let selector = FeatureSelector::fit(
            &m,
            &y,
            &RetentionRule::TopKCorrelation { k: 1 },
            &BoostingConfig::default(),
            0,
        );
        let projected = selector.apply(&m);
        assert_eq!(projected.names, vec!["inverse"]);
        assert_eq!(projected.rows[3].values, vec![-3.0]);
    }
}
