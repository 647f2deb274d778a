//! Per-fold residual volatility forecaster.
//!
//! One fold is a pure function of `(window, panel)`: build lagged features
//! over the fold span, fit the selector and the ensemble on training rows,
//! predict every test row.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::features::builder::{FeatureBuilder, FeatureMatrix, LeakageError};
use crate::features::selection::{FeatureSelector, RetentionRule};
use crate::walkforward::periods::ForecastWindow;

use super::booster::{BoostingConfig, BoostingError, GradientBoostedTrees};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FoldError {
    #[error("Fold {fold_id}: {source}")]
    Leakage {
        fold_id: usize,
        #[source]
        source: LeakageError,
    },

    #[error("Fold {fold_id}: no training rows with a realized target")]
    EmptyTraining { fold_id: usize },

    #[error("Fold {fold_id}: {source}")]
    Boosting {
        fold_id: usize,
        #[source]
        source: BoostingError,
    },

    #[error("Fold {fold_id}: panicked: {message}")]
    Panicked { fold_id: usize, message: String },
}

impl FoldError {
    pub fn is_leakage(&self) -> bool {
        matches!(self, FoldError::Leakage { .. })
    }

    pub fn fold_id(&self) -> usize {
        match self {
            FoldError::Leakage { fold_id, .. }
            | FoldError::EmptyTraining { fold_id }
            | FoldError::Boosting { fold_id, .. }
            | FoldError::Panicked { fold_id, .. } => *fold_id,
        }
    }
}

/// One prediction for one market on one test date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub fold_id: usize,
    pub date: NaiveDate,
    pub market: String,
    /// `None` when the fold could not be trained.
    pub predicted: Option<f64>,
    /// `None` when the realized residual is not known.
    pub realized: Option<f64>,
    pub forecast_unavailable: bool,
    /// The realized residual came from a forward-filled filter estimate.
    pub degraded: bool,
}

impl ForecastRecord {
    /// Prediction and realization, when both are usable.
    pub fn pair(&self) -> Option<(f64, f64)> {
        if self.forecast_unavailable {
            return None;
        }
        match (self.predicted, self.realized) {
            (Some(p), Some(r)) if p.is_finite() && r.is_finite() => Some((p, r)),
            _ => None,
        }
    }
}

/// Everything one fold produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldOutput {
    pub window: ForecastWindow,
    pub records: Vec<ForecastRecord>,
    /// `None` when the fold was skipped as degenerate.
    pub selector: Option<FeatureSelector>,
    pub train_rows: usize,
    pub forecast_unavailable: bool,
}

/// Trains one boosted ensemble per forecast window.
#[derive(Debug, Clone)]
pub struct ResidualForecaster {
    boosting: BoostingConfig,
    retention: RetentionRule,
}

impl ResidualForecaster {
    pub fn new(boosting: BoostingConfig, retention: RetentionRule) -> Self {
        Self {
            boosting,
            retention,
        }
    }

    /// Seed used for everything random inside one fold.
    pub fn fold_seed(&self, fold_id: usize) -> u64 {
        self.boosting.seed ^ (fold_id as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }

    pub fn forecast_fold(
        &self,
        builder: &FeatureBuilder,
        window: &ForecastWindow,
    ) -> Result<FoldOutput, FoldError> {
        let fold_id = window.fold_id;
        let leak = |source| FoldError::Leakage { fold_id, source };

        if window.train.end > window.test.start || window.train_end >= window.test_start {
            return Err(leak(LeakageError::TrainTestOverlap {
                train_end: window.train_end,
                test_start: window.test_start,
            }));
        }

        let matrix = builder.build(window.span()).map_err(leak)?;

        let mut train = FeatureMatrix {
            names: matrix.names.clone(),
            rows: Vec::new(),
        };
        let mut targets = Vec::new();
        let mut test = FeatureMatrix {
            names: matrix.names.clone(),
            rows: Vec::new(),
        };
        for row in matrix.rows {
            if window.train.contains(&row.index) {
                let y = builder
                    .market_index(&row.market)
                    .map_or(f64::NAN, |m| builder.target(row.index, m));
                if y.is_finite() {
                    targets.push(y);
                    train.rows.push(row);
                }
            } else if window.test.contains(&row.index) {
                test.rows.push(row);
            }
        }

        if train.rows.is_empty() {
            return Err(FoldError::EmptyTraining { fold_id });
        }

        let n = targets.len() as f64;
        let mean = targets.iter().sum::<f64>() / n;
        let variance = targets.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n;
        if !(variance >= self.boosting.min_target_variance) {
            warn!(
                fold_id,
                variance, "Training target is degenerate, emitting unavailable forecasts"
            );
            return Ok(FoldOutput {
                records: self.records(builder, window, &test, None),
                window: window.clone(),
                selector: None,
                train_rows: train.rows.len(),
                forecast_unavailable: true,
            });
        }

        let seed = self.fold_seed(fold_id);
        let selector =
            FeatureSelector::fit(&train, &targets, &self.retention, &self.boosting, seed);
        let train = selector.apply(&train);
        let test = selector.apply(&test);

        let x: Vec<Vec<f64>> = train.rows.iter().map(|r| r.values.clone()).collect();
        let model = GradientBoostedTrees::fit(&x, &targets, &self.boosting, seed)
            .map_err(|source| FoldError::Boosting { fold_id, source })?;

        debug!(
            fold_id,
            train_rows = x.len(),
            features = selector.retained.len(),
            "Fold trained"
        );

        let predictions: Vec<f64> = test.rows.iter().map(|r| model.predict(&r.values)).collect();
        Ok(FoldOutput {
            records: self.records(builder, window, &test, Some(predictions.as_slice())),
            window: window.clone(),
            selector: Some(selector),
            train_rows: x.len(),
            forecast_unavailable: false,
        })
    }

    fn records(
        &self,
        builder: &FeatureBuilder,
        window: &ForecastWindow,
        test: &FeatureMatrix,
        predictions: Option<&[f64]>,
    ) -> Vec<ForecastRecord> {
        test.rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let m = builder.market_index(&row.market);
                let realized = m
                    .map(|m| builder.target(row.index, m))
                    .filter(|v| v.is_finite());
                ForecastRecord {
                    fold_id: window.fold_id,
                    date: row.date,
                    market: row.market.clone(),
                    predicted: predictions.map(|p| p[i]),
                    realized,
                    forecast_unavailable: predictions.is_none(),
                    degraded: m.is_some_and(|m| builder.is_degraded(row.index, m)),
                }
            })
            .collect()
    }
}
