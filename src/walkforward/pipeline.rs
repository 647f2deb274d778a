//! Staged walk-forward pipeline.
//!
//! 1. Align markets on a common calendar
//! 2. Filter pass: rolling GARCH residuals for every market
//! 3. Forecast pass: one pure task per fold, fanned out over a bounded pool
//! 4. Merge: deterministic sort on `(fold_id, date, market)`
//! 5. Validation and trading simulation on the merged stream

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::backtest::{MarketMoves, TradingResult, TradingSimulator};
use crate::config::{ConfigError, EngineConfig};
use crate::data::{Dataset, LoaderError, MarketSeries};
use crate::features::{FeatureBuilder, FeatureError, FeatureInputs, LeakageError};
use crate::forecast::{FoldError, FoldOutput, ForecastRecord, ResidualForecaster};
use crate::validation::{ValidationEngine, ValidationReport};
use crate::volatility::{ResidualSeries, VolatilityFilter};

use super::periods::{ForecastWindow, ScheduleError, WindowScheduler};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Data(#[from] LoaderError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Features(#[from] FeatureError),

    #[error("Leakage detected in fold {fold_id}: {source}")]
    Leakage {
        fold_id: usize,
        #[source]
        source: LeakageError,
    },

    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Dataset has no markets")]
    EmptyDataset,
}

/// Filter pass outcome for one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSummary {
    pub market: String,
    pub estimates: usize,
    pub degraded: usize,
}

/// Fold that was dropped without aborting the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedFold {
    pub fold_id: usize,
    pub reason: String,
}

/// Per-fold bookkeeping kept in the run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldSummary {
    pub window: ForecastWindow,
    pub train_rows: usize,
    pub test_records: usize,
    pub forecast_unavailable: bool,
    /// Features retained by the fold's selector.
    pub features: Vec<String>,
}

impl From<&FoldOutput> for FoldSummary {
    fn from(output: &FoldOutput) -> Self {
        Self {
            window: output.window.clone(),
            train_rows: output.train_rows,
            test_records: output.records.len(),
            forecast_unavailable: output.forecast_unavailable,
            features: output
                .selector
                .as_ref()
                .map(|s| s.retained.clone())
                .unwrap_or_default(),
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub markets: Vec<String>,
    pub calendar_len: usize,
    pub filter: Vec<FilterSummary>,
    pub expected_folds: usize,
    pub folds: Vec<FoldSummary>,
    pub failed_folds: Vec<FailedFold>,
    /// Sorted by `(fold_id, date, market)`.
    pub forecasts: Vec<ForecastRecord>,
    pub validation: ValidationReport,
    pub trading: TradingResult,
}

impl RunReport {
    pub fn summary(&self) -> String {
        let pooled = self.validation.pooled();
        let fmt = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |x| format!("{:.4}", x));
        format!(
            "Walk-Forward Results: {} markets, {} days\n\
             Folds: {}/{} ({} failed)\n\
             Forecasts: {} ({} unavailable)\n\
             Pooled IC: {}\n\
             Permutation p-value: {}\n\
             Fold IC mean / IR: {:.4} / {:.2}\n\
             \n\
             {}",
            self.markets.len(),
            self.calendar_len,
            self.folds.len(),
            self.expected_folds,
            self.failed_folds.len(),
            self.forecasts.len(),
            self.forecasts.iter().filter(|r| r.forecast_unavailable).count(),
            fmt(pooled.and_then(|p| p.spearman_ic)),
            fmt(pooled.and_then(|p| p.permutation_p_value)),
            self.validation.fold_ic.mean,
            self.validation.fold_ic.ir,
            self.trading.metrics.summary(),
        )
    }
}

/// Run one fold, turning a panic into a [`FoldError::Panicked`] for that fold.
fn isolate_fold<F>(fold_id: usize, fold: F) -> Result<FoldOutput, FoldError>
where
    F: FnOnce() -> Result<FoldOutput, FoldError>,
{
    panic::catch_unwind(AssertUnwindSafe(fold)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(FoldError::Panicked { fold_id, message })
    })
}

/// One-shot walk-forward pipeline.
pub struct Pipeline<'a> {
    config: &'a EngineConfig,
}

impl<'a> Pipeline<'a> {
    /// Validates the configuration before anything runs.
    pub fn new(config: &'a EngineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn run(&self, dataset: &Dataset) -> Result<RunReport, PipelineError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.runtime.threads)
            .build()?;
        pool.install(|| self.run_in_pool(dataset))
    }

    fn run_in_pool(&self, dataset: &Dataset) -> Result<RunReport, PipelineError> {
        if dataset.markets.is_empty() {
            return Err(PipelineError::EmptyDataset);
        }

        let calendar = dataset.common_calendar();
        if dataset.markets.iter().any(|m| m.len() != calendar.len()) {
            warn!(
                common = calendar.len(),
                "Markets disagree on dates; using the common calendar"
            );
        }
        let markets: Vec<MarketSeries> = dataset
            .markets
            .iter()
            .map(|m| m.aligned_to(&calendar))
            .collect::<Result<_, _>>()?;
        let names: Vec<String> = markets.iter().map(|m| m.market().to_string()).collect();

        // Fail fast if no fold can exist
        let scheduler = WindowScheduler::new(
            &calendar,
            self.config.filter.schedule(),
            self.config.forecast_schedule.clone(),
        );
        let windows: Vec<ForecastWindow> = scheduler.forecast_windows()?.collect();
        info!(
            markets = names.len(),
            days = calendar.len(),
            origin = scheduler.forecast_origin(),
            folds = windows.len(),
            "Generated forecast windows"
        );

        // Stage 1: filter pass
        let residuals = VolatilityFilter::new(self.config.filter.clone()).run(&markets)?;
        let filter: Vec<FilterSummary> = residuals
            .iter()
            .map(|r| FilterSummary {
                market: r.market.clone(),
                estimates: r.estimates.len(),
                degraded: r.degraded_count(),
            })
            .collect();
        for f in &filter {
            info!(
                market = %f.market,
                estimates = f.estimates,
                degraded = f.degraded,
                "Filter pass complete"
            );
        }

        // Stage 2: forecast pass
        let inputs = self.feature_inputs(dataset, &calendar, &names, &residuals);
        let builder = FeatureBuilder::new(self.config.features.clone(), inputs)?;
        let forecaster = ResidualForecaster::new(
            self.config.boosting.clone(),
            self.config.features.retention.clone(),
        );

        let progress = AtomicUsize::new(0);
        let total = windows.len();
        let outcomes: Vec<Result<FoldOutput, FoldError>> = windows
            .par_iter()
            .map(|window| {
                let outcome = isolate_fold(window.fold_id, || {
                    forecaster.forecast_fold(&builder, window)
                });

                let done = progress.fetch_add(1, Ordering::Relaxed) + 1;
                if done % (total / 10).max(1) == 0 || done == total {
                    info!(
                        "  Forecast pass: {:.0}% ({}/{} folds)",
                        done as f64 / total as f64 * 100.0,
                        done,
                        total
                    );
                }
                outcome
            })
            .collect();

        let mut folds = Vec::with_capacity(outcomes.len());
        let mut failed_folds = Vec::new();
        let mut forecasts = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(output) => {
                    folds.push(FoldSummary::from(&output));
                    forecasts.extend(output.records);
                }
                Err(FoldError::Leakage { fold_id, source }) => {
                    return Err(PipelineError::Leakage { fold_id, source });
                }
                Err(e) => {
                    warn!(fold_id = e.fold_id(), error = %e, "Fold failed; skipping");
                    failed_folds.push(FailedFold {
                        fold_id: e.fold_id(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        // Stage 3: merge
        forecasts.sort_by(|a, b| {
            (a.fold_id, a.date, &a.market).cmp(&(b.fold_id, b.date, &b.market))
        });
        info!(
            folds = folds.len(),
            failed = failed_folds.len(),
            records = forecasts.len(),
            "Forecast pass complete"
        );

        // Stage 4: both consumers read the same stream independently
        let validator = ValidationEngine::new(self.config.validation.clone());
        let simulator = TradingSimulator::new(self.config.trading.clone());
        let moves = MarketMoves::from_series(&markets);
        let (validation, trading) = rayon::join(
            || validator.evaluate(&forecasts),
            || simulator.simulate(&forecasts, &moves),
        );

        Ok(RunReport {
            markets: names,
            calendar_len: calendar.len(),
            filter,
            expected_folds: scheduler.expected_folds(),
            folds,
            failed_folds,
            forecasts,
            validation,
            trading,
        })
    }

    fn feature_inputs(
        &self,
        dataset: &Dataset,
        calendar: &[chrono::NaiveDate],
        names: &[String],
        residuals: &[ResidualSeries],
    ) -> FeatureInputs {
        let n = calendar.len();
        let mut dense_residuals = Vec::with_capacity(names.len());
        let mut degraded = Vec::with_capacity(names.len());
        for name in names {
            match residuals.iter().find(|r| &r.market == name) {
                Some(series) => {
                    dense_residuals.push(series.dense_residuals(n));
                    let mut flags = vec![false; n];
                    for e in series.estimates.iter().filter(|e| e.index < n) {
                        flags[e.index] = e.degraded;
                    }
                    degraded.push(flags);
                }
                None => {
                    dense_residuals.push(vec![f64::NAN; n]);
                    degraded.push(vec![false; n]);
                }
            }
        }

        let regimes = dataset
            .regimes
            .names()
            .iter()
            .filter_map(|name| {
                dataset
                    .regimes
                    .aligned_column(name, calendar)
                    .map(|values| (name.clone(), values))
            })
            .collect();

        FeatureInputs {
            calendar: calendar.to_vec(),
            markets: names.to_vec(),
            residuals: dense_residuals,
            regimes,
            degraded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SyntheticConfig, SyntheticGenerator};

    fn small_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.filter.window = 60;
        config.filter.min_obs = 40;
        config.filter.refit_every = 10;
        config.filter.garch.max_iterations = 300;
        config.forecast_schedule.train_len = 80;
        config.forecast_schedule.test_len = 20;
        config.boosting.n_trees = 20;
        config.boosting.min_samples_leaf = 5;
        config.validation.permutation_trials = 50;
        config.runtime.threads = 2;
        config
    }

    fn dataset(days: usize) -> Dataset {
        SyntheticGenerator::new(SyntheticConfig {
            days,
            markets: vec!["DE".into(), "FR".into()],
            seed: 3,
            noise: false,
            ..Default::default()
        })
        .generate()
        .unwrap()
    }

    #[test]
    fn test_run_produces_sorted_complete_stream() {
        let config = small_config();
        let report = Pipeline::new(&config).unwrap().run(&dataset(240)).unwrap();

        // origin 60, (240 - 60 - 80) / 20 = 5 folds
        assert_eq!(report.expected_folds, 5);
        assert_eq!(report.folds.len() + report.failed_folds.len(), 5);
        assert_eq!(report.forecasts.len(), report.folds.len() * 20 * 2);
        assert!(report
            .forecasts
            .windows(2)
            .all(|w| (w[0].fold_id, w[0].date, &w[0].market) < (w[1].fold_id, w[1].date, &w[1].market)));
        assert_eq!(report.filter.len(), 2);
        assert!(report.validation.pooled().is_some());
        assert_eq!(report.trading.daily.len(), report.folds.len() * 20);
    }

    #[test]
    fn test_run_is_reproducible() {
        let config = small_config();
        let data = dataset(200);
        let a = Pipeline::new(&config).unwrap().run(&data).unwrap();
        let b = Pipeline::new(&config).unwrap().run(&data).unwrap();
        assert_eq!(a.forecasts, b.forecasts);
        assert_eq!(a.validation.scores, b.validation.scores);
    }

    #[test]
    fn test_insufficient_history_is_reported() {
        let config = small_config();
        let err = Pipeline::new(&config).unwrap().run(&dataset(100)).unwrap_err();
        assert!(matches!(err, PipelineError::Schedule(_)));
    }

    #[test]
    fn test_invalid_config_is_rejected_up_front() {
        let mut config = small_config();
        config.forecast_schedule.test_len = 0;
        assert!(matches!(Pipeline::new(&config), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_panicking_fold_is_isolated() {
        let outcome = isolate_fold(3, || panic!("tree builder exploded"));
        assert_eq!(
            outcome.unwrap_err(),
            FoldError::Panicked {
                fold_id: 3,
                message: "tree builder exploded".to_string(),
            }
        );

        let outcome = isolate_fold(4, || Err(FoldError::EmptyTraining { fold_id: 4 }));
        assert_eq!(outcome.unwrap_err(), FoldError::EmptyTraining { fold_id: 4 });
    }
}
